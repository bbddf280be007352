//! # Types
//!
//! Substrate-agnostic types used throughout the agent.
//!
//! These types abstract away host-specific details, allowing the stoppoint,
//! scan and freeze machinery to work with concepts like "address", "range"
//! and "register" without knowing which instrumentation host is underneath.

pub mod address;
pub mod memory;
pub mod process;
pub mod registers;
pub mod value;

// Re-export all public types
pub use address::Address;
pub use memory::{MemoryMap, MemoryRange, Protection};
pub use process::{Architecture, ThreadId};
pub use registers::{
    Arm64Register, FloatingPointState, FloatingRegister, RegisterContext, RegisterId, RegisterInput, RegisterKind,
    RegisterValue, VectorRegisterValue, X86_64Register,
};
pub use value::{Scalar, Width};
