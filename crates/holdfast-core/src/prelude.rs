//! Common module for library exports

pub use crate::agent::{Agent, AgentOptions};
pub use crate::error::{HoldfastError, HoldfastResult};
pub use crate::events::AgentEvent;
pub use crate::exception::CoordinatorState;
pub use crate::registers::RegisterWrite;
pub use crate::stoppoints::{Stoppoint, StoppointMode};
pub use crate::substrate::{AccessKind, Substrate, TrapDisposition, TrapKind};
pub use crate::types::{Address, Architecture, MemoryRange, Protection, RegisterInput, RegisterValue, Scalar, ThreadId, Width};
