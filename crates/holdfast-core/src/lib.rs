//! # holdfast-core
//!
//! In-process debugging and live memory-inspection engine for Holdfast.
//!
//! This crate provides the core of the agent:
//! - Hardware breakpoints and watchpoints with slot allocation
//! - The process-wide trap handler that pauses the control thread on a hit
//! - Register access while paused
//! - Progressive value scanning and string search
//! - Value freezing on a background loop
//!
//! ## Substrates
//!
//! The agent never talks to the CPU or the OS itself. Everything goes through
//! the [`substrate::Substrate`] traits, implemented by the instrumentation
//! host that embeds the agent:
//!
//! - **emulated**: [`platform::emulated::EmulatedTarget`], an in-memory target
//!   used by the tests and the `holdfast` binary
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use holdfast_core::platform::emulated::EmulatedTarget;
//! use holdfast_core::prelude::*;
//!
//! let target = Arc::new(EmulatedTarget::new(Architecture::X86_64));
//! target.map(Address::from(0x10000), 0x1000, Protection::READ_WRITE, None)?;
//!
//! let (agent, _events) = Agent::new(target, AgentOptions::default());
//! agent.write(Address::from(0x10010), Scalar::from(42u32), Width::Four, false)?;
//! assert_eq!(agent.first_scan(Scalar::from(42u32), Width::Four, false)?, 1);
//! assert_eq!(agent.add_stoppoint(Address::from(0x10010), StoppointMode::Write, 4)?, 0);
//! # Ok::<(), holdfast_core::error::HoldfastError>(())
//! ```

pub mod agent;
pub mod error;
pub mod events;
pub mod exception;
pub mod freeze;
pub mod hooks;
pub mod memory;
pub mod platform;
pub mod prelude;
pub mod registers;
pub mod scan;
pub mod stoppoints;
pub mod substrate;
pub mod types;

pub use agent::{Agent, AgentOptions};
// Re-export commonly used types
pub use error::{HoldfastError, HoldfastResult};
pub use events::AgentEvent;
pub use types::{Address, Scalar, Width};
