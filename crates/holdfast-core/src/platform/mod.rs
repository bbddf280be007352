//! # Substrate Implementations
//!
//! Concrete instrumentation hosts behind the [`Substrate`](crate::substrate::Substrate)
//! contract.
//!
//! - **emulated**: an in-memory target with mapped regions, debug-register
//!   banks and an instruction table. Drives the test-suite and the binary's
//!   `serve` and `demo` modes.
//!
//! Hosts that embed the agent into a live process implement the same traits
//! over their own memory, thread and exception APIs.

pub mod emulated;
