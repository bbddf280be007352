//! # Error Types
//!
//! General error handling for the agent.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages.

use thiserror::Error;

use crate::types::Address;

/// Main error type for agent operations
///
/// This enum represents all the ways a control-channel operation can fail.
/// Each variant corresponds to a specific error condition that can occur
/// while managing stoppoints, scanning memory or touching a paused thread.
///
/// ## Error Categories
///
/// 1. **Resource errors**: ResourceExhausted (hardware breakpoint/watchpoint slots)
/// 2. **Lookup errors**: NotFound (remove/unfreeze on an untracked address)
/// 3. **Argument errors**: InvalidArgument (unsupported width, malformed mode)
/// 4. **State errors**: StateError (register access while running, scans without a first scan)
/// 5. **Memory errors**: MemoryAccess (unmapped or protected addresses)
/// 6. **Substrate errors**: Substrate (the instrumentation host refused an operation)
/// 7. **I/O errors**: Io (for file operations, etc.)
#[derive(Error, Debug)]
pub enum HoldfastError
{
    /// A required hardware resource has been exhausted
    ///
    /// This error occurs when every slot of a trap bank is in use:
    ///
    /// - **Breakpoints**: CPU execution debug registers are full
    ///   - x86-64: Maximum 4 (DR0-DR3)
    ///   - ARM64: Maximum 16 (DBGBVR0-15), usually fewer exposed by the kernel
    /// - **Watchpoints**: Data watchpoint registers are full
    ///
    /// ## Solution
    ///
    /// Remove an existing stoppoint of the same kind before adding a new one.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The addressed item is not tracked
    ///
    /// Raised by `removeStoppoint` and `unfreeze` (and `updateFrozenValue`)
    /// when nothing is registered at the given address.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid argument passed to an agent operation
    ///
    /// Examples:
    /// - A scalar width outside {1, 2, 4, 8}
    /// - A stoppoint mode other than `r`, `w`, `rw` or `x`
    /// - An unknown register name
    /// - A page size of zero
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not valid in the current state
    ///
    /// This error occurs when:
    /// - Registers are read or written while no thread is paused
    /// - `nextScan` / `getScanResults` are called before a `firstScan`
    /// - `resume` is sent while nothing is paused
    #[error("Invalid state: {0}")]
    StateError(String),

    /// Reading or writing target memory failed
    ///
    /// The address is unmapped, or its protection forbids the access.
    #[error("Memory access failed at {address}: {details}")]
    MemoryAccess
    {
        /// First address of the failed access
        address: Address,
        /// Description reported by the substrate
        details: String,
    },

    /// The instrumentation substrate rejected or failed an operation
    ///
    /// Used for trap installation failures, decoder failures, patching and
    /// hook errors that don't map onto a more specific category.
    #[error("Substrate error: {0}")]
    Substrate(String),

    /// I/O error (for file operations, etc.)
    ///
    /// This is a standard Rust `std::io::Error` converted to our error type.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HoldfastError
{
    /// Short taxonomy name used on the control channel.
    #[must_use]
    pub fn kind(&self) -> &'static str
    {
        match self {
            Self::ResourceExhausted(_) => "ResourceExhausted",
            Self::NotFound(_) => "NotFound",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::StateError(_) => "StateError",
            Self::MemoryAccess { .. } => "MemoryAccess",
            Self::Substrate(_) => "Substrate",
            Self::Io(_) => "Io",
        }
    }

    /// Convenience constructor for memory access failures.
    pub fn memory(address: Address, details: impl Into<String>) -> Self
    {
        Self::MemoryAccess {
            address,
            details: details.into(),
        }
    }
}

/// Convenience type alias for `Result<T, HoldfastError>`
///
/// ```rust
/// use holdfast_core::error::HoldfastResult;
/// fn foo() -> HoldfastResult<()>
/// {
///     Ok(())
/// }
/// ```
pub type HoldfastResult<T> = std::result::Result<T, HoldfastError>;
