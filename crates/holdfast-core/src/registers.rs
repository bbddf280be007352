//! Register access for the paused thread.
//!
//! Registers are only reachable while the trap coordinator holds a pause
//! context; outside a pause every call fails with `StateError`.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{HoldfastError, HoldfastResult};
use crate::exception::TrapCoordinator;
use crate::types::{Address, RegisterId, RegisterInput, RegisterKind, RegisterValue, VectorRegisterValue};

/// Outcome of a register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterWrite
{
    /// The snapshot was updated
    Applied,
    /// The value's shape doesn't fit the register; nothing changed
    Ignored,
}

impl RegisterWrite
{
    /// `true` if the snapshot changed.
    #[must_use]
    pub const fn is_applied(self) -> bool
    {
        matches!(self, RegisterWrite::Applied)
    }
}

/// Reads and writes registers of the paused thread by name.
#[derive(Debug, Clone)]
pub struct RegisterAccessor
{
    coordinator: Arc<TrapCoordinator>,
}

impl RegisterAccessor
{
    /// Create an accessor over the coordinator's pause context.
    #[must_use]
    pub fn new(coordinator: Arc<TrapCoordinator>) -> Self
    {
        Self { coordinator }
    }

    /// Read register `name` of the paused thread.
    ///
    /// ## Errors
    ///
    /// - `StateError`: no thread is paused
    /// - `InvalidArgument`: `name` is not a register of the target architecture
    pub fn read_register(&self, name: &str) -> HoldfastResult<RegisterValue>
    {
        self.coordinator.with_registers(|registers| {
            let id = RegisterId::parse(name, registers.architecture())?;
            registers
                .get(id)
                .ok_or_else(|| HoldfastError::InvalidArgument(format!("register {name:?} is not captured")))
        })?
    }

    /// Write register `name` of the paused thread
    ///
    /// The input must match the register's kind: a number or address text for
    /// scalar registers, exactly 16 bytes for vector registers. A mismatched
    /// shape leaves the register untouched and returns
    /// [`RegisterWrite::Ignored`].
    ///
    /// ## Errors
    ///
    /// - `StateError`: no thread is paused
    /// - `InvalidArgument`: unknown register name, or address text that doesn't parse
    pub fn write_register(&self, name: &str, input: RegisterInput) -> HoldfastResult<RegisterWrite>
    {
        self.coordinator.with_registers_mut(|registers| {
            let id = RegisterId::parse(name, registers.architecture())?;
            let value = shape_input(id.kind(), input)?;
            match value.and_then(|value| registers.set(id, value)) {
                Some(()) => {
                    debug!(register = name, "Register written");
                    Ok(RegisterWrite::Applied)
                }
                None => {
                    warn!(register = name, kind = ?id.kind(), "Register write ignored: value shape does not match");
                    Ok(RegisterWrite::Ignored)
                }
            }
        })?
    }
}

fn shape_input(kind: RegisterKind, input: RegisterInput) -> HoldfastResult<Option<RegisterValue>>
{
    let value = match (kind, input) {
        (RegisterKind::Vector, RegisterInput::Bytes(bytes)) => {
            VectorRegisterValue::from_slice(&bytes).map(RegisterValue::Vector)
        }
        (RegisterKind::Address, RegisterInput::Number(raw)) => Some(RegisterValue::Address(Address::from(raw))),
        (RegisterKind::Numeric, RegisterInput::Number(raw)) => Some(RegisterValue::Numeric(raw)),
        (RegisterKind::Address, RegisterInput::Text(text)) => Some(RegisterValue::Address(text.parse()?)),
        (RegisterKind::Numeric, RegisterInput::Text(text)) => {
            Some(RegisterValue::Numeric(text.parse::<Address>()?.value()))
        }
        _ => None,
    };
    Ok(value)
}
