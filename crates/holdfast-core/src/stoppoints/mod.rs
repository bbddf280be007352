//! # Stoppoints
//!
//! Breakpoint and watchpoint bookkeeping.
//!
//! A *stoppoint* is either an execution breakpoint (mode `x`) or a data
//! watchpoint (modes `r`, `w`, `rw`). Both are backed by hardware debug
//! registers on the control thread, drawn from two independent
//! [`SlotBank`]s. The [`StoppointManager`] owns those banks and the tables of
//! active stoppoints, and is the only thing that programs the debug registers
//! through [`HardwareTraps`](crate::substrate::HardwareTraps).
//!
//! ## Invariants
//!
//! - A slot is unique within its bank.
//! - An address is unique among the active stoppoints of one bank.
//! - New stoppoints always take the smallest free slot of their bank.
//!
//! ## Persistence
//!
//! The trap coordinator consumes a breakpoint when it fires
//! ([`StoppointManager::take_breakpoint`]); it must be re-armed to fire again.
//! Watchpoints stay armed until explicitly removed.

mod bank;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use bank::SlotBank;
use tracing::{debug, info, warn};

use crate::error::{HoldfastError, HoldfastResult};
use crate::substrate::{AccessKind, Substrate};
use crate::types::{Address, Width};

/// What a stoppoint triggers on.
///
/// Parsed from the operator-facing strings `r`, `w`, `rw` and `x`.
///
/// ```rust
/// use holdfast_core::stoppoints::StoppointMode;
///
/// let mode: StoppointMode = "rw".parse()?;
/// assert_eq!(mode, StoppointMode::ReadWrite);
/// assert!("y".parse::<StoppointMode>().is_err());
/// # Ok::<(), holdfast_core::error::HoldfastError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoppointMode
{
    /// Data watchpoint on loads
    Read,
    /// Data watchpoint on stores
    Write,
    /// Data watchpoint on loads and stores
    ReadWrite,
    /// Execution breakpoint
    Execute,
}

impl StoppointMode
{
    /// `true` for execution breakpoints.
    #[must_use]
    pub const fn is_execute(self) -> bool
    {
        matches!(self, StoppointMode::Execute)
    }

    /// Access kind programmed into a data watchpoint; `None` for breakpoints.
    #[must_use]
    pub const fn access(self) -> Option<AccessKind>
    {
        match self {
            StoppointMode::Read => Some(AccessKind::Read),
            StoppointMode::Write => Some(AccessKind::Write),
            StoppointMode::ReadWrite => Some(AccessKind::ReadWrite),
            StoppointMode::Execute => None,
        }
    }

    /// Whether a watchpoint in this mode fires for an `access`.
    ///
    /// Matches when the kinds are equal or when either side is read-write.
    /// Breakpoints never match a data access.
    #[must_use]
    pub fn matches(self, access: AccessKind) -> bool
    {
        match self.access() {
            None => false,
            Some(watched) => {
                watched == access || watched == AccessKind::ReadWrite || access == AccessKind::ReadWrite
            }
        }
    }

    /// Operator-facing form.
    #[must_use]
    pub const fn as_str(self) -> &'static str
    {
        match self {
            StoppointMode::Read => "r",
            StoppointMode::Write => "w",
            StoppointMode::ReadWrite => "rw",
            StoppointMode::Execute => "x",
        }
    }
}

impl FromStr for StoppointMode
{
    type Err = HoldfastError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s {
            "r" => Ok(StoppointMode::Read),
            "w" => Ok(StoppointMode::Write),
            "rw" => Ok(StoppointMode::ReadWrite),
            "x" => Ok(StoppointMode::Execute),
            other => Err(HoldfastError::InvalidArgument(format!(
                "malformed stoppoint mode {other:?} (expected r, w, rw or x)"
            ))),
        }
    }
}

impl fmt::Display for StoppointMode
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.as_str())
    }
}

/// An active breakpoint or watchpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stoppoint
{
    /// Watched or breakpointed address
    pub address: Address,
    /// Trigger mode
    pub mode: StoppointMode,
    /// Bytes covered (always 1 for breakpoints)
    pub size: usize,
    /// Hardware slot within the mode's bank
    pub slot: usize,
}

impl Stoppoint
{
    /// `true` if `address` falls inside the region this stoppoint covers.
    #[must_use]
    pub fn covers(&self, address: Address) -> bool
    {
        address
            .offset_from(self.address)
            .is_some_and(|distance| distance < self.size as u64)
    }
}

#[derive(Debug)]
struct StoppointTable
{
    breakpoints: BTreeMap<Address, Stoppoint>,
    watchpoints: BTreeMap<Address, Stoppoint>,
    breakpoint_slots: SlotBank,
    watchpoint_slots: SlotBank,
}

impl StoppointTable
{
    fn bank_mut(&mut self, mode: StoppointMode) -> (&mut BTreeMap<Address, Stoppoint>, &mut SlotBank)
    {
        if mode.is_execute() {
            (&mut self.breakpoints, &mut self.breakpoint_slots)
        } else {
            (&mut self.watchpoints, &mut self.watchpoint_slots)
        }
    }
}

/// Owner of every active stoppoint and of both hardware slot banks.
///
/// All methods take `&self`; the tables live behind an internal mutex so the
/// manager can be shared between the control channel and the trap handler.
/// The lock is never held while the trap handler blocks.
pub struct StoppointManager
{
    substrate: Arc<dyn Substrate>,
    table: Mutex<StoppointTable>,
}

impl fmt::Debug for StoppointManager
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("StoppointManager")
            .field("table", &*self.lock())
            .finish_non_exhaustive()
    }
}

impl StoppointManager
{
    /// Create a manager whose bank limits come from the substrate.
    #[must_use]
    pub fn new(substrate: Arc<dyn Substrate>) -> Self
    {
        let table = StoppointTable {
            breakpoints: BTreeMap::new(),
            watchpoints: BTreeMap::new(),
            breakpoint_slots: SlotBank::new(substrate.breakpoint_slots()),
            watchpoint_slots: SlotBank::new(substrate.watchpoint_slots()),
        };
        Self {
            substrate,
            table: Mutex::new(table),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoppointTable>
    {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm a stoppoint and return its slot
    ///
    /// Execute mode draws from the breakpoint bank, every other mode from the
    /// watchpoint bank. The hardware trap is installed on the control thread
    /// before the stoppoint is recorded, so a failed install leaves no trace.
    ///
    /// ## Errors
    ///
    /// - `ResourceExhausted`: every slot of the bank is in use
    /// - `InvalidArgument`: a stoppoint of the same bank already exists at
    ///   `address`, or a watchpoint size is not 1, 2, 4 or 8
    /// - `Substrate`: the control thread couldn't be found or the trap couldn't be installed
    pub fn add_stoppoint(&self, address: Address, mode: StoppointMode, size: usize) -> HoldfastResult<usize>
    {
        let size = if mode.is_execute() {
            1
        } else {
            Width::try_from(size)?.bytes()
        };

        let mut table = self.lock();
        let (active, bank) = table.bank_mut(mode);
        if let Some(existing) = active.get(&address) {
            return Err(HoldfastError::InvalidArgument(format!(
                "a stoppoint with mode {} is already armed at {address} (slot {})",
                existing.mode, existing.slot
            )));
        }
        let slot = bank.first_free().ok_or_else(|| {
            let kind = if mode.is_execute() { "breakpoint" } else { "watchpoint" };
            HoldfastError::ResourceExhausted(format!("all {} hardware {kind} slots are in use", bank.limit()))
        })?;

        let thread = self.substrate.control_thread()?;
        match mode.access() {
            None => self.substrate.set_hardware_breakpoint(thread, slot, address)?,
            Some(access) => self
                .substrate
                .set_hardware_watchpoint(thread, slot, address, size, access)?,
        }

        bank.claim(slot);
        active.insert(
            address,
            Stoppoint {
                address,
                mode,
                size,
                slot,
            },
        );
        info!(address = %address, mode = %mode, size, slot, thread = %thread, "Stoppoint armed");
        Ok(slot)
    }

    /// Disarm the stoppoint at `address` in the bank selected by `mode`
    ///
    /// Only the bank matters: removing with mode `r` finds a watchpoint armed
    /// with mode `w` at the same address.
    ///
    /// ## Errors
    ///
    /// - `NotFound`: no stoppoint of that bank is tracked at `address`
    /// - `Substrate`: the hardware trap couldn't be removed (the stoppoint stays tracked)
    pub fn remove_stoppoint(&self, address: Address, mode: StoppointMode) -> HoldfastResult<Stoppoint>
    {
        let mut table = self.lock();
        let (active, bank) = table.bank_mut(mode);
        let stoppoint = active.get(&address).copied().ok_or_else(|| {
            let kind = if mode.is_execute() { "breakpoint" } else { "watchpoint" };
            HoldfastError::NotFound(format!("no {kind} exists at {address}"))
        })?;

        self.disarm(&stoppoint)?;
        active.remove(&address);
        bank.release(stoppoint.slot);
        info!(address = %address, mode = %stoppoint.mode, slot = stoppoint.slot, "Stoppoint removed");
        Ok(stoppoint)
    }

    /// Breakpoint armed at exactly `address`, if any.
    #[must_use]
    pub fn breakpoint_at(&self, address: Address) -> Option<Stoppoint>
    {
        self.lock().breakpoints.get(&address).copied()
    }

    /// Consume the breakpoint at `address`
    ///
    /// Called by the trap coordinator when the breakpoint fires. The slot is
    /// freed even if the substrate fails to clear the debug register, since
    /// the trap has already been delivered.
    pub fn take_breakpoint(&self, address: Address) -> Option<Stoppoint>
    {
        let mut table = self.lock();
        let stoppoint = table.breakpoints.remove(&address)?;
        table.breakpoint_slots.release(stoppoint.slot);
        if let Err(err) = self.disarm(&stoppoint) {
            warn!(address = %address, slot = stoppoint.slot, error = %err, "Failed to clear consumed breakpoint");
        }
        debug!(address = %address, slot = stoppoint.slot, "Breakpoint consumed");
        Some(stoppoint)
    }

    /// Watchpoint whose region contains `address`, if any.
    #[must_use]
    pub fn watchpoint_covering(&self, address: Address) -> Option<Stoppoint>
    {
        self.lock()
            .watchpoints
            .values()
            .find(|watchpoint| watchpoint.covers(address))
            .copied()
    }

    /// Every active stoppoint: breakpoints first, each bank ordered by address.
    #[must_use]
    pub fn list(&self) -> Vec<Stoppoint>
    {
        let table = self.lock();
        table
            .breakpoints
            .values()
            .chain(table.watchpoints.values())
            .copied()
            .collect()
    }

    /// Disarm every stoppoint and reset both banks.
    ///
    /// Substrate failures are logged and skipped; the tables are always emptied.
    pub fn clear(&self)
    {
        let mut table = self.lock();
        for stoppoint in table.breakpoints.values().chain(table.watchpoints.values()) {
            if let Err(err) = self.disarm(stoppoint) {
                warn!(address = %stoppoint.address, slot = stoppoint.slot, error = %err, "Failed to disarm stoppoint");
            }
        }
        table.breakpoints.clear();
        table.watchpoints.clear();
        table.breakpoint_slots.reset();
        table.watchpoint_slots.reset();
        debug!("All stoppoints cleared");
    }

    fn disarm(&self, stoppoint: &Stoppoint) -> HoldfastResult<()>
    {
        let thread = self.substrate.control_thread()?;
        if stoppoint.mode.is_execute() {
            self.substrate.unset_hardware_breakpoint(thread, stoppoint.slot)
        } else {
            self.substrate.unset_hardware_watchpoint(thread, stoppoint.slot)
        }
    }
}
