//! # Value Freezing
//!
//! Continuous re-enforcement of captured values.
//!
//! [`FreezeTable`] records frozen addresses; [`FreezeLoop`] is the background
//! task that writes every recorded value back on a fixed interval (50 ms by
//! default). The loop is independent of the trap coordinator: it keeps running
//! while the control thread is paused and never waits on it.
//!
//! A frozen value is captured as a 4-byte unsigned integer regardless of what
//! actually lives at the address; [`FreezeTable::update`] replaces the
//! enforced value. When a write-back fails (the page went away, or its
//! protection changed) the entry is dropped silently.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::error::{HoldfastError, HoldfastResult};
use crate::substrate::Substrate;
use crate::types::{Address, Scalar, Width};

/// Default period of the freeze loop.
pub const DEFAULT_FREEZE_INTERVAL: Duration = Duration::from_millis(50);

/// Width every freeze captures and enforces.
pub const FREEZE_WIDTH: Width = Width::Four;

/// A value pinned at an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrozenValue
{
    /// Pinned address
    pub address: Address,
    /// Value written back every tick
    pub value: Scalar,
    /// Width of the write-back
    pub width: Width,
    /// Interpretation of `value`; captures are always unsigned
    pub signed: bool,
}

/// Table of frozen values shared by the control channel and the freeze loop.
pub struct FreezeTable
{
    substrate: Arc<dyn Substrate>,
    entries: Mutex<BTreeMap<Address, FrozenValue>>,
}

impl fmt::Debug for FreezeTable
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("FreezeTable")
            .field("entries", &*self.lock())
            .finish_non_exhaustive()
    }
}

impl FreezeTable
{
    /// Create an empty table.
    #[must_use]
    pub fn new(substrate: Arc<dyn Substrate>) -> Self
    {
        Self {
            substrate,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Address, FrozenValue>>
    {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Capture the current 4-byte unsigned value at `address` and pin it.
    ///
    /// Freezing an already-frozen address recaptures its value.
    ///
    /// ## Errors
    ///
    /// - `MemoryAccess`: the address is unmapped or unreadable
    pub fn freeze(&self, address: Address) -> HoldfastResult<Scalar>
    {
        let bytes = self.substrate.read_memory(address, FREEZE_WIDTH.bytes())?;
        let value = Scalar::decode(&bytes, FREEZE_WIDTH, false)?;
        self.lock().insert(
            address,
            FrozenValue {
                address,
                value,
                width: FREEZE_WIDTH,
                signed: false,
            },
        );
        info!(address = %address, value = %value, "Value frozen");
        Ok(value)
    }

    /// Stop enforcing the value at `address`.
    ///
    /// ## Errors
    ///
    /// - `NotFound`: `address` is not frozen
    pub fn unfreeze(&self, address: Address) -> HoldfastResult<FrozenValue>
    {
        let frozen = self.lock().remove(&address).ok_or_else(|| not_frozen(address))?;
        info!(address = %address, "Value unfrozen");
        Ok(frozen)
    }

    /// Replace the value enforced at `address`.
    ///
    /// The value is truncated to the freeze width and keeps the entry's
    /// signedness.
    ///
    /// ## Errors
    ///
    /// - `NotFound`: `address` is not frozen
    pub fn update(&self, address: Address, value: Scalar) -> HoldfastResult<()>
    {
        let mut entries = self.lock();
        let frozen = entries.get_mut(&address).ok_or_else(|| not_frozen(address))?;
        frozen.value = value.normalize(frozen.width, frozen.signed)?;
        debug!(address = %address, value = %frozen.value, "Frozen value updated");
        Ok(())
    }

    /// `true` if `address` is frozen.
    #[must_use]
    pub fn is_frozen(&self, address: Address) -> bool
    {
        self.lock().contains_key(&address)
    }

    /// Every frozen value, ordered by address.
    #[must_use]
    pub fn list(&self) -> Vec<FrozenValue>
    {
        self.lock().values().copied().collect()
    }

    /// Forget every frozen value.
    pub fn clear(&self)
    {
        self.lock().clear();
    }

    /// Write every frozen value back once
    ///
    /// The table stays locked for the whole pass, so an entry removed or
    /// recaptured concurrently is never written stale. Entries whose write
    /// fails are removed. Returns the number removed.
    pub fn enforce(&self) -> usize
    {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|address, frozen| match self
            .substrate
            .write_memory(*address, &frozen.value.encode(frozen.width))
        {
            Ok(()) => true,
            Err(err) => {
                debug!(address = %address, error = %err, "Dropping frozen value after failed write");
                false
            }
        });
        before - entries.len()
    }
}

/// Background task driving [`FreezeTable::enforce`] on a fixed interval.
///
/// Runs on a tokio runtime. Missed ticks are skipped rather than bursted, so a
/// stalled runtime doesn't hammer the target on recovery.
#[derive(Debug)]
pub struct FreezeLoop
{
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl FreezeLoop
{
    /// Spawn the loop on `runtime`.
    #[must_use]
    pub fn spawn(table: Arc<FreezeTable>, interval: Duration, runtime: &Handle) -> Self
    {
        let (shutdown, mut stopped) = watch::channel(false);
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!(interval = ?interval, "Freeze loop started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        table.enforce();
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Freeze loop stopped");
        });
        Self { shutdown, handle }
    }

    /// Ask the loop to stop after its current tick.
    pub fn stop(&self)
    {
        // Send only fails if the task already exited.
        let _ = self.shutdown.send(true);
    }

    /// Stop the loop and wait for it to exit.
    pub async fn join(self)
    {
        self.stop();
        // A join error means the task panicked or was aborted; either way it's gone.
        let _ = self.handle.await;
    }

    /// Abort the loop immediately.
    pub fn abort(&self)
    {
        self.handle.abort();
    }

    /// `true` once the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool
    {
        self.handle.is_finished()
    }
}

fn not_frozen(address: Address) -> HoldfastError
{
    HoldfastError::NotFound(format!("address {address} is not frozen"))
}
