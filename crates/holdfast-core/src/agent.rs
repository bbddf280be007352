//! # Agent
//!
//! The facade the control channel talks to.
//!
//! [`Agent`] owns one instance of every component and wires them together
//! over a shared substrate:
//!
//! ```text
//!                  ┌──────────────────┐
//!   traps ───────► │ TrapCoordinator  │ ──► events (mpsc)
//!                  └────────┬─────────┘
//!                           │ consults
//!                  ┌────────▼─────────┐      ┌──────────────────┐
//!                  │ StoppointManager │      │ RegisterAccessor │
//!                  └──────────────────┘      └──────────────────┘
//!   ScanEngine    FreezeTable + FreezeLoop    Memory    InterceptorRegistry
//! ```
//!
//! Every method maps onto one control-channel operation. The agent itself
//! holds no state beyond the components and the freeze loop handle.
//!
//! ## Lifecycle
//!
//! 1. [`Agent::new`] builds the components and installs the coordinator as
//!    the substrate's trap handler. It returns the receiving end of the
//!    event channel.
//! 2. [`Agent::start_freeze_loop`] spawns the freeze loop on a tokio runtime.
//! 3. [`Agent::shutdown`] (also run on drop) stops the loop, releases a
//!    pending pause, disarms every stoppoint, detaches every hook and removes
//!    the trap handler.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::error::{HoldfastError, HoldfastResult};
use crate::events::{event_channel, EventReceiver};
use crate::exception::{CoordinatorState, TrapCoordinator};
use crate::freeze::{FreezeLoop, FreezeTable, FrozenValue, DEFAULT_FREEZE_INTERVAL};
use crate::hooks::InterceptorRegistry;
use crate::memory::Memory;
use crate::registers::{RegisterAccessor, RegisterWrite};
use crate::scan::{ScanEngine, ScanOptions, ScanPage};
use crate::stoppoints::{Stoppoint, StoppointManager, StoppointMode};
use crate::substrate::{DisassembledInstruction, HookId, PatchOperation, Substrate};
use crate::types::{Address, MemoryMap, Protection, RegisterInput, RegisterValue, Scalar, Width};

/// Default number of scan results per page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Tunables for an [`Agent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOptions
{
    /// Period of the freeze loop
    pub freeze_interval: Duration,
    /// Scan engine options
    pub scan: ScanOptions,
    /// Page size used when the operator doesn't give one
    pub default_page_size: usize,
}

impl Default for AgentOptions
{
    fn default() -> Self
    {
        Self {
            freeze_interval: DEFAULT_FREEZE_INTERVAL,
            scan: ScanOptions::default(),
            default_page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// In-process debugging and memory-inspection agent.
pub struct Agent
{
    substrate: Arc<dyn Substrate>,
    options: AgentOptions,
    memory: Memory,
    stoppoints: Arc<StoppointManager>,
    coordinator: Arc<TrapCoordinator>,
    registers: RegisterAccessor,
    scanner: ScanEngine,
    frozen: Arc<FreezeTable>,
    interceptors: InterceptorRegistry,
    freeze_loop: Mutex<Option<FreezeLoop>>,
}

impl fmt::Debug for Agent
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Agent")
            .field("options", &self.options)
            .field("state", &self.coordinator.state())
            .field("stoppoints", &self.stoppoints)
            .field("scanner", &self.scanner)
            .finish_non_exhaustive()
    }
}

impl Agent
{
    /// Build an agent over `substrate` and install its trap handler.
    ///
    /// Returns the agent and the receiver of its stoppoint events.
    ///
    /// ## Example
    ///
    /// ```rust
    /// use std::sync::Arc;
    ///
    /// use holdfast_core::agent::{Agent, AgentOptions};
    /// use holdfast_core::platform::emulated::EmulatedTarget;
    /// use holdfast_core::types::Architecture;
    ///
    /// let target = Arc::new(EmulatedTarget::new(Architecture::Arm64));
    /// let (agent, _events) = Agent::new(target.clone(), AgentOptions::default());
    /// assert!(agent.ping());
    /// assert!(target.has_trap_handler());
    /// ```
    #[must_use]
    pub fn new(substrate: Arc<dyn Substrate>, options: AgentOptions) -> (Self, EventReceiver)
    {
        let (events, receiver) = event_channel();
        let stoppoints = Arc::new(StoppointManager::new(Arc::clone(&substrate)));
        let coordinator = Arc::new(TrapCoordinator::new(
            Arc::clone(&substrate),
            Arc::clone(&stoppoints),
            events,
        ));
        substrate.install_trap_handler(coordinator.clone());

        let agent = Self {
            memory: Memory::new(Arc::clone(&substrate)),
            registers: RegisterAccessor::new(Arc::clone(&coordinator)),
            scanner: ScanEngine::new(Arc::clone(&substrate), options.scan.clone()),
            frozen: Arc::new(FreezeTable::new(Arc::clone(&substrate))),
            interceptors: InterceptorRegistry::new(Arc::clone(&substrate)),
            freeze_loop: Mutex::new(None),
            stoppoints,
            coordinator,
            substrate,
            options,
        };
        info!(architecture = %agent.substrate.architecture(), "Agent ready");
        (agent, receiver)
    }

    fn lock_loop(&self) -> MutexGuard<'_, Option<FreezeLoop>>
    {
        self.freeze_loop.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Options the agent was built with.
    #[must_use]
    pub fn options(&self) -> &AgentOptions
    {
        &self.options
    }

    /// The substrate the agent runs on.
    #[must_use]
    pub fn substrate(&self) -> &Arc<dyn Substrate>
    {
        &self.substrate
    }

    /// Spawn the freeze loop on `runtime`. Does nothing if it already runs.
    pub fn start_freeze_loop(&self, runtime: &Handle)
    {
        let mut slot = self.lock_loop();
        if slot.as_ref().is_some_and(|running| !running.is_finished()) {
            return;
        }
        *slot = Some(FreezeLoop::spawn(
            Arc::clone(&self.frozen),
            self.options.freeze_interval,
            runtime,
        ));
    }

    /// Stop the freeze loop, if running.
    pub fn stop_freeze_loop(&self)
    {
        if let Some(running) = self.lock_loop().take() {
            running.stop();
        }
    }

    /// Liveness check.
    #[must_use]
    pub fn ping(&self) -> bool
    {
        true
    }

    /// Record an operator message in the agent log.
    pub fn log(&self, message: &str)
    {
        info!(target: "holdfast::operator", "{message}");
    }

    // Memory

    /// Read a scalar.
    ///
    /// ## Errors
    ///
    /// - `MemoryAccess`: the address is unmapped or unreadable
    pub fn read(&self, address: Address, width: Width, signed: bool) -> HoldfastResult<Scalar>
    {
        self.memory.read(address, width, signed)
    }

    /// Write a scalar, truncated to `width`.
    ///
    /// ## Errors
    ///
    /// - `MemoryAccess`: the address is unmapped or not writable
    pub fn write(&self, address: Address, value: Scalar, width: Width, signed: bool) -> HoldfastResult<()>
    {
        self.memory.write(address, value, width, signed)
    }

    /// Read a NUL-terminated string of at most `max_length` bytes.
    ///
    /// ## Errors
    ///
    /// - `MemoryAccess`: the first byte is unreadable
    pub fn read_string(&self, address: Address, max_length: usize) -> HoldfastResult<String>
    {
        self.memory.read_string(address, max_length)
    }

    /// Write `value` followed by a NUL.
    ///
    /// ## Errors
    ///
    /// - `MemoryAccess`: the range is unmapped or not writable
    pub fn write_string(&self, address: Address, value: &str) -> HoldfastResult<()>
    {
        self.memory.write_string(address, value)
    }

    /// Read raw bytes.
    ///
    /// ## Errors
    ///
    /// - `MemoryAccess`: the range is unmapped or unreadable
    pub fn read_bytes(&self, address: Address, length: usize) -> HoldfastResult<Vec<u8>>
    {
        self.memory.read_bytes(address, length)
    }

    /// Write raw bytes.
    ///
    /// ## Errors
    ///
    /// - `MemoryAccess`: the range is unmapped or not writable
    pub fn write_bytes(&self, address: Address, bytes: &[u8]) -> HoldfastResult<()>
    {
        self.memory.write_bytes(address, bytes)
    }

    /// Canonical hexdump of `length` bytes.
    ///
    /// ## Errors
    ///
    /// - `InvalidArgument`: `length` is zero
    /// - `MemoryAccess`: the range is unmapped or unreadable
    pub fn hexdump(&self, address: Address, length: usize) -> HoldfastResult<String>
    {
        self.memory.hexdump(address, length)
    }

    /// File-backed executable ranges.
    ///
    /// ## Errors
    ///
    /// - `Substrate`: ranges could not be enumerated
    pub fn memory_maps(&self) -> HoldfastResult<Vec<MemoryMap>>
    {
        let ranges = self.substrate.enumerate_ranges(Protection::READ_EXECUTE)?;
        Ok(ranges
            .into_iter()
            .filter_map(|range| {
                range.file.map(|name| MemoryMap {
                    name,
                    base_address: range.base,
                    protection: range.protection,
                })
            })
            .collect())
    }

    // Stoppoints

    /// Arm a stoppoint. Returns its slot.
    ///
    /// ## Errors
    ///
    /// See [`StoppointManager::add_stoppoint`].
    pub fn add_stoppoint(&self, address: Address, mode: StoppointMode, size: usize) -> HoldfastResult<usize>
    {
        self.stoppoints.add_stoppoint(address, mode, size)
    }

    /// Disarm a stoppoint.
    ///
    /// ## Errors
    ///
    /// See [`StoppointManager::remove_stoppoint`].
    pub fn remove_stoppoint(&self, address: Address, mode: StoppointMode) -> HoldfastResult<Stoppoint>
    {
        self.stoppoints.remove_stoppoint(address, mode)
    }

    /// Every armed stoppoint.
    #[must_use]
    pub fn list_stoppoints(&self) -> Vec<Stoppoint>
    {
        self.stoppoints.list()
    }

    // Pause control

    /// Whether the control thread is running or paused.
    #[must_use]
    pub fn state(&self) -> CoordinatorState
    {
        self.coordinator.state()
    }

    /// Release the paused control thread.
    ///
    /// ## Errors
    ///
    /// - `StateError`: nothing is paused
    pub fn resume(&self) -> HoldfastResult<()>
    {
        self.coordinator.resume()
    }

    /// Read a register of the paused thread.
    ///
    /// ## Errors
    ///
    /// See [`RegisterAccessor::read_register`].
    pub fn read_register(&self, name: &str) -> HoldfastResult<RegisterValue>
    {
        self.registers.read_register(name)
    }

    /// Write a register of the paused thread.
    ///
    /// ## Errors
    ///
    /// See [`RegisterAccessor::write_register`].
    pub fn write_register(&self, name: &str, input: RegisterInput) -> HoldfastResult<RegisterWrite>
    {
        self.registers.write_register(name, input)
    }

    // Freezing

    /// Pin the current 4-byte value at `address`.
    ///
    /// ## Errors
    ///
    /// - `MemoryAccess`: the address is unreadable
    pub fn freeze(&self, address: Address) -> HoldfastResult<Scalar>
    {
        self.frozen.freeze(address)
    }

    /// Stop enforcing `address`.
    ///
    /// ## Errors
    ///
    /// - `NotFound`: `address` is not frozen
    pub fn unfreeze(&self, address: Address) -> HoldfastResult<FrozenValue>
    {
        self.frozen.unfreeze(address)
    }

    /// Replace the value enforced at `address`.
    ///
    /// ## Errors
    ///
    /// - `NotFound`: `address` is not frozen
    pub fn update_frozen_value(&self, address: Address, value: Scalar) -> HoldfastResult<()>
    {
        self.frozen.update(address, value)
    }

    /// Every frozen value.
    #[must_use]
    pub fn list_frozen(&self) -> Vec<FrozenValue>
    {
        self.frozen.list()
    }

    // Scanning

    /// Start a scan session. Returns the match count.
    ///
    /// ## Errors
    ///
    /// See [`ScanEngine::first_scan`].
    pub fn first_scan(&self, target: Scalar, width: Width, signed: bool) -> HoldfastResult<usize>
    {
        self.scanner.first_scan(target, width, signed)
    }

    /// Narrow the scan session. Returns the remaining count.
    ///
    /// ## Errors
    ///
    /// See [`ScanEngine::next_scan`].
    pub fn next_scan(&self, target: Scalar) -> HoldfastResult<usize>
    {
        self.scanner.next_scan(target)
    }

    /// One page of scan candidates with their current values.
    ///
    /// ## Errors
    ///
    /// See [`ScanEngine::scan_results`].
    pub fn scan_results(&self, page: usize, page_size: usize) -> HoldfastResult<ScanPage>
    {
        self.scanner.scan_results(page, page_size)
    }

    /// Discard the scan session.
    pub fn clear_scan_state(&self)
    {
        self.scanner.clear_scan_state();
    }

    /// One-shot string search.
    ///
    /// ## Errors
    ///
    /// See [`ScanEngine::scan_strings`].
    pub fn scan_strings(&self, target: &str, addresses: Option<&[Address]>) -> HoldfastResult<Vec<Address>>
    {
        self.scanner.scan_strings(target, addresses)
    }

    // Code

    /// Disassemble `count` instructions.
    ///
    /// ## Errors
    ///
    /// - `Substrate`: decoding failed
    pub fn disassemble(&self, address: Address, count: usize) -> HoldfastResult<Vec<DisassembledInstruction>>
    {
        self.substrate.disassemble(address, count)
    }

    /// Patch code at `address`, reserving the maximum instruction size per operation.
    ///
    /// ## Errors
    ///
    /// - `InvalidArgument`: `operations` is empty
    /// - `Substrate` / `MemoryAccess`: the code writer failed
    pub fn patch(&self, address: Address, operations: &[PatchOperation]) -> HoldfastResult<()>
    {
        if operations.is_empty() {
            return Err(HoldfastError::InvalidArgument("patch needs at least one operation".to_string()));
        }
        let max_size = self.substrate.architecture().max_instruction_size() * operations.len();
        info!(address = %address, operations = operations.len(), max_size, "Patching code");
        self.substrate.patch_code(address, max_size, operations)
    }

    /// Attach hook `code` at `address`, replacing any existing hook there.
    ///
    /// ## Errors
    ///
    /// See [`InterceptorRegistry::intercept`].
    pub fn intercept(&self, address: Address, code: &str) -> HoldfastResult<HookId>
    {
        self.interceptors.intercept(address, code)
    }

    /// Detach the hook at `address`. Returns `false` if there was none.
    ///
    /// ## Errors
    ///
    /// - `Substrate`: the substrate failed to detach
    pub fn detach_interception(&self, address: Address) -> HoldfastResult<bool>
    {
        self.interceptors.detach(address)
    }

    /// Detach every hook. Returns how many were detached.
    pub fn detach_all_interceptors(&self) -> usize
    {
        self.interceptors.detach_all()
    }

    /// Tear down the session.
    ///
    /// Safe to call more than once.
    pub fn shutdown(&self)
    {
        debug!("Shutting down agent");
        self.stop_freeze_loop();
        self.coordinator.shutdown();
        self.stoppoints.clear();
        self.interceptors.detach_all();
        self.frozen.clear();
        self.scanner.clear_scan_state();
        self.substrate.remove_trap_handler();
    }
}

impl Drop for Agent
{
    fn drop(&mut self)
    {
        // Also breaks the substrate -> handler -> substrate reference cycle.
        self.shutdown();
    }
}
