//! # Trap Coordination
//!
//! The process-wide trap handler: classifies every hardware trap, consults the
//! stoppoint manager, and pauses the control thread until the operator resumes
//! it.
//!
//! ## States
//!
//! ```text
//! Running --(stoppoint hit)--> Paused --(resume)--> Running
//! ```
//!
//! While paused, the trapped thread is blocked *inside* [`TrapHandler::on_trap`]
//! on a per-pause channel with no timeout. The register snapshot it captured
//! is owned by the coordinator and reachable through
//! [`TrapCoordinator::with_registers`] / [`TrapCoordinator::with_registers_mut`].
//! [`TrapCoordinator::resume`] takes the snapshot out of the coordinator and
//! sends it back to the trapped thread in one step, so register access fails
//! with `StateError` from the moment resume is accepted.
//!
//! ## Classification
//!
//! For traps on the control thread of kind breakpoint or single-step:
//!
//! 1. An armed breakpoint at the trap address is consumed, a `breakpoint`
//!    event is emitted and the thread pauses.
//! 2. Otherwise the faulting instruction's memory operand is decoded. If a
//!    watchpoint covers the effective address in a matching mode, a
//!    `watchpoint` event is emitted and the thread pauses.
//! 3. Otherwise the program counter is advanced past the instruction.
//!
//! Access violations on any thread advance the program counter. Everything
//! else propagates to the host's default handling.
//!
//! Only one pause can be active. A stoppoint that would pause while another
//! pause is active is logged, left armed, and treated as non-matching.

use std::fmt;
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, trace, warn};

use crate::error::{HoldfastError, HoldfastResult};
use crate::events::{AgentEvent, EventSender};
use crate::stoppoints::StoppointManager;
use crate::substrate::{Substrate, TrapContext, TrapDisposition, TrapHandler, TrapKind};
use crate::types::{Address, RegisterContext, RegisterValue, ThreadId};

/// Execution state of the control thread as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState
{
    /// No pause is active
    Running,
    /// The control thread is blocked in the trap handler
    Paused
    {
        /// Trapped thread
        thread: ThreadId,
        /// Address of the trapping instruction
        address: Address,
    },
}

/// Message that wakes a paused thread, carrying back its (possibly edited) registers.
#[derive(Debug)]
enum PauseRelease
{
    Resume(RegisterContext),
    Shutdown(RegisterContext),
}

#[derive(Debug)]
struct PauseContext
{
    thread: ThreadId,
    address: Address,
    registers: RegisterContext,
    release: mpsc::Sender<PauseRelease>,
}

/// The process-wide trap handler and owner of the pause context.
pub struct TrapCoordinator
{
    substrate: Arc<dyn Substrate>,
    stoppoints: Arc<StoppointManager>,
    events: Mutex<EventSender>,
    pause: Mutex<Option<PauseContext>>,
}

impl fmt::Debug for TrapCoordinator
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("TrapCoordinator")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl TrapCoordinator
{
    /// Create a coordinator publishing events on `events`.
    ///
    /// The coordinator is inert until installed with
    /// [`HardwareTraps::install_trap_handler`](crate::substrate::HardwareTraps::install_trap_handler).
    #[must_use]
    pub fn new(substrate: Arc<dyn Substrate>, stoppoints: Arc<StoppointManager>, events: EventSender) -> Self
    {
        Self {
            substrate,
            stoppoints,
            events: Mutex::new(events),
            pause: Mutex::new(None),
        }
    }

    fn lock_pause(&self) -> MutexGuard<'_, Option<PauseContext>>
    {
        self.pause.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CoordinatorState
    {
        match self.lock_pause().as_ref() {
            Some(pause) => CoordinatorState::Paused {
                thread: pause.thread,
                address: pause.address,
            },
            None => CoordinatorState::Running,
        }
    }

    /// `true` while a thread is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool
    {
        self.lock_pause().is_some()
    }

    /// Run `f` against the paused thread's register snapshot.
    ///
    /// ## Errors
    ///
    /// - `StateError`: no thread is paused
    pub fn with_registers<R>(&self, f: impl FnOnce(&RegisterContext) -> R) -> HoldfastResult<R>
    {
        let guard = self.lock_pause();
        let pause = guard.as_ref().ok_or_else(not_paused)?;
        Ok(f(&pause.registers))
    }

    /// Run `f` against the paused thread's register snapshot, mutably.
    ///
    /// Changes are applied to the thread when it resumes.
    ///
    /// ## Errors
    ///
    /// - `StateError`: no thread is paused
    pub fn with_registers_mut<R>(&self, f: impl FnOnce(&mut RegisterContext) -> R) -> HoldfastResult<R>
    {
        let mut guard = self.lock_pause();
        let pause = guard.as_mut().ok_or_else(not_paused)?;
        Ok(f(&mut pause.registers))
    }

    /// Release the paused thread.
    ///
    /// ## Errors
    ///
    /// - `StateError`: no thread is paused
    pub fn resume(&self) -> HoldfastResult<()>
    {
        let pause = self.lock_pause().take().ok_or_else(not_paused)?;
        info!(thread = %pause.thread, address = %pause.address, "Resuming paused thread");
        if pause.release.send(PauseRelease::Resume(pause.registers)).is_err() {
            warn!(thread = %pause.thread, "Paused thread was no longer waiting for resume");
        }
        Ok(())
    }

    /// Release any paused thread as part of agent teardown.
    pub fn shutdown(&self)
    {
        if let Some(pause) = self.lock_pause().take() {
            info!(thread = %pause.thread, address = %pause.address, "Releasing paused thread for shutdown");
            // A send error only means the thread already stopped waiting.
            let _ = pause.release.send(PauseRelease::Shutdown(pause.registers));
        }
    }

    fn emit(&self, event: AgentEvent)
    {
        debug!(event = %event.describe(), "Emitting agent event");
        let sender = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if sender.send(event).is_err() {
            debug!("Event receiver dropped, event discarded");
        }
    }

    /// Claim the single pause context. `None` if another pause is active.
    fn begin_pause(&self, context: &TrapContext) -> Option<mpsc::Receiver<PauseRelease>>
    {
        let mut guard = self.lock_pause();
        if guard.is_some() {
            return None;
        }
        let (release, wait) = mpsc::channel();
        *guard = Some(PauseContext {
            thread: context.thread,
            address: context.address,
            registers: context.registers.clone(),
            release,
        });
        Some(wait)
    }

    fn abandon_pause(&self)
    {
        self.lock_pause().take();
    }

    fn wait_for_resume(&self, wait: &mpsc::Receiver<PauseRelease>, context: &mut TrapContext)
    {
        debug!(thread = %context.thread, address = %context.address, "Waiting for resume");
        match wait.recv() {
            Ok(PauseRelease::Resume(registers)) => {
                context.registers = registers;
                debug!(thread = %context.thread, "Resume received");
            }
            Ok(PauseRelease::Shutdown(registers)) => {
                context.registers = registers;
                debug!(thread = %context.thread, "Released by shutdown");
            }
            Err(_) => {
                // The coordinator was dropped while paused.
                self.abandon_pause();
                warn!(thread = %context.thread, "Pause channel closed without resume");
            }
        }
    }

    fn handle_breakpoint(&self, context: &mut TrapContext) -> Option<TrapDisposition>
    {
        self.stoppoints.breakpoint_at(context.address)?;

        let Some(wait) = self.begin_pause(context) else {
            warn!(
                thread = %context.thread,
                address = %context.address,
                "Breakpoint hit while another pause is active; leaving it armed"
            );
            return Some(TrapDisposition::Handled);
        };

        let Some(breakpoint) = self.stoppoints.take_breakpoint(context.address) else {
            // Removed by the control channel between lookup and consumption.
            self.abandon_pause();
            return Some(TrapDisposition::Handled);
        };

        info!(address = %breakpoint.address, slot = breakpoint.slot, "Breakpoint hit");
        self.emit(AgentEvent::Breakpoint {
            address: breakpoint.address,
            slot: breakpoint.slot,
        });
        self.wait_for_resume(&wait, context);
        Some(TrapDisposition::Handled)
    }

    fn handle_memory_access(&self, context: &mut TrapContext) -> TrapDisposition
    {
        let operand = match self.substrate.memory_operand(context.address) {
            Ok(operand) => operand,
            Err(err) => {
                debug!(address = %context.address, error = %err, "Could not decode trapping instruction");
                return TrapDisposition::Propagate;
            }
        };

        let Some(operand) = operand else {
            trace!(address = %context.address, "No memory operand, stepping over");
            return self.advance(context);
        };

        let base = match context.registers.get(operand.base) {
            Some(RegisterValue::Address(address)) => address,
            Some(RegisterValue::Numeric(value)) => Address::from(value),
            Some(RegisterValue::Vector(_)) | None => {
                debug!(base = ?operand.base, "Memory operand base register unavailable, stepping over");
                return self.advance(context);
            }
        };
        let effective = base.offset(operand.displacement);
        trace!(address = %effective, operation = %operand.access, "Decoded memory access");

        let Some(watchpoint) = self
            .stoppoints
            .watchpoint_covering(effective)
            .filter(|watchpoint| watchpoint.mode.matches(operand.access))
        else {
            return self.advance(context);
        };

        let Some(wait) = self.begin_pause(context) else {
            warn!(
                thread = %context.thread,
                address = %effective,
                "Watchpoint hit while another pause is active; stepping over"
            );
            return self.advance(context);
        };

        info!(address = %effective, operation = %operand.access, slot = watchpoint.slot, "Watchpoint hit");
        self.emit(AgentEvent::Watchpoint {
            address: effective,
            operation: operand.access,
            size: watchpoint.size,
            slot: watchpoint.slot,
            program_counter: context.registers.pc,
        });
        self.wait_for_resume(&wait, context);
        TrapDisposition::Handled
    }

    /// Move the program counter past the current instruction and continue.
    fn advance(&self, context: &mut TrapContext) -> TrapDisposition
    {
        match self.substrate.next_instruction(context.registers.pc) {
            Ok(next) => {
                trace!(from = %context.registers.pc, to = %next, "Advancing past faulting instruction");
                context.registers.pc = next;
                TrapDisposition::Handled
            }
            Err(err) => {
                debug!(pc = %context.registers.pc, error = %err, "Cannot step over instruction, propagating");
                TrapDisposition::Propagate
            }
        }
    }

    fn is_control_thread(&self, thread: ThreadId) -> bool
    {
        match self.substrate.control_thread() {
            Ok(control) => control == thread,
            Err(err) => {
                debug!(error = %err, "Control thread unknown");
                false
            }
        }
    }
}

impl TrapHandler for TrapCoordinator
{
    fn on_trap(&self, context: &mut TrapContext) -> TrapDisposition
    {
        trace!(thread = %context.thread, kind = %context.kind, address = %context.address, "Trap delivered");

        let stoppoint_trap = matches!(context.kind, TrapKind::Breakpoint | TrapKind::SingleStep);
        if stoppoint_trap && self.is_control_thread(context.thread) {
            if let Some(disposition) = self.handle_breakpoint(context) {
                return disposition;
            }
            return self.handle_memory_access(context);
        }

        if context.kind == TrapKind::AccessViolation {
            debug!(
                thread = %context.thread,
                pc = %context.registers.pc,
                fault = ?context.fault_address,
                "Access violation, stepping over"
            );
            return self.advance(context);
        }

        debug!(thread = %context.thread, kind = %context.kind, "Trap not handled, propagating");
        TrapDisposition::Propagate
    }
}

fn not_paused() -> HoldfastError
{
    HoldfastError::StateError("no thread is paused".to_string())
}
