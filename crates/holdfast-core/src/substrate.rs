//! # Substrate Contract
//!
//! The interface between the agent and the instrumentation host it is embedded
//! through.
//!
//! The agent never touches the CPU or the OS directly. Everything that needs
//! the host (reading memory, arming debug registers, decoding an instruction,
//! patching code) goes through the traits in this module, one trait per duty:
//!
//! - [`MemoryAccess`]: raw address-space reads and writes
//! - [`RangeEnumerator`]: mapped ranges filtered by protection
//! - [`PatternScanner`]: byte-pattern search over a range
//! - [`HardwareTraps`]: debug-register slots on the control thread, plus the
//!   process-wide trap callback
//! - [`InstructionDecoder`]: memory operands, instruction lengths, disassembly
//! - [`CodePatcher`]: in-place code patching and hook attachment
//!
//! [`Substrate`] is implemented for every type that provides all of them.
//! The agent holds an `Arc<dyn Substrate>`, so tests can swap in the emulated
//! host from [`crate::platform::emulated`].
//!
//! ## Trap delivery
//!
//! The host calls [`TrapHandler::on_trap`] synchronously on the faulting
//! thread for every hardware trap or access violation. The handler may block
//! (that is how a pause works) and may edit the register snapshot in the
//! [`TrapContext`]; the host writes the snapshot back before the thread
//! continues. Returning [`TrapDisposition::Propagate`] hands the fault to the
//! host's default handling.

use std::fmt;
use std::sync::Arc;

use crate::error::HoldfastResult;
use crate::types::{Address, Architecture, MemoryRange, Protection, RegisterContext, RegisterId, ThreadId};

/// Raw address-space access
pub trait MemoryAccess: Send + Sync
{
    /// Read `len` bytes starting at `address`.
    ///
    /// ## Errors
    ///
    /// - `MemoryAccess`: any byte of the range is unmapped or unreadable
    fn read_memory(&self, address: Address, len: usize) -> HoldfastResult<Vec<u8>>;

    /// Write `data` starting at `address`.
    ///
    /// ## Errors
    ///
    /// - `MemoryAccess`: any byte of the range is unmapped or not writable
    fn write_memory(&self, address: Address, data: &[u8]) -> HoldfastResult<()>;
}

/// Enumeration of mapped ranges
pub trait RangeEnumerator: Send + Sync
{
    /// Every mapped range whose protection grants at least `filter`.
    ///
    /// ## Errors
    ///
    /// - `Substrate`: the host could not enumerate ranges
    fn enumerate_ranges(&self, filter: Protection) -> HoldfastResult<Vec<MemoryRange>>;
}

/// Size of the window read at a time by the default [`PatternScanner::scan_range`].
pub const SCAN_CHUNK_SIZE: usize = 1024 * 1024;

/// Byte-pattern search over a mapped range
///
/// Hosts with a native scanner should override [`PatternScanner::scan_range`].
/// The default implementation reads the range through [`MemoryAccess`] in
/// windows of [`SCAN_CHUNK_SIZE`] bytes, overlapping consecutive windows by
/// `pattern.len() - 1` so matches straddling a window edge are found exactly
/// once.
pub trait PatternScanner: MemoryAccess
{
    /// Addresses of every (possibly overlapping) occurrence of `pattern` in `range`, ascending.
    ///
    /// ## Errors
    ///
    /// - `MemoryAccess`: part of the range became unreadable during the scan
    fn scan_range(&self, range: &MemoryRange, pattern: &[u8]) -> HoldfastResult<Vec<Address>>
    {
        let mut matches = Vec::new();
        if pattern.is_empty() {
            return Ok(matches);
        }
        let total = usize::try_from(range.size).unwrap_or(usize::MAX);
        let overlap = pattern.len() - 1;
        let mut offset = 0usize;

        while offset < total {
            let window = SCAN_CHUNK_SIZE.min(total - offset);
            let base = range.base + offset as u64;
            let bytes = self.read_memory(base, window)?;
            for (index, candidate) in bytes.windows(pattern.len()).enumerate() {
                if candidate == pattern {
                    matches.push(base + index as u64);
                }
            }
            if offset + window >= total {
                break;
            }
            offset += window.saturating_sub(overlap).max(1);
        }

        matches.dedup();
        Ok(matches)
    }
}

/// Kind of memory access performed by an instruction, or watched by a watchpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind
{
    /// Load
    Read,
    /// Store
    Write,
    /// Read-modify-write
    ReadWrite,
}

impl AccessKind
{
    /// Short operator-facing form: `r`, `w` or `rw`.
    #[must_use]
    pub const fn as_str(self) -> &'static str
    {
        match self {
            AccessKind::Read => "r",
            AccessKind::Write => "w",
            AccessKind::ReadWrite => "rw",
        }
    }
}

impl fmt::Display for AccessKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.as_str())
    }
}

/// Hardware debug-register management on the control thread
pub trait HardwareTraps: Send + Sync
{
    /// Number of execution breakpoint slots the CPU exposes.
    fn breakpoint_slots(&self) -> usize;

    /// Number of data watchpoint slots the CPU exposes.
    fn watchpoint_slots(&self) -> usize;

    /// The thread whose traps are handled as stoppoints.
    ///
    /// ## Errors
    ///
    /// - `Substrate`: the host could not enumerate threads
    fn control_thread(&self) -> HoldfastResult<ThreadId>;

    /// Arm execution breakpoint `slot` of `thread` at `address`.
    ///
    /// ## Errors
    ///
    /// - `Substrate`: the host refused to program the debug register
    fn set_hardware_breakpoint(&self, thread: ThreadId, slot: usize, address: Address) -> HoldfastResult<()>;

    /// Disarm execution breakpoint `slot` of `thread`.
    ///
    /// ## Errors
    ///
    /// - `Substrate`: the host refused to clear the debug register
    fn unset_hardware_breakpoint(&self, thread: ThreadId, slot: usize) -> HoldfastResult<()>;

    /// Arm data watchpoint `slot` of `thread` over `size` bytes at `address`.
    ///
    /// ## Errors
    ///
    /// - `Substrate`: the host refused to program the debug register
    fn set_hardware_watchpoint(
        &self,
        thread: ThreadId,
        slot: usize,
        address: Address,
        size: usize,
        access: AccessKind,
    ) -> HoldfastResult<()>;

    /// Disarm data watchpoint `slot` of `thread`.
    ///
    /// ## Errors
    ///
    /// - `Substrate`: the host refused to clear the debug register
    fn unset_hardware_watchpoint(&self, thread: ThreadId, slot: usize) -> HoldfastResult<()>;

    /// Install the process-wide trap callback, replacing any previous one.
    fn install_trap_handler(&self, handler: Arc<dyn TrapHandler>);

    /// Remove the process-wide trap callback.
    fn remove_trap_handler(&self);
}

/// Memory operand of a decoded instruction: `[base + displacement]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOperand
{
    /// Base register
    pub base: RegisterId,
    /// Signed displacement added to the base
    pub displacement: i64,
    /// Whether the instruction loads, stores, or both
    pub access: AccessKind,
}

/// One disassembled instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisassembledInstruction
{
    /// Address of the instruction
    pub address: Address,
    /// Offset of the instruction within its mapped range
    pub offset: u64,
    /// Textual form, e.g. `"ldr w8, [x0, #0x10]"`
    pub mnemonic: String,
}

/// Single-instruction decoding supplied by the host
pub trait InstructionDecoder: Send + Sync
{
    /// Architecture of the target.
    fn architecture(&self) -> Architecture;

    /// First memory operand of the instruction at `address`, if it has one.
    ///
    /// ## Errors
    ///
    /// - `Substrate`: no valid instruction could be decoded at `address`
    fn memory_operand(&self, address: Address) -> HoldfastResult<Option<MemoryOperand>>;

    /// Address of the instruction following the one at `address`.
    ///
    /// ## Errors
    ///
    /// - `Substrate`: no valid instruction could be decoded at `address`
    fn next_instruction(&self, address: Address) -> HoldfastResult<Address>;

    /// `count` consecutive instructions starting at `address`.
    ///
    /// ## Errors
    ///
    /// - `Substrate`: decoding failed before `count` instructions were produced
    fn disassemble(&self, address: Address, count: usize) -> HoldfastResult<Vec<DisassembledInstruction>>;
}

/// A single code-writer operation, e.g. `{"method": "putNop", "values": []}`.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchOperation
{
    /// Writer method to invoke
    pub method: String,
    /// Arguments for the method
    pub values: Vec<serde_json::Value>,
}

/// Handle for an attached hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HookId(pub u64);

/// Code patching and hook attachment
pub trait CodePatcher: Send + Sync
{
    /// Emit `operations` in place at `address`, writing at most `max_size` bytes.
    ///
    /// ## Errors
    ///
    /// - `Substrate`: the host's code writer rejected an operation
    /// - `MemoryAccess`: the patch site could not be made writable
    fn patch_code(&self, address: Address, max_size: usize, operations: &[PatchOperation]) -> HoldfastResult<()>;

    /// Attach operator-supplied hook `code` at `address`.
    ///
    /// ## Errors
    ///
    /// - `Substrate`: the host could not compile or attach the hook
    fn attach_hook(&self, address: Address, code: &str) -> HoldfastResult<HookId>;

    /// Detach a previously attached hook.
    ///
    /// ## Errors
    ///
    /// - `Substrate`: the host failed to detach the hook
    fn detach_hook(&self, hook: HookId) -> HoldfastResult<()>;
}

/// Everything the agent needs from its instrumentation host.
pub trait Substrate: RangeEnumerator + PatternScanner + HardwareTraps + InstructionDecoder + CodePatcher {}

impl<T> Substrate for T where T: RangeEnumerator + PatternScanner + HardwareTraps + InstructionDecoder + CodePatcher {}

/// Classification of a trap as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrapKind
{
    /// Execution breakpoint
    Breakpoint,
    /// Single-step or data watchpoint trap
    SingleStep,
    /// Access to an unmapped or protected address
    AccessViolation,
    /// Anything else (illegal instruction, arithmetic fault, ...)
    Unknown,
}

impl fmt::Display for TrapKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            TrapKind::Breakpoint => "breakpoint",
            TrapKind::SingleStep => "single-step",
            TrapKind::AccessViolation => "access-violation",
            TrapKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Per-trap record handed to the [`TrapHandler`].
///
/// Lives only for the duration of one handler invocation. The handler may
/// rewrite `registers` (most notably `registers.pc` to skip the faulting
/// instruction); the host applies the snapshot when the thread continues.
#[derive(Debug, Clone)]
pub struct TrapContext
{
    /// Thread that trapped
    pub thread: ThreadId,
    /// Trap classification
    pub kind: TrapKind,
    /// Address of the faulting instruction
    pub address: Address,
    /// Register snapshot of the trapping thread
    pub registers: RegisterContext,
    /// Faulting data address for access violations, when the host reports it
    pub fault_address: Option<Address>,
}

/// What the host should do once the handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapDisposition
{
    /// The trap was consumed; continue the thread with the (possibly edited) registers.
    Handled,
    /// Not ours; hand the fault to the host's default handling.
    Propagate,
}

/// Process-wide trap callback.
pub trait TrapHandler: Send + Sync
{
    /// Handle one trap on the faulting thread. May block.
    fn on_trap(&self, context: &mut TrapContext) -> TrapDisposition;
}
