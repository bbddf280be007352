//! # Emulated Substrate
//!
//! An in-memory stand-in for an instrumentation host.
//!
//! [`EmulatedTarget`] implements every substrate trait over plain Rust data:
//!
//! - **Memory**: a set of mapped regions, each with a protection and an
//!   optional backing file name, holding real bytes. Reads and writes honour
//!   the protection and fail with `MemoryAccess` outside mapped memory.
//! - **Debug registers**: two slot banks with configurable limits. Arming a
//!   slot records it so tests can assert on hardware state.
//! - **Instructions**: a table of decoded instructions (length, mnemonic and
//!   optional memory operand) keyed by address.
//! - **Code patching and hooks**: journals of every patch and attached hook.
//! - **Traps**: [`EmulatedTarget::raise_trap`] builds a trap context and
//!   synchronously invokes the installed handler on the calling thread,
//!   exactly like a host delivering a hardware trap. Call it from a spawned
//!   thread to play the role of a target thread that may be paused.
//!
//! ## Example
//!
//! ```rust
//! use holdfast_core::platform::emulated::EmulatedTarget;
//! use holdfast_core::substrate::MemoryAccess;
//! use holdfast_core::types::{Address, Architecture, Protection};
//!
//! let target = EmulatedTarget::new(Architecture::Arm64);
//! target.map(Address::from(0x1000), 0x1000, Protection::READ_WRITE, None)?;
//! target.write_memory(Address::from(0x1000), &[42, 0, 0, 0])?;
//! assert_eq!(target.read_memory(Address::from(0x1000), 4)?, vec![42, 0, 0, 0]);
//! assert!(target.read_memory(Address::from(0x3000), 4).is_err());
//! # Ok::<(), holdfast_core::error::HoldfastError>(())
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, trace};

use crate::error::{HoldfastError, HoldfastResult};
use crate::substrate::{
    AccessKind, CodePatcher, DisassembledInstruction, HardwareTraps, HookId, InstructionDecoder, MemoryAccess,
    MemoryOperand, PatchOperation, PatternScanner, RangeEnumerator, TrapContext, TrapDisposition, TrapHandler,
    TrapKind,
};
use crate::types::{Address, Architecture, MemoryRange, Protection, RegisterContext, ThreadId};

/// Debug-register slots per bank when not configured otherwise (x86-64 DR0-DR3).
pub const DEFAULT_SLOT_LIMIT: usize = 4;

/// Thread the emulated target reports as its control thread.
pub const CONTROL_THREAD: ThreadId = ThreadId(1);

/// A decoded instruction in the emulated instruction table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatedInstruction
{
    /// Encoded length in bytes
    pub length: u64,
    /// Disassembly text
    pub mnemonic: String,
    /// Memory operand, if the instruction touches memory
    pub operand: Option<MemoryOperand>,
}

impl EmulatedInstruction
{
    /// An instruction with no memory operand.
    pub fn new(length: u64, mnemonic: impl Into<String>) -> Self
    {
        Self {
            length,
            mnemonic: mnemonic.into(),
            operand: None,
        }
    }

    /// Attach a memory operand.
    #[must_use]
    pub fn with_operand(mut self, operand: MemoryOperand) -> Self
    {
        self.operand = Some(operand);
        self
    }
}

/// A data watchpoint as programmed into an emulated debug register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedWatchpoint
{
    /// Watched address
    pub address: Address,
    /// Watched length
    pub size: usize,
    /// Watched access kind
    pub access: AccessKind,
}

/// A patch request recorded by the emulated code writer.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchRecord
{
    /// Patch site
    pub address: Address,
    /// Bytes reserved for the patch
    pub max_size: usize,
    /// Writer operations
    pub operations: Vec<PatchOperation>,
}

/// Result of delivering one trap.
#[derive(Debug, Clone)]
pub struct TrapOutcome
{
    /// What the handler decided
    pub disposition: TrapDisposition,
    /// Registers as the handler left them
    pub registers: RegisterContext,
}

#[derive(Debug)]
struct Region
{
    range: MemoryRange,
    bytes: Vec<u8>,
}

impl Region
{
    /// Byte offsets of `[address, address + len)` if the span lies entirely in this region.
    fn span(&self, address: Address, len: usize) -> Option<std::ops::Range<usize>>
    {
        let start = usize::try_from(address.offset_from(self.range.base)?).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.bytes.len()).then_some(start..end)
    }
}

/// In-memory instrumentation host.
pub struct EmulatedTarget
{
    architecture: Architecture,
    breakpoint_limit: usize,
    watchpoint_limit: usize,
    regions: RwLock<Vec<Region>>,
    breakpoints: Mutex<BTreeMap<usize, Address>>,
    watchpoints: Mutex<BTreeMap<usize, ArmedWatchpoint>>,
    instructions: RwLock<BTreeMap<Address, EmulatedInstruction>>,
    patches: Mutex<Vec<PatchRecord>>,
    hooks: Mutex<BTreeMap<HookId, (Address, String)>>,
    next_hook: AtomicU64,
    handler: RwLock<Option<Arc<dyn TrapHandler>>>,
    refuse_traps: AtomicBool,
}

impl fmt::Debug for EmulatedTarget
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("EmulatedTarget")
            .field("architecture", &self.architecture)
            .field("breakpoint_limit", &self.breakpoint_limit)
            .field("watchpoint_limit", &self.watchpoint_limit)
            .field("regions", &self.ranges())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T>
{
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T>
{
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T>
{
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl EmulatedTarget
{
    /// An empty target with [`DEFAULT_SLOT_LIMIT`] slots per bank.
    #[must_use]
    pub fn new(architecture: Architecture) -> Self
    {
        Self {
            architecture,
            breakpoint_limit: DEFAULT_SLOT_LIMIT,
            watchpoint_limit: DEFAULT_SLOT_LIMIT,
            regions: RwLock::new(Vec::new()),
            breakpoints: Mutex::new(BTreeMap::new()),
            watchpoints: Mutex::new(BTreeMap::new()),
            instructions: RwLock::new(BTreeMap::new()),
            patches: Mutex::new(Vec::new()),
            hooks: Mutex::new(BTreeMap::new()),
            next_hook: AtomicU64::new(1),
            handler: RwLock::new(None),
            refuse_traps: AtomicBool::new(false),
        }
    }

    /// Override the number of breakpoint and watchpoint slots.
    #[must_use]
    pub fn with_slot_limits(mut self, breakpoints: usize, watchpoints: usize) -> Self
    {
        self.breakpoint_limit = breakpoints;
        self.watchpoint_limit = watchpoints;
        self
    }

    /// Map a zero-filled region.
    ///
    /// ## Errors
    ///
    /// - `InvalidArgument`: `size` is zero, the region wraps the address
    ///   space, or it overlaps an existing region
    pub fn map(&self, base: Address, size: u64, protection: Protection, file: Option<&str>) -> HoldfastResult<()>
    {
        let len = usize::try_from(size).ok().filter(|len| *len > 0).ok_or_else(|| {
            HoldfastError::InvalidArgument(format!("cannot map a region of {size} bytes at {base}"))
        })?;
        if base.checked_add(size).is_none() {
            return Err(HoldfastError::InvalidArgument(format!(
                "region at {base} of {size} bytes wraps the address space"
            )));
        }

        let range = MemoryRange::new(base, size, protection, file.map(str::to_string));
        let mut regions = write(&self.regions);
        if let Some(existing) = regions
            .iter()
            .find(|region| region.range.base < range.end() && range.base < region.range.end())
        {
            return Err(HoldfastError::InvalidArgument(format!(
                "region at {base} overlaps mapped region at {}",
                existing.range.base
            )));
        }
        debug!(base = %base, size, protection = %protection, "Mapping emulated region");
        regions.push(Region {
            range,
            bytes: vec![0; len],
        });
        regions.sort_by_key(|region| region.range.base);
        Ok(())
    }

    /// Unmap the region starting at `base`. Returns `false` if there was none.
    pub fn unmap(&self, base: Address) -> bool
    {
        let mut regions = write(&self.regions);
        let before = regions.len();
        regions.retain(|region| region.range.base != base);
        regions.len() != before
    }

    /// Change the protection of the region starting at `base`.
    pub fn protect(&self, base: Address, protection: Protection) -> bool
    {
        let mut regions = write(&self.regions);
        match regions.iter_mut().find(|region| region.range.base == base) {
            Some(region) => {
                region.range.protection = protection;
                true
            }
            None => false,
        }
    }

    /// Write bytes ignoring protection, like a loader would.
    ///
    /// ## Errors
    ///
    /// - `MemoryAccess`: the span is not inside one mapped region
    pub fn poke(&self, address: Address, data: &[u8]) -> HoldfastResult<()>
    {
        let mut regions = write(&self.regions);
        let (region, span) = regions
            .iter_mut()
            .find_map(|region| region.span(address, data.len()).map(|span| (region, span)))
            .ok_or_else(|| HoldfastError::memory(address, "address is not mapped"))?;
        region.bytes[span].copy_from_slice(data);
        Ok(())
    }

    /// Every mapped range, ordered by base.
    #[must_use]
    pub fn ranges(&self) -> Vec<MemoryRange>
    {
        read(&self.regions).iter().map(|region| region.range.clone()).collect()
    }

    /// Add or replace an instruction in the decode table.
    pub fn define_instruction(&self, address: Address, instruction: EmulatedInstruction)
    {
        write(&self.instructions).insert(address, instruction);
    }

    /// Execution breakpoints currently programmed, by slot.
    #[must_use]
    pub fn armed_breakpoints(&self) -> Vec<(usize, Address)>
    {
        lock(&self.breakpoints).iter().map(|(slot, address)| (*slot, *address)).collect()
    }

    /// Data watchpoints currently programmed, by slot.
    #[must_use]
    pub fn armed_watchpoints(&self) -> Vec<(usize, ArmedWatchpoint)>
    {
        lock(&self.watchpoints).iter().map(|(slot, watch)| (*slot, *watch)).collect()
    }

    /// Every patch applied so far, oldest first.
    #[must_use]
    pub fn patches(&self) -> Vec<PatchRecord>
    {
        lock(&self.patches).clone()
    }

    /// Currently attached hooks as `(address, code)`, ordered by hook id.
    #[must_use]
    pub fn hooks(&self) -> Vec<(Address, String)>
    {
        lock(&self.hooks).values().cloned().collect()
    }

    /// `true` while a trap handler is installed.
    #[must_use]
    pub fn has_trap_handler(&self) -> bool
    {
        read(&self.handler).is_some()
    }

    /// Make every subsequent debug-register update fail, to exercise error paths.
    pub fn refuse_trap_updates(&self, refuse: bool)
    {
        self.refuse_traps.store(refuse, Ordering::SeqCst);
    }

    fn check_trap_update(&self, slot: usize, limit: usize) -> HoldfastResult<()>
    {
        if self.refuse_traps.load(Ordering::SeqCst) {
            return Err(HoldfastError::Substrate("debug register update refused".to_string()));
        }
        if slot >= limit {
            return Err(HoldfastError::Substrate(format!("slot {slot} is out of range (limit {limit})")));
        }
        Ok(())
    }

    /// A zeroed trap context with `pc` pointing at `address`.
    #[must_use]
    pub fn trap_context(&self, thread: ThreadId, kind: TrapKind, address: Address) -> TrapContext
    {
        let mut registers = RegisterContext::new(self.architecture);
        registers.pc = address;
        TrapContext {
            thread,
            kind,
            address,
            registers,
            fault_address: None,
        }
    }

    /// Deliver a trap at `address` on `thread` with zeroed registers.
    ///
    /// See [`EmulatedTarget::deliver`].
    pub fn raise_trap(&self, thread: ThreadId, kind: TrapKind, address: Address) -> TrapOutcome
    {
        self.deliver(self.trap_context(thread, kind, address))
    }

    /// Synchronously run the installed handler on `context`, on the calling thread.
    ///
    /// Blocks for as long as the handler does. Without a handler the trap
    /// propagates.
    pub fn deliver(&self, mut context: TrapContext) -> TrapOutcome
    {
        let handler = read(&self.handler).clone();
        trace!(thread = %context.thread, kind = %context.kind, address = %context.address, "Delivering emulated trap");
        let disposition = match handler {
            Some(handler) => handler.on_trap(&mut context),
            None => TrapDisposition::Propagate,
        };
        TrapOutcome {
            disposition,
            registers: context.registers,
        }
    }
}

impl MemoryAccess for EmulatedTarget
{
    fn read_memory(&self, address: Address, len: usize) -> HoldfastResult<Vec<u8>>
    {
        let regions = read(&self.regions);
        for region in regions.iter() {
            if let Some(span) = region.span(address, len) {
                if !region.range.protection.read {
                    return Err(HoldfastError::memory(address, "region is not readable"));
                }
                return Ok(region.bytes[span].to_vec());
            }
        }
        Err(HoldfastError::memory(address, format!("{len} bytes are not mapped")))
    }

    fn write_memory(&self, address: Address, data: &[u8]) -> HoldfastResult<()>
    {
        let mut regions = write(&self.regions);
        for region in regions.iter_mut() {
            if let Some(span) = region.span(address, data.len()) {
                if !region.range.protection.write {
                    return Err(HoldfastError::memory(address, "region is not writable"));
                }
                region.bytes[span].copy_from_slice(data);
                return Ok(());
            }
        }
        Err(HoldfastError::memory(address, format!("{} bytes are not mapped", data.len())))
    }
}

impl PatternScanner for EmulatedTarget {}

impl RangeEnumerator for EmulatedTarget
{
    fn enumerate_ranges(&self, filter: Protection) -> HoldfastResult<Vec<MemoryRange>>
    {
        Ok(read(&self.regions)
            .iter()
            .filter(|region| region.range.protection.satisfies(filter))
            .map(|region| region.range.clone())
            .collect())
    }
}

impl HardwareTraps for EmulatedTarget
{
    fn breakpoint_slots(&self) -> usize
    {
        self.breakpoint_limit
    }

    fn watchpoint_slots(&self) -> usize
    {
        self.watchpoint_limit
    }

    fn control_thread(&self) -> HoldfastResult<ThreadId>
    {
        Ok(CONTROL_THREAD)
    }

    fn set_hardware_breakpoint(&self, thread: ThreadId, slot: usize, address: Address) -> HoldfastResult<()>
    {
        self.check_trap_update(slot, self.breakpoint_limit)?;
        trace!(thread = %thread, slot, address = %address, "Arming emulated breakpoint");
        lock(&self.breakpoints).insert(slot, address);
        Ok(())
    }

    fn unset_hardware_breakpoint(&self, thread: ThreadId, slot: usize) -> HoldfastResult<()>
    {
        self.check_trap_update(slot, self.breakpoint_limit)?;
        trace!(thread = %thread, slot, "Clearing emulated breakpoint");
        lock(&self.breakpoints).remove(&slot);
        Ok(())
    }

    fn set_hardware_watchpoint(
        &self,
        thread: ThreadId,
        slot: usize,
        address: Address,
        size: usize,
        access: AccessKind,
    ) -> HoldfastResult<()>
    {
        self.check_trap_update(slot, self.watchpoint_limit)?;
        trace!(thread = %thread, slot, address = %address, size, access = %access, "Arming emulated watchpoint");
        lock(&self.watchpoints).insert(
            slot,
            ArmedWatchpoint {
                address,
                size,
                access,
            },
        );
        Ok(())
    }

    fn unset_hardware_watchpoint(&self, thread: ThreadId, slot: usize) -> HoldfastResult<()>
    {
        self.check_trap_update(slot, self.watchpoint_limit)?;
        trace!(thread = %thread, slot, "Clearing emulated watchpoint");
        lock(&self.watchpoints).remove(&slot);
        Ok(())
    }

    fn install_trap_handler(&self, handler: Arc<dyn TrapHandler>)
    {
        *write(&self.handler) = Some(handler);
    }

    fn remove_trap_handler(&self)
    {
        write(&self.handler).take();
    }
}

impl InstructionDecoder for EmulatedTarget
{
    fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    fn memory_operand(&self, address: Address) -> HoldfastResult<Option<MemoryOperand>>
    {
        read(&self.instructions)
            .get(&address)
            .map(|instruction| instruction.operand)
            .ok_or_else(|| no_instruction(address))
    }

    fn next_instruction(&self, address: Address) -> HoldfastResult<Address>
    {
        read(&self.instructions)
            .get(&address)
            .map(|instruction| address + instruction.length)
            .ok_or_else(|| no_instruction(address))
    }

    fn disassemble(&self, address: Address, count: usize) -> HoldfastResult<Vec<DisassembledInstruction>>
    {
        let instructions = read(&self.instructions);
        let ranges = self.ranges();
        let mut listing = Vec::with_capacity(count);
        let mut cursor = address;

        for _ in 0..count {
            let instruction = instructions.get(&cursor).ok_or_else(|| no_instruction(cursor))?;
            let offset = ranges
                .iter()
                .find(|range| range.contains(cursor))
                .and_then(|range| cursor.offset_from(range.base))
                .unwrap_or(0);
            listing.push(DisassembledInstruction {
                address: cursor,
                offset,
                mnemonic: instruction.mnemonic.clone(),
            });
            cursor = cursor + instruction.length;
        }
        Ok(listing)
    }
}

impl CodePatcher for EmulatedTarget
{
    fn patch_code(&self, address: Address, max_size: usize, operations: &[PatchOperation]) -> HoldfastResult<()>
    {
        if !self.ranges().iter().any(|range| range.contains(address)) {
            return Err(HoldfastError::memory(address, "patch site is not mapped"));
        }
        debug!(address = %address, max_size, operations = operations.len(), "Recording emulated patch");
        lock(&self.patches).push(PatchRecord {
            address,
            max_size,
            operations: operations.to_vec(),
        });
        Ok(())
    }

    fn attach_hook(&self, address: Address, code: &str) -> HoldfastResult<HookId>
    {
        let hook = HookId(self.next_hook.fetch_add(1, Ordering::SeqCst));
        lock(&self.hooks).insert(hook, (address, code.to_string()));
        Ok(hook)
    }

    fn detach_hook(&self, hook: HookId) -> HoldfastResult<()>
    {
        lock(&self.hooks)
            .remove(&hook)
            .map(|_| ())
            .ok_or_else(|| HoldfastError::Substrate(format!("hook {} is not attached", hook.0)))
    }
}

fn no_instruction(address: Address) -> HoldfastError
{
    HoldfastError::Substrate(format!("no instruction decoded at {address}"))
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn target() -> EmulatedTarget
    {
        let target = EmulatedTarget::new(Architecture::X86_64);
        target
            .map(Address::from(0x1000), 0x1000, Protection::READ_WRITE, None)
            .unwrap();
        target
            .map(Address::from(0x4000), 0x1000, Protection::READ_EXECUTE, Some("/usr/lib/libdemo.so"))
            .unwrap();
        target
    }

    #[test]
    fn test_protection_is_enforced()
    {
        let target = target();
        assert!(target.write_memory(Address::from(0x4000), &[0x90]).is_err());
        target.poke(Address::from(0x4000), &[0x90]).unwrap();
        assert_eq!(target.read_memory(Address::from(0x4000), 1).unwrap(), vec![0x90]);
    }

    #[test]
    fn test_reads_do_not_cross_region_end()
    {
        let target = target();
        assert!(target.read_memory(Address::from(0x1ffe), 2).is_ok());
        assert!(target.read_memory(Address::from(0x1ffe), 4).is_err());
    }

    #[test]
    fn test_overlapping_map_is_rejected()
    {
        let target = target();
        let err = target
            .map(Address::from(0x1800), 0x1000, Protection::READ_WRITE, None)
            .unwrap_err();
        assert!(matches!(err, HoldfastError::InvalidArgument(_)));
    }

    #[test]
    fn test_enumerate_filters_by_protection()
    {
        let target = target();
        let writable = target.enumerate_ranges(Protection::READ_WRITE).unwrap();
        assert_eq!(writable.len(), 1);
        assert_eq!(writable[0].base, Address::from(0x1000));
    }

    #[test]
    fn test_default_scanner_finds_overlapping_matches()
    {
        let target = target();
        target.write_memory(Address::from(0x1010), &[7, 7, 7]).unwrap();
        let range = target.ranges()[0].clone();
        let found = target.scan_range(&range, &[7, 7]).unwrap();
        assert_eq!(found, vec![Address::from(0x1010), Address::from(0x1011)]);
    }

    #[test]
    fn test_disassemble_reports_offsets()
    {
        let target = target();
        target.define_instruction(Address::from(0x4010), EmulatedInstruction::new(3, "mov eax, ebx"));
        target.define_instruction(Address::from(0x4013), EmulatedInstruction::new(1, "ret"));
        let listing = target.disassemble(Address::from(0x4010), 2).unwrap();
        assert_eq!(listing[0].offset, 0x10);
        assert_eq!(listing[1].address, Address::from(0x4013));
        assert_eq!(listing[1].mnemonic, "ret");
        assert!(target.disassemble(Address::from(0x4010), 3).is_err());
    }

    #[test]
    fn test_trap_without_handler_propagates()
    {
        let target = target();
        let outcome = target.raise_trap(CONTROL_THREAD, TrapKind::Breakpoint, Address::from(0x4010));
        assert_eq!(outcome.disposition, TrapDisposition::Propagate);
    }
}
