//! Tests for value freezing and the freeze loop

use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use holdfast_core::agent::{Agent, AgentOptions};
use holdfast_core::error::{HoldfastError, HoldfastResult};
use holdfast_core::freeze::{FreezeLoop, FreezeTable, FREEZE_WIDTH};
use holdfast_core::platform::emulated::EmulatedTarget;
use holdfast_core::substrate::{
    AccessKind, CodePatcher, DisassembledInstruction, HardwareTraps, HookId, InstructionDecoder, MemoryAccess,
    MemoryOperand, PatchOperation, PatternScanner, RangeEnumerator, TrapHandler,
};
use holdfast_core::types::{Address, Architecture, MemoryRange, Protection, Scalar, ThreadId, Width};

const HEAP: u64 = 0x10000;
const INTERVAL: Duration = Duration::from_millis(10);

fn target() -> Arc<EmulatedTarget>
{
    let target = Arc::new(EmulatedTarget::new(Architecture::Arm64));
    target
        .map(Address::from(HEAP), 0x1000, Protection::READ_WRITE, None)
        .unwrap();
    target
}

fn read_u32(target: &EmulatedTarget, address: u64) -> u32
{
    let bytes = target.read_memory(Address::from(address), 4).unwrap();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn write_u32(target: &EmulatedTarget, address: u64, value: u32)
{
    target
        .write_memory(Address::from(address), &value.to_le_bytes())
        .unwrap();
}

/// Emulated target whose memory writes announce themselves and then stall.
struct StallingWrites
{
    inner: Arc<EmulatedTarget>,
    started: mpsc::Sender<Address>,
    stall: Duration,
}

impl MemoryAccess for StallingWrites
{
    fn read_memory(&self, address: Address, len: usize) -> HoldfastResult<Vec<u8>>
    {
        self.inner.read_memory(address, len)
    }

    fn write_memory(&self, address: Address, data: &[u8]) -> HoldfastResult<()>
    {
        let _ = self.started.send(address);
        thread::sleep(self.stall);
        self.inner.write_memory(address, data)
    }
}

impl RangeEnumerator for StallingWrites
{
    fn enumerate_ranges(&self, filter: Protection) -> HoldfastResult<Vec<MemoryRange>>
    {
        self.inner.enumerate_ranges(filter)
    }
}

impl PatternScanner for StallingWrites {}

impl HardwareTraps for StallingWrites
{
    fn breakpoint_slots(&self) -> usize
    {
        self.inner.breakpoint_slots()
    }

    fn watchpoint_slots(&self) -> usize
    {
        self.inner.watchpoint_slots()
    }

    fn control_thread(&self) -> HoldfastResult<ThreadId>
    {
        self.inner.control_thread()
    }

    fn set_hardware_breakpoint(&self, thread: ThreadId, slot: usize, address: Address) -> HoldfastResult<()>
    {
        self.inner.set_hardware_breakpoint(thread, slot, address)
    }

    fn unset_hardware_breakpoint(&self, thread: ThreadId, slot: usize) -> HoldfastResult<()>
    {
        self.inner.unset_hardware_breakpoint(thread, slot)
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
        self.inner.set_hardware_watchpoint(thread, slot, address, size, access)
    }

    fn unset_hardware_watchpoint(&self, thread: ThreadId, slot: usize) -> HoldfastResult<()>
    {
        self.inner.unset_hardware_watchpoint(thread, slot)
    }

    fn install_trap_handler(&self, handler: Arc<dyn TrapHandler>)
    {
        self.inner.install_trap_handler(handler);
    }

    fn remove_trap_handler(&self)
    {
        self.inner.remove_trap_handler();
    }
}

impl InstructionDecoder for StallingWrites
{
    fn architecture(&self) -> Architecture
    {
        self.inner.architecture()
    }

    fn memory_operand(&self, address: Address) -> HoldfastResult<Option<MemoryOperand>>
    {
        self.inner.memory_operand(address)
    }

    fn next_instruction(&self, address: Address) -> HoldfastResult<Address>
    {
        self.inner.next_instruction(address)
    }

    fn disassemble(&self, address: Address, count: usize) -> HoldfastResult<Vec<DisassembledInstruction>>
    {
        self.inner.disassemble(address, count)
    }
}

impl CodePatcher for StallingWrites
{
    fn patch_code(&self, address: Address, max_size: usize, operations: &[PatchOperation]) -> HoldfastResult<()>
    {
        self.inner.patch_code(address, max_size, operations)
    }

    fn attach_hook(&self, address: Address, code: &str) -> HoldfastResult<HookId>
    {
        self.inner.attach_hook(address, code)
    }

    fn detach_hook(&self, hook: HookId) -> HoldfastResult<()>
    {
        self.inner.detach_hook(hook)
    }
}

#[test]
fn test_freeze_captures_four_byte_unsigned()
{
    let target = target();
    let table = FreezeTable::new(target.clone());
    target
        .write_memory(Address::from(HEAP), &u64::MAX.to_le_bytes())
        .unwrap();

    let value = table.freeze(Address::from(HEAP)).unwrap();
    assert_eq!(value, Scalar::Unsigned(0xffff_ffff));
    let frozen = table.list();
    assert_eq!(frozen.len(), 1);
    assert_eq!(frozen[0].width, FREEZE_WIDTH);
    assert!(!frozen[0].signed);
}

#[test]
fn test_enforce_reverts_external_writes()
{
    let target = target();
    let table = FreezeTable::new(target.clone());
    write_u32(&target, HEAP, 100);
    table.freeze(Address::from(HEAP)).unwrap();

    write_u32(&target, HEAP, 5);
    assert_eq!(table.enforce(), 0);
    assert_eq!(read_u32(&target, HEAP), 100);
}

#[test]
fn test_update_replaces_enforced_value()
{
    let target = target();
    let table = FreezeTable::new(target.clone());
    table.freeze(Address::from(HEAP)).unwrap();

    table.update(Address::from(HEAP), Scalar::from(250u32)).unwrap();
    table.enforce();
    assert_eq!(read_u32(&target, HEAP), 250);

    // Entries are unsigned, so a negative update is stored as its 4-byte pattern
    table.update(Address::from(HEAP), Scalar::Signed(-1)).unwrap();
    assert_eq!(table.list()[0].value, Scalar::Unsigned(0xffff_ffff));
    table.enforce();
    assert_eq!(read_u32(&target, HEAP), 0xffff_ffff);

    let err = table
        .update(Address::from(HEAP + 4), Scalar::from(1u32))
        .unwrap_err();
    assert!(matches!(err, HoldfastError::NotFound(_)));
}

#[test]
fn test_failed_write_drops_entry()
{
    let target = target();
    let table = FreezeTable::new(target.clone());
    table.freeze(Address::from(HEAP)).unwrap();

    target.protect(Address::from(HEAP), "r--".parse().unwrap());
    assert_eq!(table.enforce(), 1);
    assert!(!table.is_frozen(Address::from(HEAP)));
}

#[test]
fn test_unfreeze_during_enforce_is_not_reverted()
{
    let target = target();
    write_u32(&target, HEAP, 7);
    let (started, write_started) = mpsc::channel();
    let table = Arc::new(FreezeTable::new(Arc::new(StallingWrites {
        inner: target.clone(),
        started,
        stall: Duration::from_millis(50),
    })));
    table.freeze(Address::from(HEAP)).unwrap();

    let enforcing = {
        let table = table.clone();
        thread::spawn(move || table.enforce())
    };
    assert_eq!(write_started.recv().unwrap(), Address::from(HEAP));

    // Waits out the in-flight write-back; nothing is written after it returns
    table.unfreeze(Address::from(HEAP)).unwrap();
    write_u32(&target, HEAP, 99);

    assert_eq!(enforcing.join().unwrap(), 0);
    assert_eq!(read_u32(&target, HEAP), 99);
    assert!(table.list().is_empty());
}

#[test]
fn test_refreeze_during_failed_enforce_is_kept()
{
    let target = target();
    let (started, write_started) = mpsc::channel();
    let table = Arc::new(FreezeTable::new(Arc::new(StallingWrites {
        inner: target.clone(),
        started,
        stall: Duration::from_millis(50),
    })));
    table.freeze(Address::from(HEAP)).unwrap();
    target.protect(Address::from(HEAP), "r--".parse().unwrap());

    let enforcing = {
        let table = table.clone();
        thread::spawn(move || table.enforce())
    };
    write_started.recv().unwrap();

    // The recapture lands after the failed write has dropped the old entry
    target.protect(Address::from(HEAP), Protection::READ_WRITE);
    table.freeze(Address::from(HEAP)).unwrap();

    assert_eq!(enforcing.join().unwrap(), 1);
    assert!(table.is_frozen(Address::from(HEAP)));
}

#[test]
fn test_unfreeze_unknown_is_not_found()
{
    let target = target();
    let table = FreezeTable::new(target);
    let err = table.unfreeze(Address::from(HEAP)).unwrap_err();
    assert!(matches!(err, HoldfastError::NotFound(_)));
}

#[test]
fn test_freeze_unmapped_fails()
{
    let target = target();
    let table = FreezeTable::new(target);
    let err = table.freeze(Address::from(0x9000_0000)).unwrap_err();
    assert!(matches!(err, HoldfastError::MemoryAccess { .. }));
}

#[tokio::test]
async fn test_loop_reverts_within_an_interval()
{
    let target = target();
    let options = AgentOptions {
        freeze_interval: INTERVAL,
        ..AgentOptions::default()
    };
    let (agent, _events) = Agent::new(target.clone(), options);
    agent.start_freeze_loop(&tokio::runtime::Handle::current());

    agent
        .write(Address::from(HEAP), Scalar::from(77u32), Width::Four, false)
        .unwrap();
    assert_eq!(agent.freeze(Address::from(HEAP)).unwrap(), Scalar::Unsigned(77));

    write_u32(&target, HEAP, 1);
    tokio::time::sleep(INTERVAL * 10).await;
    assert_eq!(read_u32(&target, HEAP), 77);

    agent.unfreeze(Address::from(HEAP)).unwrap();
    write_u32(&target, HEAP, 2);
    tokio::time::sleep(INTERVAL * 10).await;
    assert_eq!(read_u32(&target, HEAP), 2);

    agent.shutdown();
}

#[tokio::test]
async fn test_loop_stops_on_join()
{
    let target = target();
    let table = Arc::new(FreezeTable::new(target.clone()));
    table.freeze(Address::from(HEAP)).unwrap();

    let running = FreezeLoop::spawn(table.clone(), INTERVAL, &tokio::runtime::Handle::current());
    tokio::time::sleep(INTERVAL * 3).await;
    assert!(!running.is_finished());
    running.join().await;

    write_u32(&target, HEAP, 9);
    tokio::time::sleep(INTERVAL * 5).await;
    assert_eq!(read_u32(&target, HEAP), 9);
}

#[tokio::test]
async fn test_loop_drops_vanished_addresses()
{
    let target = target();
    let table = Arc::new(FreezeTable::new(target.clone()));
    table.freeze(Address::from(HEAP)).unwrap();
    let running = FreezeLoop::spawn(table.clone(), INTERVAL, &tokio::runtime::Handle::current());

    assert!(target.unmap(Address::from(HEAP)));
    tokio::time::sleep(INTERVAL * 10).await;
    assert!(table.list().is_empty());

    running.join().await;
}
