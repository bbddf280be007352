//! Tests for trap classification, pausing and register access

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use holdfast_core::agent::{Agent, AgentOptions};
use holdfast_core::error::HoldfastError;
use holdfast_core::events::{AgentEvent, EventReceiver};
use holdfast_core::exception::CoordinatorState;
use holdfast_core::platform::emulated::{EmulatedInstruction, EmulatedTarget, TrapOutcome, CONTROL_THREAD};
use holdfast_core::registers::RegisterWrite;
use holdfast_core::stoppoints::StoppointMode;
use holdfast_core::substrate::{AccessKind, MemoryOperand, TrapDisposition, TrapKind};
use holdfast_core::types::{
    Address, Architecture, Protection, RegisterId, RegisterInput, RegisterValue, ThreadId, X86_64Register,
};

const DATA: u64 = 0x10000;
const CODE: u64 = 0x40000;
/// `mov dword ptr [rax + 0x10], 5`
const STORE: u64 = 0x40010;
/// `mov ecx, dword ptr [rax + 0x10]`
const LOAD: u64 = 0x40020;
const NOP: u64 = 0x40030;
const NOP2: u64 = 0x40031;

const WAIT: Duration = Duration::from_secs(5);

fn setup() -> (Arc<EmulatedTarget>, Agent, EventReceiver)
{
    let target = Arc::new(EmulatedTarget::new(Architecture::X86_64));
    target
        .map(Address::from(DATA), 0x1000, Protection::READ_WRITE, None)
        .unwrap();
    target
        .map(Address::from(CODE), 0x1000, Protection::READ_EXECUTE, Some("/opt/game/bin/game"))
        .unwrap();

    let rax = RegisterId::X86_64(X86_64Register::Rax);
    target.define_instruction(
        Address::from(STORE),
        EmulatedInstruction::new(7, "mov dword ptr [rax + 0x10], 5").with_operand(MemoryOperand {
            base: rax,
            displacement: 0x10,
            access: AccessKind::Write,
        }),
    );
    target.define_instruction(
        Address::from(LOAD),
        EmulatedInstruction::new(3, "mov ecx, dword ptr [rax + 0x10]").with_operand(MemoryOperand {
            base: rax,
            displacement: 0x10,
            access: AccessKind::Read,
        }),
    );
    target.define_instruction(Address::from(NOP), EmulatedInstruction::new(1, "nop"));
    target.define_instruction(Address::from(NOP2), EmulatedInstruction::new(1, "nop"));

    let (agent, events) = Agent::new(target.clone(), AgentOptions::default());
    (target, agent, events)
}

/// Deliver a trap from a simulated target thread with `rax` preset.
fn trap_on(target: &Arc<EmulatedTarget>, kind: TrapKind, pc: u64, rax: u64) -> JoinHandle<TrapOutcome>
{
    let target = Arc::clone(target);
    thread::spawn(move || deliver(&target, CONTROL_THREAD, kind, pc, rax))
}

fn deliver(target: &EmulatedTarget, thread: ThreadId, kind: TrapKind, pc: u64, rax: u64) -> TrapOutcome
{
    let mut context = target.trap_context(thread, kind, Address::from(pc));
    context
        .registers
        .set(RegisterId::X86_64(X86_64Register::Rax), RegisterValue::Numeric(rax))
        .expect("rax is part of the x86-64 snapshot");
    target.deliver(context)
}

#[test]
fn test_breakpoint_pauses_until_resume()
{
    let (target, agent, events) = setup();
    assert_eq!(agent.add_stoppoint(Address::from(NOP), StoppointMode::Execute, 1).unwrap(), 0);

    let trapped = trap_on(&target, TrapKind::Breakpoint, NOP, DATA);
    let event = events.recv_timeout(WAIT).unwrap();
    assert_eq!(
        event,
        AgentEvent::Breakpoint {
            address: Address::from(NOP),
            slot: 0,
        }
    );
    assert_eq!(
        agent.state(),
        CoordinatorState::Paused {
            thread: CONTROL_THREAD,
            address: Address::from(NOP),
        }
    );
    assert_eq!(agent.read_register("pc").unwrap(), RegisterValue::Address(Address::from(NOP)));
    assert_eq!(agent.read_register("rax").unwrap(), RegisterValue::Address(Address::from(DATA)));
    assert!(!trapped.is_finished());

    agent.resume().unwrap();
    let outcome = trapped.join().unwrap();
    assert_eq!(outcome.disposition, TrapDisposition::Handled);
    assert_eq!(agent.state(), CoordinatorState::Running);
}

#[test]
fn test_breakpoint_is_one_shot()
{
    let (target, agent, events) = setup();
    agent.add_stoppoint(Address::from(NOP), StoppointMode::Execute, 1).unwrap();

    let trapped = trap_on(&target, TrapKind::Breakpoint, NOP, 0);
    events.recv_timeout(WAIT).unwrap();
    agent.resume().unwrap();
    trapped.join().unwrap();

    assert!(agent.list_stoppoints().is_empty());
    assert!(target.armed_breakpoints().is_empty());

    // A second trap at the same address steps over without an event
    let outcome = target.raise_trap(CONTROL_THREAD, TrapKind::Breakpoint, Address::from(NOP));
    assert_eq!(outcome.disposition, TrapDisposition::Handled);
    assert_eq!(outcome.registers.pc, Address::from(NOP2));
    assert!(events.try_recv().is_err());
}

#[test]
fn test_register_edits_apply_on_resume()
{
    let (target, agent, events) = setup();
    agent.add_stoppoint(Address::from(NOP), StoppointMode::Execute, 1).unwrap();

    let trapped = trap_on(&target, TrapKind::Breakpoint, NOP, DATA);
    events.recv_timeout(WAIT).unwrap();

    assert_eq!(
        agent.write_register("pc", RegisterInput::Number(NOP2)).unwrap(),
        RegisterWrite::Applied
    );
    assert_eq!(
        agent
            .write_register("rax", RegisterInput::Text("0x1234".to_string()))
            .unwrap(),
        RegisterWrite::Applied
    );
    assert_eq!(
        agent.write_register("xmm0", RegisterInput::Number(1)).unwrap(),
        RegisterWrite::Ignored
    );
    let err = agent.write_register("x0", RegisterInput::Number(1)).unwrap_err();
    assert!(matches!(err, HoldfastError::InvalidArgument(_)));

    agent.resume().unwrap();
    let outcome = trapped.join().unwrap();
    assert_eq!(outcome.registers.pc, Address::from(NOP2));
    assert_eq!(
        outcome.registers.get(RegisterId::X86_64(X86_64Register::Rax)),
        Some(RegisterValue::Address(Address::from(0x1234)))
    );
}

#[test]
fn test_write_watchpoint_ignores_reads_and_pauses_on_writes()
{
    let (target, agent, events) = setup();
    let watched = Address::from(DATA + 0x10);
    assert_eq!(agent.add_stoppoint(watched, StoppointMode::Write, 4).unwrap(), 0);

    // A load from the watched address silently advances
    let outcome = deliver(&target, CONTROL_THREAD, TrapKind::SingleStep, LOAD, DATA);
    assert_eq!(outcome.disposition, TrapDisposition::Handled);
    assert_eq!(outcome.registers.pc, Address::from(LOAD + 3));
    assert!(events.try_recv().is_err());

    // A store pauses
    let trapped = trap_on(&target, TrapKind::SingleStep, STORE, DATA);
    let event = events.recv_timeout(WAIT).unwrap();
    assert_eq!(
        event,
        AgentEvent::Watchpoint {
            address: watched,
            operation: AccessKind::Write,
            size: 4,
            slot: 0,
            program_counter: Address::from(STORE),
        }
    );
    assert!(agent.state() != CoordinatorState::Running);

    agent.resume().unwrap();
    assert_eq!(trapped.join().unwrap().disposition, TrapDisposition::Handled);

    // Watchpoints persist
    assert_eq!(agent.list_stoppoints().len(), 1);
}

#[test]
fn test_access_outside_watchpoint_advances()
{
    let (target, agent, events) = setup();
    agent
        .add_stoppoint(Address::from(DATA + 0x100), StoppointMode::ReadWrite, 4)
        .unwrap();

    let outcome = deliver(&target, CONTROL_THREAD, TrapKind::SingleStep, STORE, DATA);
    assert_eq!(outcome.disposition, TrapDisposition::Handled);
    assert_eq!(outcome.registers.pc, Address::from(STORE + 7));
    assert!(events.try_recv().is_err());
}

#[test]
fn test_registers_unavailable_while_running()
{
    let (_target, agent, _events) = setup();

    assert!(matches!(agent.read_register("pc"), Err(HoldfastError::StateError(_))));
    assert!(matches!(
        agent.write_register("pc", RegisterInput::Number(0)),
        Err(HoldfastError::StateError(_))
    ));
    assert!(matches!(agent.resume(), Err(HoldfastError::StateError(_))));
}

#[test]
fn test_other_threads_are_not_stoppoints()
{
    let (target, agent, events) = setup();
    agent.add_stoppoint(Address::from(NOP), StoppointMode::Execute, 1).unwrap();

    let outcome = target.raise_trap(ThreadId(2), TrapKind::Breakpoint, Address::from(NOP));
    assert_eq!(outcome.disposition, TrapDisposition::Propagate);
    assert!(events.try_recv().is_err());
    assert_eq!(agent.list_stoppoints().len(), 1);
}

#[test]
fn test_access_violation_advances_on_any_thread()
{
    let (target, _agent, _events) = setup();

    let outcome = deliver(&target, ThreadId(2), TrapKind::AccessViolation, STORE, 0);
    assert_eq!(outcome.disposition, TrapDisposition::Handled);
    assert_eq!(outcome.registers.pc, Address::from(STORE + 7));
}

#[test]
fn test_unknown_traps_propagate()
{
    let (target, _agent, _events) = setup();

    let outcome = target.raise_trap(CONTROL_THREAD, TrapKind::Unknown, Address::from(NOP));
    assert_eq!(outcome.disposition, TrapDisposition::Propagate);

    // Nothing decodable at the trap address
    let outcome = target.raise_trap(CONTROL_THREAD, TrapKind::SingleStep, Address::from(CODE + 0x800));
    assert_eq!(outcome.disposition, TrapDisposition::Propagate);
}

#[test]
fn test_second_pause_is_deferred()
{
    let (target, agent, events) = setup();
    agent.add_stoppoint(Address::from(NOP), StoppointMode::Execute, 1).unwrap();
    agent.add_stoppoint(Address::from(NOP2), StoppointMode::Execute, 1).unwrap();
    agent
        .add_stoppoint(Address::from(DATA + 0x10), StoppointMode::Write, 4)
        .unwrap();

    let trapped = trap_on(&target, TrapKind::Breakpoint, NOP, DATA);
    events.recv_timeout(WAIT).unwrap();

    // A breakpoint hit during the pause stays armed and does not pause
    let outcome = target.raise_trap(CONTROL_THREAD, TrapKind::Breakpoint, Address::from(NOP2));
    assert_eq!(outcome.disposition, TrapDisposition::Handled);
    assert!(agent
        .list_stoppoints()
        .iter()
        .any(|stoppoint| stoppoint.address == Address::from(NOP2)));

    // A watchpoint hit during the pause steps over
    let outcome = deliver(&target, CONTROL_THREAD, TrapKind::SingleStep, STORE, DATA);
    assert_eq!(outcome.registers.pc, Address::from(STORE + 7));
    assert!(events.try_recv().is_err());

    agent.resume().unwrap();
    trapped.join().unwrap();
}

#[test]
fn test_shutdown_releases_pause_and_handler()
{
    let (target, agent, events) = setup();
    agent.add_stoppoint(Address::from(NOP), StoppointMode::Execute, 1).unwrap();
    agent
        .add_stoppoint(Address::from(DATA + 0x10), StoppointMode::Write, 4)
        .unwrap();

    let trapped = trap_on(&target, TrapKind::Breakpoint, NOP, DATA);
    events.recv_timeout(WAIT).unwrap();

    agent.shutdown();
    assert_eq!(trapped.join().unwrap().disposition, TrapDisposition::Handled);
    assert!(!target.has_trap_handler());
    assert!(target.armed_watchpoints().is_empty());
    assert_eq!(agent.state(), CoordinatorState::Running);
}
