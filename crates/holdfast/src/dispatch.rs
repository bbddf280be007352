//! Mapping control-channel commands onto the agent.

use std::sync::Arc;
use std::thread;

use holdfast_core::agent::Agent;
use holdfast_core::error::{HoldfastError, HoldfastResult};
use holdfast_core::events::AgentEvent;
use holdfast_core::freeze::FrozenValue;
use holdfast_core::platform::emulated::{EmulatedTarget, CONTROL_THREAD};
use holdfast_core::scan::ScanPage;
use holdfast_core::stoppoints::{Stoppoint, StoppointMode};
use holdfast_core::substrate::{PatchOperation, TrapKind};
use holdfast_core::types::{Address, RegisterInput, RegisterValue, Scalar, ThreadId, Width};
use holdfast_protocol::{Command, EventMessage, Reply, Request, WireAddress, WireRegisterValue, WireScalar};
use holdfast_utils::{debug, warn};
use serde_json::{json, Value};

/// Executes [`Request`]s against an [`Agent`] running on an [`EmulatedTarget`].
#[derive(Debug, Clone)]
pub struct Dispatcher
{
    agent: Arc<Agent>,
    target: Arc<EmulatedTarget>,
}

impl Dispatcher
{
    pub fn new(agent: Arc<Agent>, target: Arc<EmulatedTarget>) -> Self
    {
        Self { agent, target }
    }

    /// Parse one line of the channel and execute it.
    pub fn handle_line(&self, line: &str) -> Reply
    {
        match serde_json::from_str::<Request>(line) {
            Ok(request) => self.handle(request),
            Err(err) => Reply::error(None, format!("invalid request: {err}"), "InvalidArgument"),
        }
    }

    pub fn handle(&self, request: Request) -> Reply
    {
        let name = request.command.name();
        debug!(command = name, request_id = ?request.request_id, "Dispatching");
        match self.execute(request.command) {
            Ok(result) => Reply::ok(request.request_id, result),
            Err(err) => {
                debug!(command = name, kind = err.kind(), error = %err, "Command failed");
                Reply::error(request.request_id, err.to_string(), err.kind())
            }
        }
    }

    fn execute(&self, command: Command) -> HoldfastResult<Value>
    {
        let agent = &self.agent;
        match command {
            Command::Ping => Ok(json!(agent.ping())),
            Command::Log { message } => {
                agent.log(&message);
                Ok(Value::Null)
            }

            Command::Read { address, width, signed } => {
                let value = agent.read(parse_address(&address)?, Width::try_from(width)?, signed)?;
                Ok(scalar_json(value))
            }
            Command::Write {
                address,
                value,
                width,
                signed,
            } => {
                agent.write(parse_address(&address)?, parse_scalar(&value)?, Width::try_from(width)?, signed)?;
                Ok(Value::Null)
            }
            Command::ReadString { address, max_length } => {
                Ok(json!(agent.read_string(parse_address(&address)?, max_length)?))
            }
            Command::WriteString { address, value } => {
                agent.write_string(parse_address(&address)?, &value)?;
                Ok(Value::Null)
            }
            Command::ReadBytes { address, length } => Ok(json!(agent.read_bytes(parse_address(&address)?, length)?)),
            Command::WriteBytes { address, bytes } => {
                agent.write_bytes(parse_address(&address)?, &bytes)?;
                Ok(Value::Null)
            }
            Command::Hexdump { address, length } => Ok(json!(agent.hexdump(parse_address(&address)?, length)?)),
            Command::GetMemoryMaps => {
                let maps: Vec<Value> = agent
                    .memory_maps()?
                    .into_iter()
                    .map(|map| {
                        json!({
                            "name": map.name,
                            "baseAddress": map.base_address.to_string(),
                            "protection": map.protection.to_string(),
                        })
                    })
                    .collect();
                Ok(Value::Array(maps))
            }

            Command::AddStoppoint { address, mode, size } => {
                let mode: StoppointMode = mode.parse()?;
                Ok(json!(agent.add_stoppoint(parse_address(&address)?, mode, size)?))
            }
            Command::RemoveStoppoint { address, mode } => {
                let mode: StoppointMode = mode.parse()?;
                agent.remove_stoppoint(parse_address(&address)?, mode)?;
                Ok(Value::Null)
            }
            Command::ListStoppoints => Ok(Value::Array(
                agent.list_stoppoints().iter().map(stoppoint_json).collect(),
            )),
            Command::Resume => {
                agent.resume()?;
                Ok(Value::Null)
            }
            Command::ReadRegister { id } => Ok(register_json(agent.read_register(&id)?)),
            Command::WriteRegister { id, value } => {
                let outcome = agent.write_register(&id, register_input(value))?;
                Ok(json!({ "applied": outcome.is_applied() }))
            }

            Command::Freeze { address } => Ok(scalar_json(agent.freeze(parse_address(&address)?)?)),
            Command::Unfreeze { address } => {
                agent.unfreeze(parse_address(&address)?)?;
                Ok(Value::Null)
            }
            Command::UpdateFrozenValue { address, value } => {
                agent.update_frozen_value(parse_address(&address)?, parse_scalar(&value)?)?;
                Ok(Value::Null)
            }
            Command::ListFrozen => Ok(Value::Array(agent.list_frozen().iter().map(frozen_json).collect())),

            Command::FirstScan {
                target_value,
                width,
                signed,
            } => Ok(json!(agent.first_scan(parse_scalar(&target_value)?, Width::try_from(width)?, signed)?)),
            Command::NextScan { target_value } => Ok(json!(agent.next_scan(parse_scalar(&target_value)?)?)),
            Command::ClearScanState => {
                agent.clear_scan_state();
                Ok(Value::Null)
            }
            Command::GetScanResults { page, page_size } => {
                let page_size = page_size.unwrap_or(agent.options().default_page_size);
                Ok(page_json(&agent.scan_results(page, page_size)?))
            }
            Command::ScanStrings {
                target_value,
                addresses,
            } => {
                let addresses = addresses
                    .map(|addresses| addresses.iter().map(parse_address).collect::<HoldfastResult<Vec<_>>>())
                    .transpose()?;
                let found = agent.scan_strings(&target_value, addresses.as_deref())?;
                Ok(json!(found.iter().map(ToString::to_string).collect::<Vec<_>>()))
            }

            Command::Disassemble { address, count } => {
                let listing: Vec<Value> = agent
                    .disassemble(parse_address(&address)?, count)?
                    .into_iter()
                    .map(|instruction| {
                        json!({
                            "address": instruction.address.to_string(),
                            "offset": instruction.offset,
                            "mnemonic": instruction.mnemonic,
                        })
                    })
                    .collect();
                Ok(Value::Array(listing))
            }
            Command::Patch { address, operations } => {
                let operations: Vec<PatchOperation> = operations
                    .into_iter()
                    .map(|operation| PatchOperation {
                        method: operation.method,
                        values: operation.values,
                    })
                    .collect();
                agent.patch(parse_address(&address)?, &operations)?;
                Ok(Value::Null)
            }
            Command::Intercept {
                address,
                code_injection,
            } => {
                agent.intercept(parse_address(&address)?, &code_injection.code)?;
                Ok(Value::Null)
            }
            Command::DetachInterception { address } => {
                agent.detach_interception(parse_address(&address)?)?;
                Ok(Value::Null)
            }
            Command::DetachAllInterceptors => {
                agent.detach_all_interceptors();
                Ok(Value::Null)
            }

            Command::RaiseTrap { kind, address, thread } => {
                let kind = trap_kind(&kind)?;
                let address = parse_address(&address)?;
                let thread = thread.map_or(CONTROL_THREAD, ThreadId::from);
                self.raise_trap(thread, kind, address)?;
                Ok(Value::Null)
            }
        }
    }

    /// Deliver a trap from a fresh thread standing in for the target thread.
    ///
    /// The thread blocks for the whole pause, so the reply goes out as soon as
    /// the trap is in flight.
    fn raise_trap(&self, thread: ThreadId, kind: TrapKind, address: Address) -> HoldfastResult<()>
    {
        let target = Arc::clone(&self.target);
        thread::Builder::new()
            .name(format!("target-{thread}"))
            .spawn(move || {
                let outcome = target.raise_trap(thread, kind, address);
                debug!(
                    %thread,
                    %kind,
                    %address,
                    disposition = ?outcome.disposition,
                    pc = %outcome.registers.pc,
                    "Trap resolved"
                );
            })?;
        Ok(())
    }
}

fn parse_address(address: &WireAddress) -> HoldfastResult<Address>
{
    match address {
        WireAddress::Number(value) => Ok(Address::from(*value)),
        WireAddress::Text(text) => text.parse(),
    }
}

fn parse_scalar(value: &WireScalar) -> HoldfastResult<Scalar>
{
    let invalid = |text: &str| HoldfastError::InvalidArgument(format!("malformed value: {text:?}"));
    match value {
        WireScalar::Unsigned(value) => Ok(Scalar::Unsigned(*value)),
        WireScalar::Signed(value) => Ok(Scalar::Signed(*value)),
        WireScalar::Text(text) => {
            let trimmed = text.trim();
            if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16)
                    .map(Scalar::Unsigned)
                    .map_err(|_| invalid(text))
            } else if trimmed.starts_with('-') {
                trimmed.parse().map(Scalar::Signed).map_err(|_| invalid(text))
            } else {
                trimmed.parse().map(Scalar::Unsigned).map_err(|_| invalid(text))
            }
        }
    }
}

fn trap_kind(name: &str) -> HoldfastResult<TrapKind>
{
    match name {
        "breakpoint" => Ok(TrapKind::Breakpoint),
        "singleStep" => Ok(TrapKind::SingleStep),
        "accessViolation" => Ok(TrapKind::AccessViolation),
        "unknown" => Ok(TrapKind::Unknown),
        other => Err(HoldfastError::InvalidArgument(format!(
            "unknown trap kind {other:?} (expected breakpoint, singleStep, accessViolation or unknown)"
        ))),
    }
}

fn register_input(value: WireRegisterValue) -> RegisterInput
{
    match value {
        WireRegisterValue::Number(value) => RegisterInput::Number(value),
        WireRegisterValue::Text(text) => RegisterInput::Text(text),
        WireRegisterValue::Bytes(bytes) => RegisterInput::Bytes(bytes),
    }
}

fn scalar_json(value: Scalar) -> Value
{
    match value {
        Scalar::Unsigned(value) => json!(value),
        Scalar::Signed(value) => json!(value),
    }
}

fn register_json(value: RegisterValue) -> Value
{
    match value {
        RegisterValue::Numeric(value) => json!(value),
        RegisterValue::Address(address) => json!(address.to_string()),
        RegisterValue::Vector(vector) => json!(vector.bytes().to_vec()),
    }
}

fn stoppoint_json(stoppoint: &Stoppoint) -> Value
{
    json!({
        "address": stoppoint.address.to_string(),
        "mode": stoppoint.mode.as_str(),
        "size": stoppoint.size,
        "slot": stoppoint.slot,
    })
}

fn frozen_json(frozen: &FrozenValue) -> Value
{
    json!({
        "address": frozen.address.to_string(),
        "value": scalar_json(frozen.value),
        "width": frozen.width.bytes(),
        "signed": frozen.signed,
    })
}

fn page_json(page: &ScanPage) -> Value
{
    let results: Vec<Value> = page
        .results
        .iter()
        .map(|result| {
            json!({
                "address": result.address.to_string(),
                "value": result.value.map(scalar_json),
            })
        })
        .collect();
    json!({
        "results": results,
        "total": page.total,
        "page": page.page,
        "pageSize": page.page_size,
        "totalPages": page.total_pages,
    })
}

/// Wire form of an agent event.
pub fn event_message(event: &AgentEvent) -> EventMessage
{
    match event {
        AgentEvent::Breakpoint { address, slot } => EventMessage::Breakpoint {
            address: address.to_string(),
            slot: *slot,
        },
        AgentEvent::Watchpoint {
            address,
            operation,
            size,
            slot,
            program_counter,
        } => EventMessage::Watchpoint {
            address: address.to_string(),
            operation: operation.as_str().to_string(),
            size: *size,
            slot: *slot,
            program_counter: program_counter.to_string(),
        },
    }
}

/// Log a reply that failed in a way the operator is unlikely to expect.
pub fn note_failure(reply: &Reply)
{
    if matches!(reply.kind.as_deref(), Some("Substrate" | "Io")) {
        warn!(error = reply.error.as_deref().unwrap_or_default(), "Command failed in the substrate");
    }
}

#[cfg(test)]
mod tests
{
    use std::sync::mpsc::RecvTimeoutError;
    use std::time::Duration;

    use holdfast_core::agent::AgentOptions;
    use holdfast_core::events::EventReceiver;
    use holdfast_core::types::Architecture;

    use super::*;
    use crate::target::{demo_layout, DEMO_CODE, DEMO_DATA, DEMO_ENTRY, DEMO_STORE};

    const WAIT: Duration = Duration::from_secs(5);

    fn setup() -> (Dispatcher, EventReceiver)
    {
        let target = Arc::new(EmulatedTarget::new(Architecture::Arm64));
        demo_layout(&target).unwrap();
        let (agent, events) = Agent::new(target.clone(), AgentOptions::default());
        (Dispatcher::new(Arc::new(agent), target), events)
    }

    fn call(dispatcher: &Dispatcher, request: Value) -> Reply
    {
        dispatcher.handle_line(&request.to_string())
    }

    fn result(dispatcher: &Dispatcher, request: Value) -> Value
    {
        let reply = call(dispatcher, request);
        assert!(reply.is_ok(), "{reply:?}");
        reply.result.unwrap_or(Value::Null)
    }

    #[test]
    fn test_ping_echoes_id()
    {
        let (dispatcher, _events) = setup();
        let reply = call(&dispatcher, json!({"requestId": 9, "command": "ping"}));
        assert_eq!(reply.request_id, Some(9));
        assert_eq!(reply.result, Some(json!(true)));
    }

    #[test]
    fn test_malformed_lines()
    {
        let (dispatcher, _events) = setup();
        let reply = dispatcher.handle_line("{not json");
        assert_eq!(reply.kind.as_deref(), Some("InvalidArgument"));
        let reply = call(&dispatcher, json!({"command": "read", "address": "0x10000", "width": 3}));
        assert_eq!(reply.kind.as_deref(), Some("InvalidArgument"));
    }

    #[test]
    fn test_memory_commands()
    {
        let (dispatcher, _events) = setup();
        let counter = format!("{:#x}", DEMO_DATA + 0x10);

        assert_eq!(result(&dispatcher, json!({"command": "read", "address": counter})), json!(100));
        result(
            &dispatcher,
            json!({"command": "write", "address": counter, "value": "-1", "width": 2}),
        );
        assert_eq!(
            result(&dispatcher, json!({"command": "read", "address": counter, "width": 2, "signed": true})),
            json!(-1)
        );
        assert_eq!(
            result(&dispatcher, json!({"command": "readString", "address": DEMO_DATA + 0x100})),
            json!("holdfast")
        );

        let reply = call(&dispatcher, json!({"command": "read", "address": "0x9990000"}));
        assert_eq!(reply.kind.as_deref(), Some("MemoryAccess"));
    }

    #[test]
    fn test_memory_maps()
    {
        let (dispatcher, _events) = setup();
        assert_eq!(
            result(&dispatcher, json!({"command": "getMemoryMaps"})),
            json!([{"name": "/opt/holdfast/demo", "baseAddress": format!("{DEMO_CODE:#x}"), "protection": "r-x"}])
        );
    }

    #[test]
    fn test_scan_session()
    {
        let (dispatcher, _events) = setup();
        let reply = call(&dispatcher, json!({"command": "getScanResults"}));
        assert_eq!(reply.kind.as_deref(), Some("StateError"));

        let found = result(&dispatcher, json!({"command": "firstScan", "targetValue": 100}));
        assert!(found.as_u64().unwrap() >= 1);
        let page = result(&dispatcher, json!({"command": "getScanResults", "pageSize": 10}));
        assert_eq!(page["page"], json!(1));
        assert_eq!(page["pageSize"], json!(10));
        assert_eq!(page["results"][0]["value"], json!(100));

        result(&dispatcher, json!({"command": "clearScanState"}));
        let reply = call(&dispatcher, json!({"command": "nextScan", "targetValue": 1}));
        assert_eq!(reply.kind.as_deref(), Some("StateError"));
    }

    #[test]
    fn test_freeze_commands()
    {
        let (dispatcher, _events) = setup();
        let counter = DEMO_DATA + 0x10;
        assert_eq!(result(&dispatcher, json!({"command": "freeze", "address": counter})), json!(100));
        result(
            &dispatcher,
            json!({"command": "updateFrozenValue", "address": counter, "value": 7}),
        );
        assert_eq!(
            result(&dispatcher, json!({"command": "listFrozen"})),
            json!([{"address": format!("{counter:#x}"), "value": 7, "width": 4, "signed": false}])
        );
        result(&dispatcher, json!({"command": "unfreeze", "address": counter}));
        let reply = call(&dispatcher, json!({"command": "unfreeze", "address": counter}));
        assert_eq!(reply.kind.as_deref(), Some("NotFound"));
    }

    #[test]
    fn test_breakpoint_pause_and_resume()
    {
        let (dispatcher, events) = setup();
        let entry = format!("{DEMO_ENTRY:#x}");

        assert_eq!(
            result(&dispatcher, json!({"command": "addStoppoint", "address": entry, "mode": "x"})),
            json!(0)
        );
        result(
            &dispatcher,
            json!({"command": "raiseTrap", "kind": "breakpoint", "address": entry}),
        );

        let event = events.recv_timeout(WAIT).unwrap();
        assert_eq!(
            serde_json::to_value(event_message(&event)).unwrap(),
            json!({"type": "breakpoint", "address": entry, "slot": 0})
        );
        assert_eq!(result(&dispatcher, json!({"command": "readRegister", "id": "pc"})), json!(entry));
        assert_eq!(
            result(&dispatcher, json!({"command": "writeRegister", "id": "x0", "value": 5})),
            json!({"applied": true})
        );
        result(&dispatcher, json!({"command": "resume"}));

        // One-shot
        assert_eq!(result(&dispatcher, json!({"command": "listStoppoints"})), json!([]));
        let reply = call(&dispatcher, json!({"command": "resume"}));
        assert_eq!(reply.kind.as_deref(), Some("StateError"));
    }

    #[test]
    fn test_watchpoint_event()
    {
        let (dispatcher, events) = setup();
        result(
            &dispatcher,
            json!({"command": "addStoppoint", "address": DEMO_DATA + 0x10, "mode": "w", "size": 4}),
        );
        result(
            &dispatcher,
            json!({"command": "raiseTrap", "kind": "singleStep", "address": DEMO_STORE}),
        );

        let event = events.recv_timeout(WAIT).unwrap();
        assert_eq!(
            serde_json::to_value(event_message(&event)).unwrap(),
            json!({
                "type": "watchpoint",
                "address": format!("{:#x}", DEMO_DATA + 0x10),
                "operation": "w",
                "size": 4,
                "slot": 0,
                "programCounter": format!("{DEMO_STORE:#x}"),
            })
        );
        result(&dispatcher, json!({"command": "resume"}));
        assert_eq!(events.recv_timeout(Duration::from_millis(50)), Err(RecvTimeoutError::Timeout));
    }

    #[test]
    fn test_unknown_trap_kind()
    {
        let (dispatcher, _events) = setup();
        let reply = call(&dispatcher, json!({"command": "raiseTrap", "kind": "segv", "address": 0}));
        assert_eq!(reply.kind.as_deref(), Some("InvalidArgument"));
    }

    #[test]
    fn test_code_pass_throughs()
    {
        let (dispatcher, _events) = setup();
        let listing = result(&dispatcher, json!({"command": "disassemble", "address": DEMO_STORE, "count": 1}));
        assert_eq!(listing[0]["offset"], json!(0x10));

        result(
            &dispatcher,
            json!({"command": "patch", "address": DEMO_ENTRY, "operations": [{"method": "putNop"}]}),
        );
        result(
            &dispatcher,
            json!({"command": "intercept", "address": DEMO_ENTRY, "codeInjection": {"code": "log()"}}),
        );
        result(&dispatcher, json!({"command": "detachAllInterceptors"}));
    }
}
