//! Scripted walkthrough against the built-in layout.
//!
//! Runs a fixed sequence of control-channel requests and prints each request,
//! its reply and any events, the same lines an operator would see on `serve`.

use std::error::Error;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use holdfast_core::agent::Agent;
use holdfast_core::events::EventReceiver;
use holdfast_utils::config::HoldfastConfig;
use serde_json::{json, Value};

use crate::dispatch::{event_message, Dispatcher};
use crate::target::{agent_options, build_target, DEMO_DATA, DEMO_ENTRY, DEMO_LOAD, DEMO_STORE};

const EVENT_WAIT: Duration = Duration::from_secs(2);

fn step(dispatcher: &Dispatcher, request: Value) -> Result<Value, Box<dyn Error>>
{
    println!("> {request}");
    let reply = dispatcher.handle_line(&request.to_string());
    println!("< {}", serde_json::to_string(&reply)?);
    Ok(reply.result.unwrap_or(Value::Null))
}

fn await_event(events: &EventReceiver) -> Result<(), Box<dyn Error>>
{
    match events.recv_timeout(EVENT_WAIT) {
        Ok(event) => {
            println!("! {}", serde_json::to_string(&event_message(&event))?);
            Ok(())
        }
        Err(RecvTimeoutError::Timeout) => Err("no event arrived".into()),
        Err(RecvTimeoutError::Disconnected) => Err("event channel closed".into()),
    }
}

/// Run the walkthrough. The configuration's region list is ignored.
pub async fn demo(config: &HoldfastConfig) -> Result<(), Box<dyn Error>>
{
    let mut target_config = config.target.clone();
    target_config.regions.clear();
    let target = build_target(&target_config)?;
    let (agent, events) = Agent::new(target.clone(), agent_options(config));
    let agent = Arc::new(agent);
    agent.start_freeze_loop(&tokio::runtime::Handle::current());
    let dispatcher = Dispatcher::new(Arc::clone(&agent), target);
    let counter = format!("{:#x}", DEMO_DATA + 0x10);

    println!("# memory");
    step(&dispatcher, json!({"command": "getMemoryMaps"}))?;
    step(&dispatcher, json!({"command": "read", "address": counter}))?;
    step(&dispatcher, json!({"command": "readString", "address": DEMO_DATA + 0x100}))?;
    step(&dispatcher, json!({"command": "hexdump", "address": DEMO_DATA, "length": 32}))?;

    println!("# scanning");
    step(&dispatcher, json!({"command": "firstScan", "targetValue": 100}))?;
    step(&dispatcher, json!({"command": "write", "address": counter, "value": 250}))?;
    step(&dispatcher, json!({"command": "nextScan", "targetValue": 250}))?;
    step(&dispatcher, json!({"command": "getScanResults", "pageSize": 5}))?;
    step(&dispatcher, json!({"command": "scanStrings", "targetValue": "hold"}))?;

    println!("# freezing");
    step(&dispatcher, json!({"command": "freeze", "address": counter}))?;
    step(&dispatcher, json!({"command": "write", "address": counter, "value": 1}))?;
    tokio::time::sleep(agent.options().freeze_interval * 3).await;
    step(&dispatcher, json!({"command": "read", "address": counter}))?;
    step(&dispatcher, json!({"command": "unfreeze", "address": counter}))?;

    println!("# breakpoint");
    step(&dispatcher, json!({"command": "addStoppoint", "address": DEMO_ENTRY, "mode": "x"}))?;
    step(&dispatcher, json!({"command": "raiseTrap", "kind": "breakpoint", "address": DEMO_ENTRY}))?;
    await_event(&events)?;
    step(&dispatcher, json!({"command": "readRegister", "id": "pc"}))?;
    step(&dispatcher, json!({"command": "resume"}))?;

    println!("# watchpoint");
    step(&dispatcher, json!({"command": "addStoppoint", "address": counter, "mode": "w", "size": 4}))?;
    step(&dispatcher, json!({"command": "raiseTrap", "kind": "singleStep", "address": DEMO_LOAD}))?;
    step(&dispatcher, json!({"command": "raiseTrap", "kind": "singleStep", "address": DEMO_STORE}))?;
    await_event(&events)?;
    step(&dispatcher, json!({"command": "resume"}))?;
    step(&dispatcher, json!({"command": "listStoppoints"}))?;

    agent.shutdown();
    Ok(())
}
