//! JSON-lines control channel over stdin/stdout.
//!
//! Each input line is one request; each gets exactly one reply line. Events are
//! written from a separate thread as they happen, so they may appear between
//! replies. Logs go to stderr.

use std::error::Error;
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use holdfast_core::agent::Agent;
use holdfast_utils::config::HoldfastConfig;
use holdfast_utils::{debug, error, info};

use crate::dispatch::{event_message, note_failure, Dispatcher};
use crate::target::{agent_options, build_target};

type Output = Arc<Mutex<io::Stdout>>;

fn emit(output: &Output, line: &str)
{
    let mut stdout = output.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(err) = writeln!(stdout, "{line}").and_then(|()| stdout.flush()) {
        error!(error = %err, "Failed to write to the control channel");
    }
}

/// Run the control channel until stdin closes or the process is interrupted.
pub fn serve(config: &HoldfastConfig) -> Result<(), Box<dyn Error>>
{
    let target = build_target(&config.target)?;
    let (agent, events) = Agent::new(target.clone(), agent_options(config));
    let agent = Arc::new(agent);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("freeze")
        .enable_time()
        .build()?;
    agent.start_freeze_loop(runtime.handle());

    let output: Output = Arc::new(Mutex::new(io::stdout()));
    let event_output = Arc::clone(&output);
    let forwarder = thread::Builder::new().name("events".to_string()).spawn(move || {
        for event in events {
            debug!(event = %event.describe(), "Forwarding event");
            match serde_json::to_string(&event_message(&event)) {
                Ok(line) => emit(&event_output, &line),
                Err(err) => error!(error = %err, "Failed to encode event"),
            }
        }
    })?;

    let interrupted = Arc::downgrade(&agent);
    ctrlc::set_handler(move || {
        info!("Interrupted, shutting down");
        if let Some(agent) = interrupted.upgrade() {
            agent.shutdown();
        }
        std::process::exit(130);
    })?;

    let dispatcher = Dispatcher::new(agent, target);
    info!("Control channel ready on stdin/stdout");

    for line in io::stdin().lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = dispatcher.handle_line(&line);
        note_failure(&reply);
        match serde_json::to_string(&reply) {
            Ok(line) => emit(&output, &line),
            Err(err) => error!(error = %err, "Failed to encode reply"),
        }
    }

    info!("Control channel closed");
    // Dropping the last agent handle shuts it down and closes the event channel.
    drop(dispatcher);
    runtime.shutdown_background();
    if forwarder.join().is_err() {
        error!("Event forwarder panicked");
    }
    Ok(())
}
