//! Agent event types and helpers.
//!
//! The trap coordinator publishes an event every time a stoppoint pauses the
//! control thread. The control channel forwards them to the operator, who
//! answers with a `resume` once done inspecting. Events are sent *before* the
//! trapped thread starts waiting, so the operator can never observe an event
//! for a pause that isn't active yet.

use std::sync::mpsc;

use crate::substrate::AccessKind;
use crate::types::Address;

/// Event emitted by the trap coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent
{
    /// Execution reached an armed breakpoint.
    Breakpoint
    {
        /// Address of the breakpoint.
        address: Address,
        /// Breakpoint slot it occupied.
        slot: usize,
    },
    /// A watched address was accessed in a matching mode.
    Watchpoint
    {
        /// Effective address of the access.
        address: Address,
        /// Kind of access the instruction performed.
        operation: AccessKind,
        /// Size of the watched region.
        size: usize,
        /// Watchpoint slot.
        slot: usize,
        /// Address of the accessing instruction.
        program_counter: Address,
    },
}

impl AgentEvent
{
    /// Human-readable description of the event.
    #[must_use]
    pub fn describe(&self) -> String
    {
        match self {
            Self::Breakpoint { address, slot } => format!("Hit breakpoint at {address} (slot {slot})"),
            Self::Watchpoint {
                address,
                operation,
                size,
                slot,
                program_counter,
            } => format!("Watchpoint {operation} of {size} bytes at {address} from {program_counter} (slot {slot})"),
        }
    }
}

/// Sender side of the agent event channel.
pub type EventSender = mpsc::Sender<AgentEvent>;
/// Receiver side of the agent event channel.
pub type EventReceiver = mpsc::Receiver<AgentEvent>;

/// Create a new agent event channel.
#[must_use]
pub fn event_channel() -> (EventSender, EventReceiver)
{
    mpsc::channel()
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_describe_events()
    {
        let hit = AgentEvent::Breakpoint {
            address: Address::from(0x1000),
            slot: 2,
        };
        assert_eq!(hit.describe(), "Hit breakpoint at 0x1000 (slot 2)");

        let watch = AgentEvent::Watchpoint {
            address: Address::from(0x2000),
            operation: AccessKind::Write,
            size: 4,
            slot: 0,
            program_counter: Address::from(0x4010),
        };
        assert_eq!(watch.describe(), "Watchpoint w of 4 bytes at 0x2000 from 0x4010 (slot 0)");
    }
}
