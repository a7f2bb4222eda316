//! User-facing events surfaced by the call session controller.

use crate::state::EndReason;
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// Attached and waiting in the room; carries the identifiers the UI shows.
#[derive(Debug, Clone)]
pub struct WaitingForAgent {
    pub vcip_id: String,
    pub connection_id: String,
    pub resumed: bool,
}

/// The agent joined the room.
#[derive(Debug, Clone)]
pub struct AgentJoined;

/// The offer went out; the call is running.
#[derive(Debug, Clone)]
pub struct CallStarted;

/// One call-clock tick.
#[derive(Debug, Clone)]
pub struct CallTick {
    pub elapsed_secs: u64,
}

/// Free-form message from the agent.
#[derive(Debug, Clone)]
pub struct AgentMessage {
    pub message: String,
    pub timestamp: Option<String>,
}

/// The call is over. `reason.by_agent()` distinguishes remote hangup from
/// local hangup in user-visible messaging.
#[derive(Debug, Clone)]
pub struct CallEnded {
    pub reason: EndReason,
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with a separate broadcast channel per event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    (waiting_for_agent, Arc<WaitingForAgent>),
    (agent_joined, Arc<AgentJoined>),
    (call_started, Arc<CallStarted>),
    (call_tick, Arc<CallTick>),
    (agent_message, Arc<AgentMessage>),
    (call_ended, Arc<CallEnded>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
