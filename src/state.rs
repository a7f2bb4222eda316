//! Call session state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Why a call ended. The agent-initiated variant is the only one that
/// carries a remote-supplied reason string; user-visible messaging
/// distinguishes it from a local hangup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EndReason {
    /// The agent ended the call, with the reason it supplied.
    Agent { reason: String },
    /// The local user hung up.
    Local,
    /// Negotiation or connection failure aborted the call.
    Failed { message: String },
}

impl EndReason {
    pub fn by_agent(&self) -> bool {
        matches!(self, Self::Agent { .. })
    }
}

/// Current state of the call session.
#[derive(Debug, Clone, Serialize, Default)]
pub enum CallState {
    /// Nothing started yet.
    #[default]
    Idle,
    /// Waiting for the user to grant microphone, camera and location.
    AwaitingPermissions,
    /// Resolving identity and attaching channel + media.
    Connecting,
    /// Attached and waiting for the agent to join the room.
    WaitingForAgent { since: DateTime<Utc> },
    /// Offer sent, call running.
    InCall { connected_at: DateTime<Utc> },
    /// Terminal. A fresh start constructs a new session.
    Ended {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting)
    }

    pub fn is_waiting_for_agent(&self) -> bool {
        matches!(self, Self::WaitingForAgent { .. })
    }

    pub fn is_in_call(&self) -> bool {
        matches!(self, Self::InCall { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }
}

/// State transitions for the call session.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// User (or stored session) started the flow.
    Start,
    /// All three advisory permissions are granted.
    PermissionsGranted,
    /// Room joined and media ready.
    ConnectionReady,
    /// The agent joined the room.
    AgentJoined,
    /// Fresh bootstrap failed; back to the permission screen.
    BootstrapFailed,
    /// The call is over, from whichever side.
    Terminated { reason: EndReason },
}

impl CallState {
    /// Apply a state transition. Returns error if the transition is invalid.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<(), InvalidTransition> {
        let new_state = match (&*self, transition) {
            (CallState::Idle, CallTransition::Start) => CallState::AwaitingPermissions,
            (CallState::AwaitingPermissions, CallTransition::PermissionsGranted) => {
                CallState::Connecting
            }
            (CallState::Connecting, CallTransition::ConnectionReady) => {
                CallState::WaitingForAgent { since: Utc::now() }
            }
            (CallState::Connecting, CallTransition::BootstrapFailed) => {
                CallState::AwaitingPermissions
            }
            (CallState::WaitingForAgent { .. }, CallTransition::AgentJoined) => CallState::InCall {
                connected_at: Utc::now(),
            },
            // Termination is accepted from every state: the remote side can
            // end the call whenever it likes. A second termination keeps the
            // first reason.
            (CallState::Ended { .. }, CallTransition::Terminated { .. }) => return Ok(()),
            (CallState::InCall { connected_at }, CallTransition::Terminated { reason }) => {
                let duration = Utc::now()
                    .signed_duration_since(*connected_at)
                    .num_seconds();
                CallState::Ended {
                    reason,
                    ended_at: Utc::now(),
                    duration_secs: Some(duration),
                }
            }
            (_, CallTransition::Terminated { reason }) => CallState::Ended {
                reason,
                ended_at: Utc::now(),
                duration_secs: None,
            },
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        *self = new_state;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// Derived connection flags, never persisted. The setters keep the
/// implication chain intact: a peer connection implies a joined room
/// implies a connected channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub channel_connected: bool,
    pub room_joined: bool,
    pub peer_connection_established: bool,
}

impl ConnectionState {
    pub fn set_channel_connected(&mut self, connected: bool) {
        self.channel_connected = connected;
        if !connected {
            self.room_joined = false;
            self.peer_connection_established = false;
        }
    }

    pub fn set_room_joined(&mut self, joined: bool) {
        self.room_joined = joined && self.channel_connected;
        if !self.room_joined {
            self.peer_connection_established = false;
        }
    }

    pub fn set_peer_established(&mut self, established: bool) {
        self.peer_connection_established = established && self.room_joined;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> CallState {
        let mut state = CallState::Idle;
        state.apply_transition(CallTransition::Start).unwrap();
        state
            .apply_transition(CallTransition::PermissionsGranted)
            .unwrap();
        state
    }

    /// Full happy path: Idle → AwaitingPermissions → Connecting →
    /// WaitingForAgent → InCall → Ended.
    #[test]
    fn test_happy_path() {
        let mut state = started();
        assert!(state.is_connecting());

        state
            .apply_transition(CallTransition::ConnectionReady)
            .unwrap();
        assert!(state.is_waiting_for_agent());

        state.apply_transition(CallTransition::AgentJoined).unwrap();
        assert!(state.is_in_call());

        state
            .apply_transition(CallTransition::Terminated {
                reason: EndReason::Local,
            })
            .unwrap();
        assert!(state.is_ended());

        if let CallState::Ended { duration_secs, .. } = state {
            assert!(duration_secs.is_some());
        }
    }

    /// Termination is valid from every state, including before the call ran.
    #[test]
    fn test_terminate_from_any_state() {
        let builders: [fn() -> CallState; 3] = [
            || CallState::Idle,
            || CallState::AwaitingPermissions,
            started,
        ];
        for build in builders {
            let mut state = build();
            state
                .apply_transition(CallTransition::Terminated {
                    reason: EndReason::Agent {
                        reason: "verification complete".to_string(),
                    },
                })
                .unwrap();
            assert!(state.is_ended());
        }
    }

    /// A second termination keeps the first reason.
    #[test]
    fn test_double_terminate_keeps_first_reason() {
        let mut state = started();
        state
            .apply_transition(CallTransition::Terminated {
                reason: EndReason::Agent {
                    reason: "done".to_string(),
                },
            })
            .unwrap();
        state
            .apply_transition(CallTransition::Terminated {
                reason: EndReason::Local,
            })
            .unwrap();

        if let CallState::Ended { reason, .. } = state {
            assert!(reason.by_agent());
        } else {
            panic!("expected Ended");
        }
    }

    /// A fresh-bootstrap failure drops back to the permission screen.
    #[test]
    fn test_bootstrap_failure_returns_to_permissions() {
        let mut state = started();
        state
            .apply_transition(CallTransition::BootstrapFailed)
            .unwrap();
        assert!(matches!(state, CallState::AwaitingPermissions));
    }

    /// Out-of-order transitions are rejected.
    #[test]
    fn test_invalid_transitions() {
        let mut state = CallState::Idle;
        assert!(state.apply_transition(CallTransition::AgentJoined).is_err());
        assert!(
            state
                .apply_transition(CallTransition::ConnectionReady)
                .is_err()
        );

        let mut waiting = started();
        waiting
            .apply_transition(CallTransition::ConnectionReady)
            .unwrap();
        assert!(waiting.apply_transition(CallTransition::Start).is_err());
    }

    /// Ended is terminal for everything except repeated termination.
    #[test]
    fn test_ended_rejects_progress() {
        let mut state = started();
        state
            .apply_transition(CallTransition::Terminated {
                reason: EndReason::Local,
            })
            .unwrap();
        assert!(state.apply_transition(CallTransition::Start).is_err());
        assert!(state.apply_transition(CallTransition::AgentJoined).is_err());
    }

    /// Dropping the channel clears the downstream flags.
    #[test]
    fn test_connection_state_implication_chain() {
        let mut conn = ConnectionState::default();
        conn.set_channel_connected(true);
        conn.set_room_joined(true);
        conn.set_peer_established(true);
        assert!(conn.peer_connection_established);

        conn.set_channel_connected(false);
        assert!(!conn.room_joined);
        assert!(!conn.peer_connection_established);

        // A room join without a channel does not stick.
        conn.set_room_joined(true);
        assert!(!conn.room_joined);
    }
}
