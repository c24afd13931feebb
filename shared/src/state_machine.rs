//! Drone Lifecycle State Machine
//!
//! Tracks one pool slot from spawn request to removal. Spawn and handshake
//! arrive on unrelated paths, so every transition is keyed off the current
//! state alone and never assumes an ordering between callers. Timers that
//! fire after the state they guarded has been left are rejected as invalid.

use std::fmt;

/// Lifecycle of a pool entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DroneState {
    /// Process requested, waiting for its handshake
    Spawning,
    /// Handshake accepted, control channel installed
    Attached,
    /// Refusing new work, terminate sent
    Draining,
    /// Removed from the pool
    Closed,
}

impl fmt::Display for DroneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DroneState::Spawning => "spawning",
            DroneState::Attached => "attached",
            DroneState::Draining => "draining",
            DroneState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Drone presented a known id on a fresh connection
    HandshakeAccepted,
    /// Transport to the drone dropped
    SessionLost,
    /// Overseer decided to retire the drone
    DespawnRequested,
    /// Drone answered terminate
    TerminateAcked,
    /// Isolation backend failed to start the process
    SpawnFailed,
    /// No handshake within the spawn timeout
    SpawnTimeout,
    /// No terminate ack within the despawn timeout
    DespawnTimeout,
    /// No heartbeat within the liveness deadline
    HeartbeatTimeout,
}

/// Result of a transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Transition was valid and state changed (or stayed)
    Moved(DroneState),
    /// Transition was invalid from current state
    Invalid {
        from: DroneState,
        event: LifecycleEvent,
    },
    /// Entry must be removed from the pool and its process released
    Remove { reason: &'static str },
}

/// Lifecycle of a single pool entry
#[derive(Debug, Clone)]
pub struct DroneLifecycle {
    state: DroneState,
    epoch: u64,
}

impl Default for DroneLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl DroneLifecycle {
    /// Create a lifecycle for a freshly requested drone
    pub fn new() -> Self {
        Self {
            state: DroneState::Spawning,
            epoch: 0,
        }
    }

    /// Get current state
    pub fn state(&self) -> DroneState {
        self.state
    }

    /// Incremented each time the entry enters `Spawning`; spawn timers carry
    /// the epoch they were armed for
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether new requests may be bound to this drone
    pub fn accepts_work(&self) -> bool {
        self.state == DroneState::Attached
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LifecycleEvent) -> Transition {
        use DroneState::*;
        use LifecycleEvent::*;

        let result = match (self.state, event) {
            (Spawning, HandshakeAccepted) => Transition::Moved(Attached),

            // Transport drop keeps the slot; the drone may reconnect within
            // a fresh spawn window
            (Attached, SessionLost) => {
                self.epoch += 1;
                Transition::Moved(Spawning)
            }

            (Spawning | Attached, DespawnRequested) => Transition::Moved(Draining),
            (Draining, DespawnRequested) => Transition::Moved(Draining),

            (Spawning, SpawnFailed) => Transition::Remove {
                reason: "spawn failed",
            },
            (Spawning, SpawnTimeout) => Transition::Remove {
                reason: "spawn timeout",
            },
            (Attached, HeartbeatTimeout) => Transition::Remove {
                reason: "heartbeat timeout",
            },
            (Draining, TerminateAcked) => Transition::Remove {
                reason: "terminate acknowledged",
            },
            (Draining, SessionLost) => Transition::Remove {
                reason: "drone disconnected while draining",
            },
            (Draining, DespawnTimeout) => Transition::Remove {
                reason: "despawn timeout",
            },

            (from, event) => return Transition::Invalid { from, event },
        };

        self.state = match &result {
            Transition::Moved(state) => *state,
            Transition::Remove { .. } => Closed,
            Transition::Invalid { .. } => self.state,
        };
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let lifecycle = DroneLifecycle::new();
        assert_eq!(lifecycle.state(), DroneState::Spawning);
        assert!(!lifecycle.accepts_work());
    }

    #[test]
    fn test_normal_lifecycle() {
        let mut lifecycle = DroneLifecycle::new();

        let result = lifecycle.process_event(LifecycleEvent::HandshakeAccepted);
        assert_eq!(result, Transition::Moved(DroneState::Attached));
        assert!(lifecycle.accepts_work());

        let result = lifecycle.process_event(LifecycleEvent::DespawnRequested);
        assert_eq!(result, Transition::Moved(DroneState::Draining));
        assert!(!lifecycle.accepts_work());

        let result = lifecycle.process_event(LifecycleEvent::TerminateAcked);
        assert!(matches!(result, Transition::Remove { .. }));
        assert_eq!(lifecycle.state(), DroneState::Closed);
    }

    #[test]
    fn test_second_handshake_is_rejected() {
        let mut lifecycle = DroneLifecycle::new();
        lifecycle.process_event(LifecycleEvent::HandshakeAccepted);

        let result = lifecycle.process_event(LifecycleEvent::HandshakeAccepted);
        assert!(matches!(result, Transition::Invalid { .. }));
        assert_eq!(lifecycle.state(), DroneState::Attached);
    }

    #[test]
    fn test_late_handshake_while_draining_is_rejected() {
        let mut lifecycle = DroneLifecycle::new();
        lifecycle.process_event(LifecycleEvent::DespawnRequested);

        let result = lifecycle.process_event(LifecycleEvent::HandshakeAccepted);
        assert!(matches!(result, Transition::Invalid { .. }));
    }

    #[test]
    fn test_spawn_and_despawn_timeouts_are_exclusive() {
        // Despawn requested before the handshake: the spawn timer is stale
        let mut lifecycle = DroneLifecycle::new();
        lifecycle.process_event(LifecycleEvent::DespawnRequested);
        let result = lifecycle.process_event(LifecycleEvent::SpawnTimeout);
        assert!(matches!(result, Transition::Invalid { .. }));

        // Spawn timeout fired: the entry is gone and nothing else can fire
        let mut lifecycle = DroneLifecycle::new();
        let result = lifecycle.process_event(LifecycleEvent::SpawnTimeout);
        assert!(matches!(result, Transition::Remove { .. }));
        let result = lifecycle.process_event(LifecycleEvent::DespawnTimeout);
        assert!(matches!(result, Transition::Invalid { .. }));
        let result = lifecycle.process_event(LifecycleEvent::SpawnTimeout);
        assert!(matches!(result, Transition::Invalid { .. }));
    }

    #[test]
    fn test_session_loss_reopens_spawn_window() {
        let mut lifecycle = DroneLifecycle::new();
        lifecycle.process_event(LifecycleEvent::HandshakeAccepted);
        let epoch = lifecycle.epoch();

        let result = lifecycle.process_event(LifecycleEvent::SessionLost);
        assert_eq!(result, Transition::Moved(DroneState::Spawning));
        assert_eq!(lifecycle.epoch(), epoch + 1);

        let result = lifecycle.process_event(LifecycleEvent::HandshakeAccepted);
        assert_eq!(result, Transition::Moved(DroneState::Attached));
    }

    #[test]
    fn test_heartbeat_timeout_only_applies_to_attached() {
        let mut lifecycle = DroneLifecycle::new();
        let result = lifecycle.process_event(LifecycleEvent::HeartbeatTimeout);
        assert!(matches!(result, Transition::Invalid { .. }));

        lifecycle.process_event(LifecycleEvent::HandshakeAccepted);
        let result = lifecycle.process_event(LifecycleEvent::HeartbeatTimeout);
        assert!(matches!(result, Transition::Remove { .. }));
    }
}
