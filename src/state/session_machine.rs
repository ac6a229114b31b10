//! Session lifecycle state machine. Every accepted transition bumps the revision that
//! orders snapshot writes.

use thiserror::Error;

/// Lifecycle phase of a guild's playback session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No playback activity and no node assigned.
    Idle,
    /// A node has been requested and playback starts once it is ready.
    Assigning(AssignReason),
    /// The current track is streaming on the assigned node.
    Playing,
    /// Playback is paused on the assigned node.
    Paused,
    /// Playback is being torn down after a stop request.
    Stopping,
    /// Playback aborted after repeated track failures; the queue is preserved.
    Faulted(FaultReason),
    /// The session is gone and must not accept further input.
    Terminated,
}

/// Why a node is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignReason {
    /// Playback starts from an idle session.
    Initial,
    /// The previous node became unhealthy mid-playback.
    Migration {
        /// Whether playback was paused when the node was lost.
        resume_paused: bool,
    },
    /// The session was reconstructed from a snapshot written by another replica.
    Restore {
        /// Whether the snapshot recorded paused playback.
        resume_paused: bool,
    },
}

/// Why playback was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReason {
    /// Too many tracks in a row failed to play.
    TrackFailures {
        /// Number of consecutive failures observed.
        consecutive: u32,
    },
}

/// Events that drive the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Request a node to start playing.
    Start(AssignReason),
    /// The requested node is connected and playback was issued.
    NodeReady,
    /// The assigned node became unhealthy while playing or paused.
    NodeLost {
        /// Whether playback was paused when the node was lost.
        resume_paused: bool,
    },
    /// No node could be acquired within the retry budget.
    AssignFailed,
    /// A new track started on the node.
    TrackAdvanced,
    /// The queue ran out of tracks.
    QueueExhausted,
    /// Queue contents, cursor or mode changed without a phase change.
    QueueChanged,
    /// Pause playback.
    Pause,
    /// Resume paused playback.
    Resume,
    /// Begin stopping playback.
    Stop,
    /// Teardown after a stop finished.
    Stopped,
    /// Abort playback.
    Fault(FaultReason),
    /// Destroy the session.
    Terminate,
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// The phase the session was in when the event was received.
    pub from: SessionPhase,
    /// The event that cannot be applied from this phase.
    pub event: SessionEvent,
}

/// Session state machine with a revision counter bumped on every applied event.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    phase: SessionPhase,
    revision: u64,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Idle,
            revision: 0,
        }
    }
}

impl SessionMachine {
    /// Create a state machine initialised in the idle phase.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an idle state machine continuing from a persisted revision.
    pub fn resume_from(revision: u64) -> Self {
        Self {
            phase: SessionPhase::Idle,
            revision,
        }
    }

    /// Inspect the current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Current revision.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Whether the session currently holds (or is about to hold) a node.
    pub fn holds_node(&self) -> bool {
        matches!(
            self.phase,
            SessionPhase::Assigning(_) | SessionPhase::Playing | SessionPhase::Paused
        )
    }

    /// Whether the session is idle-equivalent (no playback, node released).
    pub fn is_at_rest(&self) -> bool {
        matches!(self.phase, SessionPhase::Idle | SessionPhase::Faulted(_))
    }

    /// Apply an event, moving to the next phase and bumping the revision.
    pub fn apply(&mut self, event: SessionEvent) -> Result<SessionPhase, InvalidTransition> {
        let next = self.compute_transition(event)?;
        self.phase = next;
        self.revision += 1;
        Ok(next)
    }

    /// Raise the revision so it is strictly above `floor`. Used after losing a write race.
    pub fn bump_revision_above(&mut self, floor: u64) {
        if self.revision <= floor {
            self.revision = floor + 1;
        }
    }

    /// Compute a transition from an event if the transition is valid.
    fn compute_transition(&self, event: SessionEvent) -> Result<SessionPhase, InvalidTransition> {
        use SessionEvent as E;
        use SessionPhase as P;

        let next = match (self.phase, event) {
            (P::Idle | P::Faulted(_), E::Start(reason)) => P::Assigning(reason),
            (P::Playing | P::Paused, E::NodeLost { resume_paused }) => {
                P::Assigning(AssignReason::Migration { resume_paused })
            }
            (
                P::Assigning(
                    AssignReason::Migration {
                        resume_paused: true,
                    }
                    | AssignReason::Restore {
                        resume_paused: true,
                    },
                ),
                E::NodeReady,
            ) => P::Paused,
            (P::Assigning(_), E::NodeReady) => P::Playing,
            (P::Assigning(_), E::AssignFailed) => P::Idle,
            (P::Assigning(_), E::QueueExhausted) => P::Idle,
            (P::Playing | P::Paused, E::TrackAdvanced) => P::Playing,
            (P::Playing | P::Paused, E::QueueExhausted) => P::Idle,
            (P::Playing, E::Pause) => P::Paused,
            (P::Paused, E::Resume) => P::Playing,
            (P::Assigning(_) | P::Playing | P::Paused, E::Fault(reason)) => P::Faulted(reason),
            (P::Terminated, E::QueueChanged) => {
                return Err(InvalidTransition {
                    from: self.phase,
                    event,
                });
            }
            (phase, E::QueueChanged) => phase,
            (P::Terminated | P::Stopping, E::Stop) => {
                return Err(InvalidTransition {
                    from: self.phase,
                    event,
                });
            }
            (_, E::Stop) => P::Stopping,
            (P::Stopping, E::Stopped) => P::Idle,
            (P::Terminated, E::Terminate) => {
                return Err(InvalidTransition {
                    from: self.phase,
                    event,
                });
            }
            (_, E::Terminate) => P::Terminated,
            (from, event) => return Err(InvalidTransition { from, event }),
        };

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(sm: &mut SessionMachine, event: SessionEvent) -> SessionPhase {
        sm.apply(event).unwrap()
    }

    #[test]
    fn initial_state_is_idle() {
        let sm = SessionMachine::new();
        assert_eq!(sm.phase(), SessionPhase::Idle);
        assert_eq!(sm.revision(), 0);
    }

    #[test]
    fn happy_path_bumps_revision_on_every_transition() {
        let mut sm = SessionMachine::new();

        assert_eq!(
            apply(&mut sm, SessionEvent::Start(AssignReason::Initial)),
            SessionPhase::Assigning(AssignReason::Initial)
        );
        assert_eq!(apply(&mut sm, SessionEvent::NodeReady), SessionPhase::Playing);
        assert_eq!(apply(&mut sm, SessionEvent::TrackAdvanced), SessionPhase::Playing);
        assert_eq!(apply(&mut sm, SessionEvent::Pause), SessionPhase::Paused);
        assert_eq!(apply(&mut sm, SessionEvent::Resume), SessionPhase::Playing);
        assert_eq!(apply(&mut sm, SessionEvent::QueueExhausted), SessionPhase::Idle);
        assert_eq!(sm.revision(), 6);
    }

    #[test]
    fn migration_returns_to_previous_playback_state() {
        let mut sm = SessionMachine::new();
        apply(&mut sm, SessionEvent::Start(AssignReason::Initial));
        apply(&mut sm, SessionEvent::NodeReady);
        apply(&mut sm, SessionEvent::Pause);

        assert_eq!(
            apply(&mut sm, SessionEvent::NodeLost { resume_paused: true }),
            SessionPhase::Assigning(AssignReason::Migration { resume_paused: true })
        );
        assert_eq!(apply(&mut sm, SessionEvent::NodeReady), SessionPhase::Paused);

        apply(&mut sm, SessionEvent::Resume);
        apply(&mut sm, SessionEvent::NodeLost { resume_paused: false });
        assert_eq!(apply(&mut sm, SessionEvent::NodeReady), SessionPhase::Playing);
    }

    #[test]
    fn restore_honours_recorded_pause() {
        let mut sm = SessionMachine::resume_from(7);
        apply(
            &mut sm,
            SessionEvent::Start(AssignReason::Restore {
                resume_paused: true,
            }),
        );
        assert_eq!(apply(&mut sm, SessionEvent::NodeReady), SessionPhase::Paused);
        assert_eq!(sm.revision(), 9);
    }

    #[test]
    fn failed_assignment_falls_back_to_idle() {
        let mut sm = SessionMachine::new();
        apply(&mut sm, SessionEvent::Start(AssignReason::Initial));
        assert_eq!(apply(&mut sm, SessionEvent::AssignFailed), SessionPhase::Idle);
    }

    #[test]
    fn stop_is_accepted_from_any_live_phase() {
        for setup in [
            vec![],
            vec![SessionEvent::Start(AssignReason::Initial)],
            vec![SessionEvent::Start(AssignReason::Initial), SessionEvent::NodeReady],
            vec![
                SessionEvent::Start(AssignReason::Initial),
                SessionEvent::NodeReady,
                SessionEvent::Pause,
            ],
        ] {
            let mut sm = SessionMachine::new();
            for event in setup {
                apply(&mut sm, event);
            }
            assert_eq!(apply(&mut sm, SessionEvent::Stop), SessionPhase::Stopping);
            assert_eq!(apply(&mut sm, SessionEvent::Stopped), SessionPhase::Idle);
        }
    }

    #[test]
    fn fault_is_idle_equivalent_and_restartable() {
        let mut sm = SessionMachine::new();
        apply(&mut sm, SessionEvent::Start(AssignReason::Initial));
        apply(&mut sm, SessionEvent::NodeReady);

        let reason = FaultReason::TrackFailures { consecutive: 3 };
        assert_eq!(
            apply(&mut sm, SessionEvent::Fault(reason)),
            SessionPhase::Faulted(reason)
        );
        assert!(sm.is_at_rest());
        assert!(!sm.holds_node());
        assert_eq!(
            apply(&mut sm, SessionEvent::Start(AssignReason::Initial)),
            SessionPhase::Assigning(AssignReason::Initial)
        );
    }

    #[test]
    fn invalid_transitions_are_rejected_without_side_effects() {
        let mut sm = SessionMachine::new();

        let err = sm.apply(SessionEvent::Pause).unwrap_err();
        assert_eq!(err.from, SessionPhase::Idle);
        assert_eq!(err.event, SessionEvent::Pause);
        assert_eq!(sm.revision(), 0);

        apply(&mut sm, SessionEvent::Start(AssignReason::Initial));
        assert!(sm.apply(SessionEvent::Pause).is_err());
        assert!(sm.apply(SessionEvent::Resume).is_err());
        assert_eq!(sm.revision(), 1);
    }

    #[test]
    fn terminated_is_final() {
        let mut sm = SessionMachine::new();
        apply(&mut sm, SessionEvent::Terminate);

        for event in [
            SessionEvent::Start(AssignReason::Initial),
            SessionEvent::Stop,
            SessionEvent::QueueChanged,
            SessionEvent::Terminate,
        ] {
            assert!(sm.apply(event).is_err(), "{event:?} accepted after terminate");
        }
    }

    #[test]
    fn queue_changes_keep_the_phase_but_bump_revision() {
        let mut sm = SessionMachine::new();
        apply(&mut sm, SessionEvent::Start(AssignReason::Initial));
        apply(&mut sm, SessionEvent::NodeReady);

        assert_eq!(apply(&mut sm, SessionEvent::QueueChanged), SessionPhase::Playing);
        assert_eq!(sm.revision(), 3);
    }

    #[test]
    fn revision_can_be_lifted_above_a_stored_one() {
        let mut sm = SessionMachine::resume_from(4);
        sm.bump_revision_above(9);
        assert_eq!(sm.revision(), 10);
        sm.bump_revision_above(2);
        assert_eq!(sm.revision(), 10);
    }
}
