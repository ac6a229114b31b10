//! Per-guild session data owned by exactly one session actor.

use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::{sync::oneshot, time::Instant};

use crate::{
    clients::node::NodeSession,
    dao::models::SessionSnapshotEntity,
    dto::session::SessionView,
    error::ServiceError,
    state::{
        node_pool::{GuildId, NodeId},
        queue::{Queue, QueueError, QueueSnapshot, RepeatMode, Track},
        session_machine::{AssignReason, InvalidTransition, SessionEvent, SessionMachine, SessionPhase},
    },
};

/// User-facing playback command, already validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Enqueue a track (if any) and start playback when idle.
    Play {
        /// Track to append.
        track: Option<Track>,
        /// Voice channel to join when starting.
        voice_channel_id: Option<u64>,
    },
    /// Insert a track right after the current one and switch to it.
    PlayNow {
        /// Track to play.
        track: Track,
        /// Voice channel to join when starting.
        voice_channel_id: Option<u64>,
    },
    /// Pause playback.
    Pause,
    /// Resume paused playback.
    Resume,
    /// Skip to the next track.
    Skip,
    /// Go back to the previous track.
    Previous,
    /// Make the track at a play-order position current.
    JumpTo(usize),
    /// Remove the track at a play-order position.
    Remove(usize),
    /// Change the repeat mode.
    SetMode(RepeatMode),
    /// Shuffle the upcoming tracks.
    Shuffle,
    /// Restore enqueue order.
    Unshuffle,
    /// Stop playback, keeping queue and cursor.
    StopKeepQueue,
    /// Stop playback and empty the queue.
    StopClearQueue,
    /// Leave voice and end the session.
    Leave,
}

impl Command {
    /// Stable name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Play { .. } => "play",
            Command::PlayNow { .. } => "play_now",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Skip => "skip",
            Command::Previous => "previous",
            Command::JumpTo(_) => "jump_to",
            Command::Remove(_) => "remove",
            Command::SetMode(_) => "set_mode",
            Command::Shuffle => "shuffle",
            Command::Unshuffle => "unshuffle",
            Command::StopKeepQueue => "stop_keep_queue",
            Command::StopClearQueue => "stop_clear_queue",
            Command::Leave => "leave",
        }
    }
}

/// Why a track stopped, as reported by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackEndReason {
    /// Played to the end.
    Finished,
    /// The node could not load the track.
    LoadFailed,
    /// Stopped on request.
    Stopped,
    /// Replaced by another play request.
    Replaced,
    /// The player was destroyed.
    Cleanup,
}

/// Asynchronous event produced by an audio node for one guild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A track began streaming.
    TrackStarted {
        /// Node-side identifier of the track.
        track_identifier: String,
        /// Play request the event belongs to, when the node echoes it.
        play_id: Option<u64>,
    },
    /// A track stopped.
    TrackEnded {
        /// Node-side identifier of the track.
        track_identifier: String,
        /// Play request the event belongs to, when the node echoes it.
        play_id: Option<u64>,
        /// Why it stopped.
        reason: TrackEndReason,
    },
    /// Playback failed mid-track.
    TrackException {
        /// Node-side identifier of the track.
        track_identifier: String,
        /// Play request the event belongs to, when the node echoes it.
        play_id: Option<u64>,
        /// Node-provided description.
        message: String,
    },
    /// The track produced no audio for longer than the node's threshold.
    TrackStuck {
        /// Node-side identifier of the track.
        track_identifier: String,
        /// Play request the event belongs to, when the node echoes it.
        play_id: Option<u64>,
        /// Threshold that was exceeded.
        threshold_ms: u64,
    },
    /// Periodic player position report.
    PlayerUpdate {
        /// Position within the current track.
        position_ms: u64,
    },
    /// The node dropped the guild's voice connection.
    Disconnected {
        /// Close code, if one was sent.
        code: Option<u16>,
        /// Close reason, if one was sent.
        reason: Option<String>,
    },
}

/// Voice membership events from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayEvent {
    /// The last listener left the bot's voice channel.
    ChannelEmpty,
    /// A listener joined the bot's voice channel again.
    ChannelOccupied,
    /// The bot was removed from voice by someone else.
    ForcedDisconnect,
}

/// Why acquiring a node failed for good.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquireError {
    /// Every healthy node stayed full for the whole wait.
    #[error("no audio node had capacity within {waited:?}")]
    NoCapacity {
        /// How long the acquisition kept retrying.
        waited: Duration,
    },
    /// Nodes were selected but connecting kept failing.
    #[error("could not connect to an audio node: {0}")]
    Unavailable(String),
}

/// Mailbox message of a session actor.
#[derive(Debug)]
pub enum SessionInput {
    /// A user command and the channel its result goes back on.
    Command {
        /// The command to execute.
        command: Command,
        /// Reply channel.
        reply: oneshot::Sender<Result<SessionView, ServiceError>>,
    },
    /// Read-only view request.
    Inspect {
        /// Reply channel.
        reply: oneshot::Sender<SessionView>,
    },
    /// Event from an audio node.
    Node {
        /// Node that produced the event.
        node_id: NodeId,
        /// The event.
        event: NodeEvent,
    },
    /// Event from the voice gateway.
    Gateway(GatewayEvent),
    /// The pool dropped this guild's binding on an unhealthy node.
    Reassign {
        /// Node the guild was bound to.
        node_id: NodeId,
    },
    /// Result of a background node acquisition.
    Acquired {
        /// Acquisition attempt the result belongs to.
        attempt: u64,
        /// Connected player or the final failure.
        outcome: Result<NodeSession, AcquireError>,
    },
    /// A fire-and-forget node call failed.
    NodeCommandFailed {
        /// Revision at which the call was dispatched.
        ticket: u64,
        /// Node the call went to.
        node_id: NodeId,
        /// Failure description.
        error: String,
    },
    /// The snapshot store refused a write because it holds an equal or newer revision.
    SnapshotRejected {
        /// Revision currently stored.
        stored_revision: u64,
        /// Owner of the stored snapshot.
        stored_owner: String,
    },
}

/// State of one guild's playback session.
#[derive(Debug)]
pub struct Session {
    guild_id: GuildId,
    owner_replica_id: String,
    machine: SessionMachine,
    queue: Queue,
    node: Option<NodeSession>,
    last_node_id: Option<NodeId>,
    voice_channel_id: Option<u64>,
    consecutive_failures: u32,
    position_ms: u64,
    last_activity: Instant,
    dirty: bool,
    persisted_revision: u64,
}

impl Session {
    /// Fresh idle session with an empty queue.
    pub fn new(guild_id: GuildId, owner_replica_id: impl Into<String>) -> Self {
        Self {
            guild_id,
            owner_replica_id: owner_replica_id.into(),
            machine: SessionMachine::new(),
            queue: Queue::new(),
            node: None,
            last_node_id: None,
            voice_channel_id: None,
            consecutive_failures: 0,
            position_ms: 0,
            last_activity: Instant::now(),
            dirty: false,
            persisted_revision: 0,
        }
    }

    /// Rebuild an idle session from a persisted snapshot.
    ///
    /// The snapshot's revision is treated as already persisted.
    pub fn restore(
        snapshot: SessionSnapshotEntity,
        owner_replica_id: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let queue = Queue::from_snapshot(QueueSnapshot {
            tracks: snapshot.tracks.into_iter().map(Track::from).collect(),
            order: snapshot.play_order,
            cursor: snapshot.cursor_index,
            pending: snapshot.pending_index,
            mode: snapshot.repeat_mode.into(),
        })?;

        Ok(Self {
            guild_id: snapshot.guild_id,
            owner_replica_id: owner_replica_id.into(),
            machine: SessionMachine::resume_from(snapshot.revision),
            queue,
            node: None,
            last_node_id: snapshot.last_node_id,
            voice_channel_id: snapshot.voice_channel_id,
            consecutive_failures: 0,
            position_ms: 0,
            last_activity: Instant::now(),
            dirty: false,
            persisted_revision: snapshot.revision,
        })
    }

    /// How playback should resume after restoring `snapshot`, if it was active.
    pub fn restore_reason(snapshot: &SessionSnapshotEntity) -> Option<AssignReason> {
        (snapshot.active && snapshot.cursor_index.is_some() && snapshot.voice_channel_id.is_some())
            .then_some(AssignReason::Restore {
                resume_paused: snapshot.paused,
            })
    }

    /// Guild the session plays for.
    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// Replica that owns the session.
    pub fn owner_replica_id(&self) -> &str {
        &self.owner_replica_id
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> SessionPhase {
        self.machine.phase()
    }

    /// Revision of the last state change.
    pub fn revision(&self) -> u64 {
        self.machine.revision()
    }

    /// Whether the session sits idle or faulted without a node.
    pub fn is_at_rest(&self) -> bool {
        self.machine.is_at_rest()
    }

    /// Whether the session has ended for good.
    pub fn is_terminated(&self) -> bool {
        self.machine.phase() == SessionPhase::Terminated
    }

    /// Read-only queue access.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Mutable queue access. Marks the session for persistence.
    pub fn queue_mut(&mut self) -> &mut Queue {
        self.dirty = true;
        &mut self.queue
    }

    /// Connected player, if any.
    pub fn node(&self) -> Option<&NodeSession> {
        self.node.as_ref()
    }

    /// Node the session streamed through most recently.
    pub fn last_node_id(&self) -> Option<&str> {
        self.last_node_id.as_deref()
    }

    /// Whether `node_id` hosts the session's current player.
    pub fn is_bound_to(&self, node_id: &str) -> bool {
        self.node.as_ref().is_some_and(|node| node.node_id == node_id)
    }

    /// Remember the player created on a node.
    pub fn attach_node(&mut self, node: NodeSession) {
        self.last_node_id = Some(node.node_id.clone());
        self.node = Some(node);
        self.dirty = true;
    }

    /// Forget the current player, returning it for cleanup.
    pub fn detach_node(&mut self) -> Option<NodeSession> {
        self.node.take()
    }

    /// Voice channel the bot joins for this guild.
    pub fn voice_channel_id(&self) -> Option<u64> {
        self.voice_channel_id
    }

    /// Change the voice channel used on the next node assignment.
    pub fn set_voice_channel(&mut self, voice_channel_id: u64) {
        if self.voice_channel_id != Some(voice_channel_id) {
            self.voice_channel_id = Some(voice_channel_id);
            self.dirty = true;
        }
    }

    /// Length of the current streak of failed tracks.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Count one more failed track and return the streak length.
    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }

    /// End the failure streak after a track played through.
    pub fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Last reported position within the current track.
    pub fn position_ms(&self) -> u64 {
        self.position_ms
    }

    /// Store the position last reported by the node.
    pub fn set_position(&mut self, position_ms: u64) {
        self.position_ms = position_ms;
    }

    /// Instant of the last user or playback activity. Drives the idle timeout.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Wall-clock time of the last activity, for display.
    pub fn last_activity_at(&self) -> SystemTime {
        let elapsed = self.last_activity.elapsed();
        SystemTime::now()
            .checked_sub(elapsed)
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }

    /// Record user or playback activity.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Apply a state machine event.
    pub fn apply(&mut self, event: SessionEvent) -> Result<SessionPhase, InvalidTransition> {
        let previous = self.machine.phase();
        let next = self.machine.apply(event)?;
        if previous != next {
            self.dirty = true;
        }
        Ok(next)
    }

    /// Lift the revision above a stored one so the next write wins.
    pub fn bump_revision_above(&mut self, floor: u64) {
        self.machine.bump_revision_above(floor);
        self.dirty = true;
    }

    /// Current state as a persistable snapshot.
    pub fn snapshot(&self) -> SessionSnapshotEntity {
        let queue = self.queue.snapshot();
        SessionSnapshotEntity {
            guild_id: self.guild_id,
            revision: self.machine.revision(),
            owner_replica_id: self.owner_replica_id.clone(),
            tracks: queue.tracks.into_iter().map(Into::into).collect(),
            play_order: queue.order,
            cursor_index: queue.cursor,
            pending_index: queue.pending,
            repeat_mode: queue.mode.into(),
            voice_channel_id: self.voice_channel_id,
            last_node_id: self.last_node_id.clone(),
            active: self.machine.holds_node(),
            paused: matches!(
                self.machine.phase(),
                SessionPhase::Paused
                    | SessionPhase::Assigning(
                        AssignReason::Migration {
                            resume_paused: true
                        } | AssignReason::Restore {
                            resume_paused: true
                        }
                    )
            ),
            updated_at: SystemTime::now(),
        }
    }

    /// Snapshot to write, if something changed since the last one and the revision moved.
    pub fn take_pending_snapshot(&mut self) -> Option<SessionSnapshotEntity> {
        if !self.dirty || self.machine.revision() <= self.persisted_revision {
            return None;
        }
        self.dirty = false;
        self.persisted_revision = self.machine.revision();
        Some(self.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str) -> Track {
        Track {
            identifier: id.into(),
            uri: format!("https://example.com/{id}"),
            title: id.to_uppercase(),
            duration_ms: 180_000,
            requester: None,
        }
    }

    #[test]
    fn snapshot_round_trip_keeps_queue_and_identity() {
        let mut session = Session::new(7, "replica-a");
        session.set_voice_channel(99);
        session.queue_mut().enqueue(track("a"));
        session.queue_mut().enqueue(track("b"));
        session.queue_mut().move_next();
        session.queue_mut().set_mode(RepeatMode::Queue);
        session.apply(SessionEvent::Start(AssignReason::Initial)).unwrap();
        session.apply(SessionEvent::NodeReady).unwrap();

        let snapshot = session.snapshot();
        assert!(snapshot.active);
        assert!(!snapshot.paused);
        assert_eq!(snapshot.cursor_index, Some(0));

        let restored = Session::restore(snapshot.clone(), "replica-b").unwrap();
        assert_eq!(restored.phase(), SessionPhase::Idle);
        assert_eq!(restored.revision(), snapshot.revision);
        assert_eq!(restored.queue().current(), Some(&track("a")));
        assert_eq!(restored.queue().mode(), RepeatMode::Queue);
        assert_eq!(restored.voice_channel_id(), Some(99));
        assert_eq!(restored.owner_replica_id(), "replica-b");
        assert_eq!(
            Session::restore_reason(&snapshot),
            Some(AssignReason::Restore {
                resume_paused: false
            })
        );
    }

    #[test]
    fn inactive_snapshots_do_not_resume_playback() {
        let mut session = Session::new(7, "replica-a");
        session.set_voice_channel(99);
        session.queue_mut().enqueue(track("a"));
        session.queue_mut().move_next();

        assert_eq!(Session::restore_reason(&session.snapshot()), None);
    }

    #[test]
    fn pending_snapshot_requires_a_change_and_a_newer_revision() {
        let mut session = Session::new(1, "replica");
        assert!(session.take_pending_snapshot().is_none());

        session.queue_mut().enqueue(track("a"));
        assert!(session.take_pending_snapshot().is_none());

        session.apply(SessionEvent::QueueChanged).unwrap();
        let first = session.take_pending_snapshot().unwrap();
        assert_eq!(first.revision, 1);
        assert!(session.take_pending_snapshot().is_none());

        session.apply(SessionEvent::QueueChanged).unwrap();
        assert!(session.take_pending_snapshot().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn activity_clock_drives_both_idle_time_and_display_time() {
        let mut session = Session::new(1, "replica");
        session.touch();
        let touched = session.last_activity();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(session.last_activity(), touched);
        assert_eq!(session.last_activity().elapsed(), Duration::from_secs(30));

        let shown = session.last_activity_at();
        let age = SystemTime::now().duration_since(shown).unwrap();
        assert!(age >= Duration::from_secs(30));
        assert!(age < Duration::from_secs(60));

        session.touch();
        assert_eq!(session.last_activity().elapsed(), Duration::ZERO);
    }

    #[test]
    fn failure_streak_counts_and_resets() {
        let mut session = Session::new(1, "replica");
        assert_eq!(session.record_failure(), 1);
        assert_eq!(session.record_failure(), 2);
        session.reset_failures();
        assert_eq!(session.consecutive_failures(), 0);
    }
}
