//! One task per guild owning the [`Session`]: commands, node events, gateway events,
//! node acquisitions and timers all go through its mailbox and are applied one at a time.

use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, sleep, timeout_at},
};
use tracing::{debug, error, info, warn};

use crate::{
    clients::node::NodeSession,
    dto::{session::SessionView, sse::TerminationReason},
    error::ServiceError,
    services::{
        sse_events,
        synchronizer::{self, SnapshotWriter},
    },
    state::{
        SharedState,
        node_pool::{GuildId, NodeDescriptor, NodeHealth, NodeId, PoolError},
        queue::{QueueError, Track},
        registry::SessionHandle,
        session::{
            AcquireError, Command, GatewayEvent, NodeEvent, Session, SessionInput,
            TrackEndReason,
        },
        session_machine::{AssignReason, FaultReason, SessionEvent, SessionPhase},
    },
};

type Reply = oneshot::Sender<Result<SessionView, ServiceError>>;

/// Return the guild's running actor, starting one if needed.
pub fn ensure_session(state: &SharedState, guild_id: GuildId) -> SessionHandle {
    state.sessions().get_or_spawn(guild_id, |generation| {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(state.clone(), guild_id, generation, tx.clone(), rx));
        tx
    })
}

async fn run(
    state: SharedState,
    guild_id: GuildId,
    generation: u64,
    mailbox: mpsc::UnboundedSender<SessionInput>,
    mut inbox: mpsc::UnboundedReceiver<SessionInput>,
) {
    let (session, resume) = match bootstrap(&state, guild_id).await {
        Ok(started) => started,
        Err(reason) => {
            inbox.close();
            while let Ok(input) = inbox.try_recv() {
                if let SessionInput::Command { reply, .. } = input {
                    let _ = reply.send(Err(ServiceError::Conflict(reason.clone())));
                }
            }
            state.sessions().remove_if_generation(guild_id, generation);
            return;
        }
    };

    debug!(guild_id, generation, revision = session.revision(), "session actor started");
    let mut actor = SessionActor::new(state.clone(), session, mailbox);
    if let Some(reason) = resume {
        actor.resume_after_restore(reason);
        actor.after_input();
    }

    while !actor.session.is_terminated() {
        let input = match actor.next_deadline() {
            Some(deadline) => match timeout_at(deadline, inbox.recv()).await {
                Ok(input) => input,
                Err(_) => {
                    actor.on_deadline();
                    actor.after_input();
                    continue;
                }
            },
            None => inbox.recv().await,
        };
        let Some(input) = input else {
            break;
        };
        actor.handle(input);
        actor.after_input();
    }

    actor.shutdown().await;

    // Inputs that arrived during shutdown are dropped; their senders retry against a new actor.
    inbox.close();
    while inbox.try_recv().is_ok() {}
    state.sessions().remove_if_generation(guild_id, generation);
    debug!(guild_id, generation, "session actor stopped");
}

/// Build the initial session, claiming the stored snapshot when one exists.
async fn bootstrap(
    state: &SharedState,
    guild_id: GuildId,
) -> Result<(Session, Option<AssignReason>), String> {
    let replica_id = state.replica_id();
    if state.is_degraded() {
        debug!(guild_id, "snapshot store unavailable; starting without history");
        return Ok((Session::new(guild_id, replica_id), None));
    }

    match synchronizer::load_and_claim(state, guild_id).await {
        Ok(Some(snapshot)) => {
            let stored_revision = snapshot.revision;
            let resume = Session::restore_reason(&snapshot);
            match Session::restore(snapshot, replica_id) {
                Ok(session) => {
                    info!(guild_id, revision = stored_revision, "session restored from snapshot");
                    Ok((session, resume))
                }
                Err(err) => {
                    warn!(guild_id, error = %err, "discarding unreadable snapshot");
                    let mut session = Session::new(guild_id, replica_id);
                    session.bump_revision_above(stored_revision);
                    Ok((session, None))
                }
            }
        }
        Ok(None) => Ok((Session::new(guild_id, replica_id), None)),
        Err(ServiceError::Conflict(reason)) => {
            warn!(guild_id, reason = %reason, "could not claim the session snapshot");
            Err(reason)
        }
        Err(err) => {
            warn!(guild_id, error = %err, "snapshot lookup failed; starting without history");
            Ok((Session::new(guild_id, replica_id), None))
        }
    }
}

/// What the caller of a command is waiting for.
enum Outcome {
    /// The command is fully applied.
    Done,
    /// Playback starts once a node is ready; reply then.
    AwaitNode,
}

/// Background node acquisition. Dropping it cancels the task.
struct Acquisition {
    attempt: u64,
    _cancel: oneshot::Sender<()>,
    waiters: Vec<Reply>,
}

#[derive(Debug)]
enum NodeOp {
    Play {
        track: Track,
        start_ms: u64,
        paused: bool,
    },
    Pause,
    Resume,
    Stop,
    Disconnect,
}

enum NodeTask {
    Request {
        ticket: u64,
        node: NodeSession,
        op: NodeOp,
    },
    /// Completes once every earlier request finished.
    Barrier(oneshot::Sender<()>),
}

struct SessionActor {
    state: SharedState,
    session: Session,
    mailbox: mpsc::UnboundedSender<SessionInput>,
    writer: SnapshotWriter,
    node_io: mpsc::UnboundedSender<NodeTask>,
    acquisition: Option<Acquisition>,
    next_attempt: u64,
    latest_ticket: u64,
    /// Ticket of the last play request, echoed back by the node as `play_id`.
    current_play: Option<u64>,
    announced_revision: u64,
    channel_empty_deadline: Option<Instant>,
    termination: Option<TerminationReason>,
}

impl SessionActor {
    fn new(
        state: SharedState,
        session: Session,
        mailbox: mpsc::UnboundedSender<SessionInput>,
    ) -> Self {
        let writer = SnapshotWriter::spawn(state.clone(), session.guild_id(), mailbox.clone());
        let node_io = spawn_node_worker(state.clone(), mailbox.clone());
        let announced_revision = session.revision();
        Self {
            state,
            session,
            mailbox,
            writer,
            node_io,
            acquisition: None,
            next_attempt: 0,
            latest_ticket: 0,
            current_play: None,
            announced_revision,
            channel_empty_deadline: None,
            termination: None,
        }
    }

    fn guild_id(&self) -> GuildId {
        self.session.guild_id()
    }

    fn view(&self) -> SessionView {
        SessionView::from(&self.session)
    }

    fn touch(&mut self) {
        self.session.touch();
    }

    fn handle(&mut self, input: SessionInput) {
        match input {
            SessionInput::Command { command, reply } => self.on_command(command, reply),
            SessionInput::Inspect { reply } => {
                let _ = reply.send(self.view());
            }
            SessionInput::Node { node_id, event } => self.on_node_event(&node_id, event),
            SessionInput::Gateway(event) => self.on_gateway_event(event),
            SessionInput::Reassign { node_id } => {
                if self.session.is_bound_to(&node_id) {
                    info!(guild_id = self.guild_id(), node_id = %node_id, "node left the healthy set");
                    self.migrate();
                }
            }
            SessionInput::Acquired { attempt, outcome } => self.on_acquired(attempt, outcome),
            SessionInput::NodeCommandFailed {
                ticket,
                node_id,
                error,
            } => self.on_node_command_failed(ticket, &node_id, &error),
            SessionInput::SnapshotRejected {
                stored_revision,
                stored_owner,
            } => self.on_snapshot_rejected(stored_revision, stored_owner),
        }
    }

    /// Persist and announce whatever the last input changed.
    fn after_input(&mut self) {
        if !self.session.is_terminated() {
            if let Some(snapshot) = self.session.take_pending_snapshot() {
                self.writer.publish(snapshot);
            }
        }

        if self.session.revision() != self.announced_revision {
            self.announced_revision = self.session.revision();
            sse_events::broadcast_state_changed(&self.state, self.view());
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let idle_timeout = self.state.config().session.idle_timeout;
        let idle = self
            .session
            .is_at_rest()
            .then(|| self.session.last_activity() + idle_timeout);
        match (idle, self.channel_empty_deadline) {
            (Some(idle), Some(empty)) => Some(idle.min(empty)),
            (idle, empty) => idle.or(empty),
        }
    }

    fn on_deadline(&mut self) {
        let now = Instant::now();
        if self.channel_empty_deadline.is_some_and(|deadline| deadline <= now) {
            self.terminate(TerminationReason::ChannelEmpty);
            return;
        }
        let idle_timeout = self.state.config().session.idle_timeout;
        if self.session.is_at_rest() && self.session.last_activity() + idle_timeout <= now {
            self.terminate(TerminationReason::IdleTimeout);
        }
    }

    fn on_command(&mut self, command: Command, reply: Reply) {
        let name = command.name();
        self.touch();
        match self.execute(command) {
            Ok(Outcome::Done) => {
                debug!(guild_id = self.guild_id(), command = name, revision = self.session.revision(), "command applied");
                let _ = reply.send(Ok(self.view()));
            }
            Ok(Outcome::AwaitNode) => match self.acquisition.as_mut() {
                Some(acquisition) => acquisition.waiters.push(reply),
                None => {
                    let _ = reply.send(Ok(self.view()));
                }
            },
            Err(err) => {
                debug!(guild_id = self.guild_id(), command = name, error = %err, "command rejected");
                let _ = reply.send(Err(err));
            }
        }
    }

    fn execute(&mut self, command: Command) -> Result<Outcome, ServiceError> {
        match command {
            Command::Play {
                track,
                voice_channel_id,
            } => self.play(track, voice_channel_id),
            Command::PlayNow {
                track,
                voice_channel_id,
            } => self.play_now(track, voice_channel_id),
            Command::Pause => {
                self.session.apply(SessionEvent::Pause)?;
                self.dispatch(NodeOp::Pause);
                Ok(Outcome::Done)
            }
            Command::Resume => {
                self.session.apply(SessionEvent::Resume)?;
                self.dispatch(NodeOp::Resume);
                Ok(Outcome::Done)
            }
            Command::Skip => self.skip(),
            Command::Previous => self.previous(),
            Command::JumpTo(index) => self.jump_to(index),
            Command::Remove(index) => self.remove(index),
            Command::SetMode(mode) => {
                self.session.queue_mut().set_mode(mode);
                self.queue_changed()
            }
            Command::Shuffle => {
                self.session.queue_mut().shuffle(&mut rand::rng());
                self.queue_changed()
            }
            Command::Unshuffle => {
                self.session.queue_mut().unshuffle();
                self.queue_changed()
            }
            Command::StopKeepQueue => self.stop(false),
            Command::StopClearQueue => self.stop(true),
            Command::Leave => {
                self.terminate(TerminationReason::Left);
                Ok(Outcome::Done)
            }
        }
    }

    fn queue_changed(&mut self) -> Result<Outcome, ServiceError> {
        self.session.apply(SessionEvent::QueueChanged)?;
        Ok(Outcome::Done)
    }

    fn require_voice_channel(&self, requested: Option<u64>) -> Result<u64, ServiceError> {
        requested
            .or(self.session.voice_channel_id())
            .ok_or_else(|| {
                ServiceError::InvalidInput("a voice channel is required to start playback".into())
            })
    }

    fn play(
        &mut self,
        track: Option<Track>,
        voice_channel_id: Option<u64>,
    ) -> Result<Outcome, ServiceError> {
        if !self.session.is_at_rest() {
            return match track {
                Some(track) => {
                    let position = self.session.queue_mut().enqueue(track);
                    debug!(guild_id = self.guild_id(), position, "track enqueued");
                    self.queue_changed()
                }
                None if self.session.phase() == SessionPhase::Paused => {
                    self.session.apply(SessionEvent::Resume)?;
                    self.dispatch(NodeOp::Resume);
                    Ok(Outcome::Done)
                }
                None => Ok(Outcome::Done),
            };
        }

        let voice_channel_id = self.require_voice_channel(voice_channel_id)?;
        if track.is_none() && self.session.queue().is_empty() {
            return Err(ServiceError::InvalidState("the queue is empty".into()));
        }

        self.session.set_voice_channel(voice_channel_id);
        let queue = self.session.queue_mut();
        if let Some(track) = track {
            queue.enqueue(track);
        }
        if queue.is_finished() {
            queue.rewind();
        }
        if queue.current().is_none() {
            queue.move_next();
        }
        self.start_playback(AssignReason::Initial)
    }

    fn play_now(
        &mut self,
        track: Track,
        voice_channel_id: Option<u64>,
    ) -> Result<Outcome, ServiceError> {
        let voice_channel_id = if self.session.is_at_rest() {
            Some(self.require_voice_channel(voice_channel_id)?)
        } else {
            None
        };

        let position = self.session.queue_mut().push_next(track);
        let track = self.session.queue_mut().move_to(position)?.clone();
        if let Some(channel) = voice_channel_id {
            self.session.set_voice_channel(channel);
        }
        self.after_reposition(track)
    }

    fn skip(&mut self) -> Result<Outcome, ServiceError> {
        match self.session.phase() {
            SessionPhase::Playing | SessionPhase::Paused => {
                self.session.reset_failures();
                self.advance(false);
                Ok(Outcome::Done)
            }
            SessionPhase::Assigning(_) => {
                if self.session.queue_mut().skip().is_some() {
                    self.session.set_position(0);
                    self.queue_changed()
                } else {
                    self.abandon_acquisition();
                    Ok(Outcome::Done)
                }
            }
            _ => Err(ServiceError::InvalidState("nothing is playing".into())),
        }
    }

    fn previous(&mut self) -> Result<Outcome, ServiceError> {
        if self.session.is_at_rest() {
            self.require_voice_channel(None)?;
        }
        let Some(track) = self.session.queue_mut().move_previous().cloned() else {
            return Err(ServiceError::InvalidState("there is no previous track".into()));
        };
        self.after_reposition(track)
    }

    fn jump_to(&mut self, index: usize) -> Result<Outcome, ServiceError> {
        let len = self.session.queue().len();
        if index >= len {
            return Err(QueueError::IndexOutOfRange { index, len }.into());
        }
        if self.session.is_at_rest() {
            self.require_voice_channel(None)?;
        }
        let track = self.session.queue_mut().move_to(index)?.clone();
        self.after_reposition(track)
    }

    /// Continue after the cursor was moved explicitly to `track`.
    fn after_reposition(&mut self, track: Track) -> Result<Outcome, ServiceError> {
        match self.session.phase() {
            SessionPhase::Playing | SessionPhase::Paused => {
                self.session.reset_failures();
                self.start_track(track);
                Ok(Outcome::Done)
            }
            SessionPhase::Assigning(_) => {
                self.session.set_position(0);
                self.queue_changed()
            }
            _ => self.start_playback(AssignReason::Initial),
        }
    }

    fn remove(&mut self, index: usize) -> Result<Outcome, ServiceError> {
        let (removed, was_current) = self.session.queue_mut().remove_at(index)?;
        debug!(guild_id = self.guild_id(), index, track = %removed.title, was_current, "track removed");
        if !was_current {
            return self.queue_changed();
        }

        match self.session.phase() {
            SessionPhase::Playing | SessionPhase::Paused => {
                self.advance(false);
                Ok(Outcome::Done)
            }
            SessionPhase::Assigning(_) => {
                if self.session.queue_mut().skip().is_some() {
                    self.session.set_position(0);
                    self.queue_changed()
                } else {
                    self.abandon_acquisition();
                    Ok(Outcome::Done)
                }
            }
            _ => self.queue_changed(),
        }
    }

    fn stop(&mut self, clear_queue: bool) -> Result<Outcome, ServiceError> {
        self.session.apply(SessionEvent::Stop)?;
        let waiters = self.cancel_acquisition();
        self.dispatch(NodeOp::Stop);
        self.release_node();
        if clear_queue {
            self.session.queue_mut().clear();
        }
        self.session.set_position(0);
        self.session.apply(SessionEvent::Stopped)?;
        self.answer(waiters);
        info!(guild_id = self.guild_id(), clear_queue, "playback stopped");
        Ok(Outcome::Done)
    }

    fn start_playback(&mut self, reason: AssignReason) -> Result<Outcome, ServiceError> {
        self.session.apply(SessionEvent::Start(reason))?;
        self.session.reset_failures();
        self.session.set_position(0);
        self.begin_acquisition();
        Ok(Outcome::AwaitNode)
    }

    fn resume_after_restore(&mut self, reason: AssignReason) {
        if self.session.queue().current().is_none() || self.session.voice_channel_id().is_none() {
            return;
        }
        if self.session.apply(SessionEvent::Start(reason)).is_ok() {
            info!(guild_id = self.guild_id(), "resuming restored playback");
            self.session.set_position(0);
            self.begin_acquisition();
        }
    }

    /// Play `track` on the current node.
    fn start_track(&mut self, track: Track) {
        self.session.set_position(0);
        match self.session.apply(SessionEvent::TrackAdvanced) {
            Ok(_) => {
                debug!(guild_id = self.guild_id(), track = %track.title, "starting track");
                self.dispatch(NodeOp::Play {
                    track,
                    start_ms: 0,
                    paused: false,
                });
            }
            Err(err) => warn!(guild_id = self.guild_id(), error = %err, "cannot advance track"),
        }
    }

    /// Move to the next track, or finish playback when the queue is exhausted.
    fn advance(&mut self, natural: bool) {
        let queue = self.session.queue_mut();
        let next = if natural {
            queue.move_next().cloned()
        } else {
            queue.skip().cloned()
        };
        match next {
            Some(track) => self.start_track(track),
            None => self.finish_playback(),
        }
    }

    fn finish_playback(&mut self) {
        self.release_node();
        self.session.set_position(0);
        if self.session.apply(SessionEvent::QueueExhausted).is_ok() {
            info!(guild_id = self.guild_id(), "queue finished; audio node released");
        }
    }

    fn begin_acquisition(&mut self) {
        let Some(voice_channel_id) = self.session.voice_channel_id() else {
            self.on_assign_failed(
                AcquireError::Unavailable("no voice channel recorded".into()),
                Vec::new(),
            );
            return;
        };

        self.next_attempt += 1;
        let attempt = self.next_attempt;
        let (cancel, cancelled) = oneshot::channel();
        let (drained_tx, drained) = oneshot::channel();
        let _ = self.node_io.send(NodeTask::Barrier(drained_tx));

        let request = AcquireRequest {
            guild_id: self.guild_id(),
            voice_channel_id,
            hint: self.session.last_node_id().map(str::to_owned),
            attempt,
        };
        tokio::spawn(acquire_node(
            self.state.clone(),
            request,
            drained,
            cancelled,
            self.mailbox.clone(),
        ));

        let waiters = self
            .acquisition
            .take()
            .map(|previous| previous.waiters)
            .unwrap_or_default();
        self.acquisition = Some(Acquisition {
            attempt,
            _cancel: cancel,
            waiters,
        });
        debug!(guild_id = self.guild_id(), attempt, "acquiring audio node");
    }

    /// Drop the running acquisition and return the callers waiting on it.
    fn cancel_acquisition(&mut self) -> Vec<Reply> {
        let Some(acquisition) = self.acquisition.take() else {
            return Vec::new();
        };
        debug!(guild_id = self.guild_id(), attempt = acquisition.attempt, "node acquisition cancelled");
        if self.session.node().is_none() {
            self.state.nodes().release(self.guild_id());
        }
        acquisition.waiters
    }

    /// The queue ran out while a node was still being acquired.
    fn abandon_acquisition(&mut self) {
        let waiters = self.cancel_acquisition();
        self.session.set_position(0);
        let _ = self.session.apply(SessionEvent::QueueExhausted);
        self.answer(waiters);
    }

    fn answer(&self, waiters: Vec<Reply>) {
        if waiters.is_empty() {
            return;
        }
        let view = self.view();
        for waiter in waiters {
            let _ = waiter.send(Ok(view.clone()));
        }
    }

    fn on_acquired(&mut self, attempt: u64, outcome: Result<NodeSession, AcquireError>) {
        let awaited = self
            .acquisition
            .as_ref()
            .is_some_and(|acquisition| acquisition.attempt == attempt)
            && matches!(self.session.phase(), SessionPhase::Assigning(_));
        if !awaited {
            if let Ok(node) = outcome {
                debug!(guild_id = self.guild_id(), attempt, node_id = %node.node_id, "discarding superseded node player");
                self.discard_player(node);
            }
            return;
        }

        let guild_id = self.guild_id();
        let outcome = match outcome {
            Ok(node)
                if self.state.nodes().bound_node(guild_id).as_deref()
                    != Some(node.node_id.as_str()) =>
            {
                warn!(guild_id, attempt, node_id = %node.node_id, "audio node left the pool while connecting; acquiring another");
                self.send_node(node, NodeOp::Disconnect);
                self.begin_acquisition();
                return;
            }
            outcome => outcome,
        };

        let waiters = self
            .acquisition
            .take()
            .map(|acquisition| acquisition.waiters)
            .unwrap_or_default();
        match outcome {
            Ok(node) => self.on_node_ready(node, waiters),
            Err(err) => self.on_assign_failed(err, waiters),
        }
    }

    fn discard_player(&mut self, node: NodeSession) {
        if self.session.is_bound_to(&node.node_id) {
            return;
        }
        let guild_id = self.guild_id();
        let node_id = node.node_id.clone();
        self.send_node(node, NodeOp::Disconnect);
        if self.acquisition.is_none()
            && self.state.nodes().bound_node(guild_id).as_deref() == Some(node_id.as_str())
        {
            self.state.nodes().release(guild_id);
        }
    }

    fn on_node_ready(&mut self, node: NodeSession, waiters: Vec<Reply>) {
        let Some(track) = self.session.queue().current().cloned() else {
            self.session.attach_node(node);
            self.finish_playback();
            self.answer(waiters);
            return;
        };

        let (start_ms, paused) = match self.session.phase() {
            SessionPhase::Assigning(AssignReason::Migration { resume_paused }) => {
                (self.session.position_ms(), resume_paused)
            }
            SessionPhase::Assigning(AssignReason::Restore { resume_paused }) => (0, resume_paused),
            _ => (0, false),
        };

        info!(
            guild_id = self.guild_id(),
            node_id = %node.node_id,
            track = %track.title,
            start_ms,
            paused,
            "audio node ready"
        );
        self.session.attach_node(node);
        if let Err(err) = self.session.apply(SessionEvent::NodeReady) {
            warn!(guild_id = self.guild_id(), error = %err, "node became ready in an unexpected phase");
        }
        self.session.set_position(start_ms);
        self.dispatch(NodeOp::Play {
            track,
            start_ms,
            paused,
        });
        self.answer(waiters);
    }

    fn on_assign_failed(&mut self, err: AcquireError, waiters: Vec<Reply>) {
        let migrating = matches!(
            self.session.phase(),
            SessionPhase::Assigning(AssignReason::Migration { .. })
        );
        self.state.nodes().release(self.guild_id());
        let _ = self.session.apply(SessionEvent::AssignFailed);
        warn!(guild_id = self.guild_id(), error = %err, migrating, "no audio node could be assigned");

        if migrating {
            sse_events::broadcast_playback_interrupted(&self.state, self.guild_id(), err.to_string());
        }
        for waiter in waiters {
            let _ = waiter.send(Err(ServiceError::SessionUnavailable(err.to_string())));
        }
    }

    /// Send a request to the current player, if there is one.
    fn dispatch(&mut self, op: NodeOp) {
        let Some(node) = self.session.node().cloned() else {
            debug!(guild_id = self.guild_id(), ?op, "no audio node player to send to");
            return;
        };
        self.send_node(node, op);
    }

    fn send_node(&mut self, node: NodeSession, op: NodeOp) {
        self.latest_ticket = self.session.revision();
        if matches!(op, NodeOp::Play { .. }) {
            self.current_play = Some(self.latest_ticket);
        }
        let task = NodeTask::Request {
            ticket: self.latest_ticket,
            node,
            op,
        };
        if self.node_io.send(task).is_err() {
            warn!(guild_id = self.guild_id(), "node worker stopped");
        }
    }

    /// Tear down the player and give the node back to the pool.
    fn release_node(&mut self) {
        if let Some(node) = self.session.detach_node() {
            debug!(guild_id = self.guild_id(), node_id = %node.node_id, "releasing audio node");
            self.send_node(node, NodeOp::Disconnect);
        }
        self.state.nodes().release(self.guild_id());
    }

    /// Move playback off the current node and acquire another one.
    fn migrate(&mut self) {
        let resume_paused = match self.session.phase() {
            SessionPhase::Playing => false,
            SessionPhase::Paused => true,
            _ => return,
        };

        if let Some(node) = self.session.detach_node() {
            info!(
                guild_id = self.guild_id(),
                node_id = %node.node_id,
                position_ms = self.session.position_ms(),
                "migrating session to another node"
            );
            let still_healthy = self
                .state
                .nodes()
                .descriptor(&node.node_id)
                .is_some_and(|descriptor| descriptor.health == NodeHealth::Healthy);
            if still_healthy {
                // The next player may land on the same node, after this teardown.
                self.send_node(node, NodeOp::Disconnect);
            } else {
                // The old node may be gone; do not hold up the new player behind it.
                let client = self.state.node_client();
                tokio::spawn(async move {
                    if let Err(err) = client.disconnect(node).await {
                        debug!(error = %err, "could not tear down player on abandoned node");
                    }
                });
            }
        }
        self.state.nodes().release(self.guild_id());

        if self
            .session
            .apply(SessionEvent::NodeLost { resume_paused })
            .is_ok()
        {
            self.begin_acquisition();
        }
    }

    fn on_node_command_failed(&mut self, ticket: u64, node_id: &str, error: &str) {
        if ticket < self.latest_ticket || !self.session.is_bound_to(node_id) {
            debug!(guild_id = self.guild_id(), ticket, node_id, error, "ignoring failure of a superseded node request");
            return;
        }
        warn!(guild_id = self.guild_id(), node_id, error, "audio node request failed");
        let _ = self.state.nodes().report_health(node_id, NodeHealth::Degraded);
        self.migrate();
    }

    /// Whether a track event belongs to the play in progress.
    ///
    /// Events without a `play_id` fall back to matching the track identifier alone.
    fn is_current(&self, track_identifier: &str, play_id: Option<u64>) -> bool {
        let same_play = play_id.is_none_or(|play_id| self.current_play == Some(play_id));
        same_play
            && self
                .session
                .queue()
                .current()
                .is_some_and(|track| track.identifier == track_identifier)
    }

    fn on_node_event(&mut self, node_id: &str, event: NodeEvent) {
        if !self.session.is_bound_to(node_id) {
            debug!(guild_id = self.guild_id(), node_id, ?event, "ignoring event from unbound node");
            return;
        }

        match event {
            NodeEvent::TrackStarted {
                track_identifier,
                play_id,
            } => {
                if self.is_current(&track_identifier, play_id) {
                    self.touch();
                    self.session.set_position(0);
                }
            }
            NodeEvent::TrackEnded {
                track_identifier,
                play_id,
                reason,
            } => {
                if !self.is_current(&track_identifier, play_id) {
                    debug!(guild_id = self.guild_id(), track = %track_identifier, ?play_id, "ignoring end of a previous play");
                    return;
                }
                self.touch();
                match reason {
                    TrackEndReason::Finished => {
                        self.current_play = None;
                        self.session.reset_failures();
                        self.advance(true);
                    }
                    TrackEndReason::LoadFailed => {
                        self.on_track_failed("the node could not load the track".into())
                    }
                    TrackEndReason::Stopped | TrackEndReason::Replaced | TrackEndReason::Cleanup => {
                        debug!(guild_id = self.guild_id(), ?reason, "track ended without advancing");
                    }
                }
            }
            NodeEvent::TrackException {
                track_identifier,
                play_id,
                message,
            } => {
                if self.is_current(&track_identifier, play_id) {
                    self.touch();
                    self.on_track_failed(message);
                }
            }
            NodeEvent::TrackStuck {
                track_identifier,
                play_id,
                threshold_ms,
            } => {
                if self.is_current(&track_identifier, play_id) {
                    self.touch();
                    self.on_track_failed(format!("no audio for {threshold_ms} ms"));
                }
            }
            NodeEvent::PlayerUpdate { position_ms } => self.session.set_position(position_ms),
            NodeEvent::Disconnected { code, reason } => {
                warn!(guild_id = self.guild_id(), node_id, ?code, ?reason, "audio node dropped the player");
                self.migrate();
            }
        }
    }

    fn on_track_failed(&mut self, reason: String) {
        let Some(track) = self.session.queue().current().cloned() else {
            return;
        };
        self.current_play = None;
        let consecutive = self.session.record_failure();
        warn!(
            guild_id = self.guild_id(),
            track = %track.title,
            consecutive,
            reason = %reason,
            "skipping unplayable track"
        );
        sse_events::broadcast_track_skipped(&self.state, self.guild_id(), &track, reason, consecutive);

        let limit = self.state.config().session.max_consecutive_track_failures;
        if consecutive < limit {
            self.advance(false);
            return;
        }

        self.release_node();
        self.session.set_position(0);
        let fault = FaultReason::TrackFailures { consecutive };
        if self.session.apply(SessionEvent::Fault(fault)).is_ok() {
            error!(guild_id = self.guild_id(), consecutive, "too many consecutive track failures; playback aborted");
            sse_events::broadcast_fatal_queue_error(&self.state, self.guild_id(), consecutive);
        }
    }

    fn on_gateway_event(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::ChannelEmpty => {
                if self.channel_empty_deadline.is_none() {
                    let idle_timeout = self.state.config().session.idle_timeout;
                    self.channel_empty_deadline = Some(Instant::now() + idle_timeout);
                    info!(guild_id = self.guild_id(), "voice channel empty; leaving unless someone returns");
                }
            }
            GatewayEvent::ChannelOccupied => {
                if self.channel_empty_deadline.take().is_some() {
                    debug!(guild_id = self.guild_id(), "listener returned to the voice channel");
                }
                self.touch();
            }
            GatewayEvent::ForcedDisconnect => self.terminate(TerminationReason::ForcedDisconnect),
        }
    }

    fn on_snapshot_rejected(&mut self, stored_revision: u64, stored_owner: String) {
        if stored_owner == self.session.owner_replica_id() {
            debug!(guild_id = self.guild_id(), stored_revision, "stored snapshot is ahead of us; raising revision");
            self.session.bump_revision_above(stored_revision);
            return;
        }
        warn!(
            guild_id = self.guild_id(),
            stored_revision,
            stored_owner = %stored_owner,
            "another replica took over the session"
        );
        self.terminate(TerminationReason::OwnershipLost);
    }

    fn terminate(&mut self, reason: TerminationReason) {
        if self.session.is_terminated() {
            return;
        }
        let waiters = self.cancel_acquisition();
        self.release_node();
        if let Err(err) = self.session.apply(SessionEvent::Terminate) {
            warn!(guild_id = self.guild_id(), error = %err, "cannot terminate session");
            return;
        }
        self.termination = Some(reason);
        info!(guild_id = self.guild_id(), ?reason, "session terminated");

        for waiter in waiters {
            let _ = waiter.send(Err(ServiceError::SessionUnavailable(
                "the session ended before playback started".into(),
            )));
        }
        sse_events::broadcast_terminated(&self.state, self.guild_id(), reason);
    }

    /// Flush or drop the snapshot, then leave voice unless someone else owns the guild now.
    async fn shutdown(self) {
        let guild_id = self.guild_id();
        let revision = self.session.revision();

        if self.termination == Some(TerminationReason::OwnershipLost) {
            self.writer.abort();
            return;
        }

        self.writer.flush().await;
        let still_owned = synchronizer::discard(&self.state, guild_id, revision).await;
        if !still_owned || self.termination == Some(TerminationReason::ForcedDisconnect) {
            return;
        }
        if let Some(gateway) = self.state.gateway() {
            if let Err(err) = gateway.leave(guild_id).await {
                warn!(guild_id, error = %err, "failed to leave voice channel");
            }
        }
    }
}

/// Run node requests of one session in order.
fn spawn_node_worker(
    state: SharedState,
    mailbox: mpsc::UnboundedSender<SessionInput>,
) -> mpsc::UnboundedSender<NodeTask> {
    let (tx, mut rx) = mpsc::unbounded_channel::<NodeTask>();
    let client = state.node_client();

    tokio::spawn(async move {
        while let Some(task) = rx.recv().await {
            let (ticket, node, op) = match task {
                NodeTask::Request { ticket, node, op } => (ticket, node, op),
                NodeTask::Barrier(done) => {
                    let _ = done.send(());
                    continue;
                }
            };

            let node_id = node.node_id.clone();
            let guild_id = node.guild_id;
            let result = match op {
                NodeOp::Play {
                    track,
                    start_ms,
                    paused,
                } => match client.play(node.clone(), track, start_ms, ticket).await {
                    Ok(()) if paused => client.pause(node).await,
                    other => other,
                },
                NodeOp::Pause => client.pause(node).await,
                NodeOp::Resume => client.resume(node).await,
                NodeOp::Stop => client.stop(node).await,
                NodeOp::Disconnect => client.disconnect(node).await,
            };

            if let Err(err) = result {
                warn!(guild_id, node_id = %node_id, ticket, error = %err, "audio node request failed");
                let _ = mailbox.send(SessionInput::NodeCommandFailed {
                    ticket,
                    node_id,
                    error: err.to_string(),
                });
            }
        }
    });

    tx
}

/// Parameters of one background acquisition.
struct AcquireRequest {
    guild_id: GuildId,
    voice_channel_id: u64,
    hint: Option<NodeId>,
    attempt: u64,
}

/// Bind the guild to a node and connect a player, retrying with backoff.
async fn acquire_node(
    state: SharedState,
    mut request: AcquireRequest,
    drained: oneshot::Receiver<()>,
    mut cancelled: oneshot::Receiver<()>,
    mailbox: mpsc::UnboundedSender<SessionInput>,
) {
    // Earlier teardown requests must reach the node before a new player is created.
    tokio::select! {
        _ = drained => {}
        _ = &mut cancelled => return,
    }

    let guild_id = request.guild_id;
    let attempt = request.attempt;
    let config = &state.config().nodes;
    let started = Instant::now();
    let deadline = started + config.acquire_max_wait;
    let mut backoff = config.acquire_initial_backoff;
    let mut last_error: Option<String> = None;

    let outcome = loop {
        match state.nodes().acquire(guild_id, request.hint.as_deref()) {
            Ok(node) => {
                let node_id = node.id.clone();
                let connected = tokio::select! {
                    connected = connect_player(&state, node, guild_id, request.voice_channel_id) => connected,
                    _ = &mut cancelled => {
                        state.nodes().release(guild_id);
                        return;
                    }
                };
                match connected {
                    Ok(session) => break Ok(session),
                    Err(err) => {
                        warn!(guild_id, node_id = %node_id, attempt, error = %err, "could not connect to audio node");
                        state.nodes().release(guild_id);
                        request.hint = None;
                        last_error = Some(err);
                    }
                }
            }
            Err(PoolError::NoCapacity) => {
                debug!(guild_id, attempt, "no audio node has capacity; waiting");
            }
            Err(err) => last_error = Some(err.to_string()),
        }

        let now = Instant::now();
        if now >= deadline {
            break Err(match last_error.take() {
                Some(message) => AcquireError::Unavailable(message),
                None => AcquireError::NoCapacity {
                    waited: now - started,
                },
            });
        }
        tokio::select! {
            _ = sleep(backoff.min(deadline - now)) => {}
            _ = &mut cancelled => return,
        }
        backoff = (backoff * 2).min(config.acquire_max_backoff);
    };

    let _ = mailbox.send(SessionInput::Acquired { attempt, outcome });
}

/// Join voice and create the player on `node`.
///
/// A node that refuses the player is marked degraded so the next attempt picks another.
async fn connect_player(
    state: &SharedState,
    node: NodeDescriptor,
    guild_id: GuildId,
    voice_channel_id: u64,
) -> Result<NodeSession, String> {
    if let Some(gateway) = state.gateway() {
        gateway
            .join(guild_id, voice_channel_id)
            .await
            .map_err(|err| err.to_string())?;
    }

    let node_id = node.id.clone();
    match state
        .node_client()
        .connect(node, guild_id, voice_channel_id)
        .await
    {
        Ok(session) => Ok(session),
        Err(err) => {
            let _ = state.nodes().report_health(&node_id, NodeHealth::Degraded);
            Err(err.to_string())
        }
    }
}
