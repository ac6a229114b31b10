//! Per-guild track queue: ordered tracks, a play cursor, repeat mode and an optional shuffle
//! permutation. Purely in-memory and deterministic; randomness is injected by the caller.

use rand::{Rng, seq::SliceRandom};
use thiserror::Error;

use crate::dao::models::{RepeatModeEntity, RequesterEntity, TrackEntity};

/// A playable track. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    /// Node-side identifier used to start playback.
    pub identifier: String,
    /// Source URI.
    pub uri: String,
    /// Display title.
    pub title: String,
    /// Length in milliseconds.
    pub duration_ms: u64,
    /// User who requested the track, when known.
    pub requester: Option<Requester>,
}

/// Who asked for a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    /// Chat platform user id.
    pub user_id: u64,
    /// Display name at request time.
    pub display_name: String,
}

/// How the queue behaves when the current track ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RepeatMode {
    /// Advance through the queue once and stop at the end.
    #[default]
    None,
    /// Replay the current track on natural completion.
    Track,
    /// Wrap to the start once the end is reached.
    Queue,
}

/// Position of the play cursor, expressed in play-order positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// The track at this position is the current one.
    At(usize),
    /// No track is current; the next advance starts at this position.
    Pending(usize),
}

/// Errors returned by queue mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The index does not address a track in the queue.
    #[error("index {index} is out of range for a queue of {len} track(s)")]
    IndexOutOfRange {
        /// Requested position.
        index: usize,
        /// Queue length at the time of the request.
        len: usize,
    },
    /// A persisted queue does not satisfy the queue invariants.
    #[error("invalid queue snapshot: {0}")]
    InvalidSnapshot(&'static str),
}

/// Serializable projection of a [`Queue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    /// Tracks in enqueue order.
    pub tracks: Vec<Track>,
    /// Shuffle permutation of indices into `tracks`.
    pub order: Option<Vec<usize>>,
    /// Current play-order position.
    pub cursor: Option<usize>,
    /// Resume position when `cursor` is absent.
    pub pending: usize,
    /// Repeat mode.
    pub mode: RepeatMode,
}

/// Ordered track list with cursor, repeat mode and shuffle order.
///
/// The underlying `tracks` sequence keeps enqueue order; shuffling only installs a
/// permutation (`order`) that the cursor walks instead. Every public operation leaves the
/// cursor either absent or in bounds.
#[derive(Debug, Clone)]
pub struct Queue {
    tracks: Vec<Track>,
    order: Option<Vec<usize>>,
    cursor: Cursor,
    mode: RepeatMode,
}

impl Default for Queue {
    fn default() -> Self {
        Self {
            tracks: Vec::new(),
            order: None,
            cursor: Cursor::Pending(0),
            mode: RepeatMode::None,
        }
    }
}

impl Queue {
    /// Create an empty queue in repeat-none mode.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracks in the queue.
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// Whether the queue holds no tracks.
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Active repeat mode.
    pub fn mode(&self) -> RepeatMode {
        self.mode
    }

    /// Whether a shuffle order is installed.
    pub fn is_shuffled(&self) -> bool {
        self.order.is_some()
    }

    /// Play-order position of the current track.
    pub fn cursor(&self) -> Option<usize> {
        match self.cursor {
            Cursor::At(position) => Some(position),
            Cursor::Pending(_) => None,
        }
    }

    /// Raw cursor value.
    pub fn raw_cursor(&self) -> Cursor {
        self.cursor
    }

    /// Whether the cursor ran past the last track without a current one.
    pub fn is_finished(&self) -> bool {
        matches!(self.cursor, Cursor::Pending(next) if next >= self.tracks.len())
    }

    /// Currently selected track.
    pub fn current(&self) -> Option<&Track> {
        self.cursor().and_then(|position| self.track_at(position))
    }

    /// Track at a play-order position.
    pub fn track_at(&self, position: usize) -> Option<&Track> {
        self.base_index(position)
            .and_then(|index| self.tracks.get(index))
    }

    /// Tracks that will play after the current one, in play order.
    pub fn upcoming(&self) -> Vec<&Track> {
        let start = match self.cursor {
            Cursor::At(position) => position + 1,
            Cursor::Pending(next) => next,
        };
        (start..self.len())
            .filter_map(|position| self.track_at(position))
            .collect()
    }

    /// Tracks already played before the current one, in play order.
    pub fn history(&self) -> Vec<&Track> {
        let end = match self.cursor {
            Cursor::At(position) => position,
            Cursor::Pending(next) => next.min(self.len()),
        };
        (0..end)
            .filter_map(|position| self.track_at(position))
            .collect()
    }

    /// All tracks in the order they will be played.
    pub fn tracks_in_play_order(&self) -> Vec<&Track> {
        (0..self.len())
            .filter_map(|position| self.track_at(position))
            .collect()
    }

    /// Append a track at the end of the play order and return its position.
    pub fn enqueue(&mut self, track: Track) -> usize {
        let index = self.tracks.len();
        self.tracks.push(track);
        if let Some(order) = self.order.as_mut() {
            order.push(index);
        }
        index
    }

    /// Insert a track so it plays right after the current one and return its position.
    pub fn push_next(&mut self, track: Track) -> usize {
        let position = match self.cursor {
            Cursor::At(current) => current + 1,
            Cursor::Pending(next) => next.min(self.tracks.len()),
        };

        match self.order.as_mut() {
            Some(order) => {
                let index = self.tracks.len();
                self.tracks.push(track);
                order.insert(position, index);
            }
            None => self.tracks.insert(position, track),
        }
        position
    }

    /// Remove the track at a play-order position.
    ///
    /// Returns the removed track and whether it was the current one. Removing the current
    /// track leaves no current track; the next advance picks the track that took its place.
    pub fn remove_at(&mut self, position: usize) -> Result<(Track, bool), QueueError> {
        let index = self
            .base_index(position)
            .ok_or(self.out_of_range(position))?;

        let track = self.tracks.remove(index);
        if let Some(order) = self.order.as_mut() {
            order.remove(position);
            for entry in order.iter_mut() {
                if *entry > index {
                    *entry -= 1;
                }
            }
        }

        let mut was_current = false;
        self.cursor = match self.cursor {
            Cursor::At(current) if position < current => Cursor::At(current - 1),
            Cursor::At(current) if position == current => {
                was_current = true;
                Cursor::Pending(current)
            }
            Cursor::Pending(next) if position < next => Cursor::Pending(next - 1),
            other => other,
        };

        Ok((track, was_current))
    }

    /// Advance on natural completion of the current track.
    ///
    /// Repeat-track returns the current track again without moving. Repeat-queue wraps to
    /// the first position past the end. Repeat-none leaves the queue finished and returns
    /// `None` past the end.
    pub fn move_next(&mut self) -> Option<&Track> {
        if let (Cursor::At(current), RepeatMode::Track) = (self.cursor, self.mode) {
            return self.track_at(current);
        }
        self.advance()
    }

    /// Advance on explicit request, ignoring repeat-track.
    pub fn skip(&mut self) -> Option<&Track> {
        self.advance()
    }

    /// Step back to the previous track. Stays on the first track instead of wrapping.
    pub fn move_previous(&mut self) -> Option<&Track> {
        let target = match self.cursor {
            Cursor::At(current) => current.saturating_sub(1),
            Cursor::Pending(0) => return None,
            Cursor::Pending(next) => (next - 1).min(self.len().checked_sub(1)?),
        };
        self.cursor = Cursor::At(target);
        self.track_at(target)
    }

    /// Make the track at a play-order position current.
    pub fn move_to(&mut self, position: usize) -> Result<&Track, QueueError> {
        if position >= self.len() {
            return Err(self.out_of_range(position));
        }
        self.cursor = Cursor::At(position);
        self.track_at(position).ok_or(self.out_of_range(position))
    }

    /// Change the repeat mode.
    pub fn set_mode(&mut self, mode: RepeatMode) {
        self.mode = mode;
    }

    /// Shuffle the tracks that have not played yet.
    ///
    /// Already played positions and the current track keep their place, so the active
    /// track is never displaced.
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let fixed = match self.cursor {
            Cursor::At(current) => current + 1,
            Cursor::Pending(next) => next,
        }
        .min(self.tracks.len());

        let len = self.tracks.len();
        let order = self.order.get_or_insert_with(|| (0..len).collect());
        order[fixed..].shuffle(rng);
    }

    /// Drop the shuffle order and return to enqueue order, keeping the current track.
    pub fn unshuffle(&mut self) {
        let Some(order) = self.order.take() else {
            return;
        };

        self.cursor = match self.cursor {
            Cursor::At(position) => Cursor::At(order[position]),
            Cursor::Pending(next) => match order.get(next) {
                Some(index) => Cursor::Pending(*index),
                None => Cursor::Pending(self.tracks.len()),
            },
        };
    }

    /// Remove every track. The repeat mode is kept.
    pub fn clear(&mut self) {
        self.tracks.clear();
        self.order = None;
        self.cursor = Cursor::Pending(0);
    }

    /// Forget the current track and resume from the first position on the next advance.
    pub fn rewind(&mut self) {
        self.cursor = Cursor::Pending(0);
    }

    /// Capture the queue as a plain value.
    pub fn snapshot(&self) -> QueueSnapshot {
        let (cursor, pending) = match self.cursor {
            Cursor::At(position) => (Some(position), position),
            Cursor::Pending(next) => (None, next),
        };
        QueueSnapshot {
            tracks: self.tracks.clone(),
            order: self.order.clone(),
            cursor,
            pending,
            mode: self.mode,
        }
    }

    /// Rebuild a queue from a snapshot, rejecting snapshots that break the invariants.
    pub fn from_snapshot(snapshot: QueueSnapshot) -> Result<Self, QueueError> {
        let len = snapshot.tracks.len();

        if let Some(order) = &snapshot.order {
            if order.len() != len {
                return Err(QueueError::InvalidSnapshot("shuffle order length mismatch"));
            }
            let mut seen = vec![false; len];
            for &index in order {
                match seen.get_mut(index) {
                    Some(slot) if !*slot => *slot = true,
                    _ => return Err(QueueError::InvalidSnapshot("shuffle order is not a permutation")),
                }
            }
        }

        let cursor = match snapshot.cursor {
            Some(position) if position < len => Cursor::At(position),
            Some(_) => return Err(QueueError::InvalidSnapshot("cursor out of bounds")),
            None if snapshot.pending <= len => Cursor::Pending(snapshot.pending),
            None => return Err(QueueError::InvalidSnapshot("resume position out of bounds")),
        };

        Ok(Self {
            tracks: snapshot.tracks,
            order: snapshot.order,
            cursor,
            mode: snapshot.mode,
        })
    }

    fn advance(&mut self) -> Option<&Track> {
        let next = match self.cursor {
            Cursor::At(current) => current + 1,
            Cursor::Pending(next) => next,
        };

        let len = self.tracks.len();
        self.cursor = if next < len {
            Cursor::At(next)
        } else if self.mode == RepeatMode::Queue && len > 0 {
            Cursor::At(0)
        } else {
            Cursor::Pending(len)
        };
        self.current()
    }

    fn base_index(&self, position: usize) -> Option<usize> {
        match &self.order {
            Some(order) => order.get(position).copied(),
            None => (position < self.tracks.len()).then_some(position),
        }
    }

    fn out_of_range(&self, index: usize) -> QueueError {
        QueueError::IndexOutOfRange {
            index,
            len: self.tracks.len(),
        }
    }
}

impl From<TrackEntity> for Track {
    fn from(entity: TrackEntity) -> Self {
        Self {
            identifier: entity.identifier,
            uri: entity.uri,
            title: entity.title,
            duration_ms: entity.duration_ms,
            requester: entity.requester.map(|requester| Requester {
                user_id: requester.user_id,
                display_name: requester.display_name,
            }),
        }
    }
}

impl From<Track> for TrackEntity {
    fn from(track: Track) -> Self {
        Self {
            identifier: track.identifier,
            uri: track.uri,
            title: track.title,
            duration_ms: track.duration_ms,
            requester: track.requester.map(|requester| RequesterEntity {
                user_id: requester.user_id,
                display_name: requester.display_name,
            }),
        }
    }
}

impl From<RepeatModeEntity> for RepeatMode {
    fn from(value: RepeatModeEntity) -> Self {
        match value {
            RepeatModeEntity::None => RepeatMode::None,
            RepeatModeEntity::Track => RepeatMode::Track,
            RepeatModeEntity::Queue => RepeatMode::Queue,
        }
    }
}

impl From<RepeatMode> for RepeatModeEntity {
    fn from(value: RepeatMode) -> Self {
        match value {
            RepeatMode::None => RepeatModeEntity::None,
            RepeatMode::Track => RepeatModeEntity::Track,
            RepeatMode::Queue => RepeatModeEntity::Queue,
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn track(id: &str) -> Track {
        Track {
            identifier: id.into(),
            uri: format!("https://media.example/{id}"),
            title: id.to_uppercase(),
            duration_ms: 180_000,
            requester: None,
        }
    }

    fn queue_of(ids: &[&str]) -> Queue {
        let mut queue = Queue::new();
        for id in ids {
            queue.enqueue(track(id));
        }
        queue
    }

    fn ids(tracks: Vec<&Track>) -> Vec<String> {
        tracks.into_iter().map(|t| t.identifier.clone()).collect()
    }

    fn current_id(queue: &Queue) -> Option<String> {
        queue.current().map(|t| t.identifier.clone())
    }

    fn assert_cursor_invariant(queue: &Queue) {
        if let Some(position) = queue.cursor() {
            assert!(position < queue.len(), "cursor {position} out of bounds");
        }
        if let Cursor::Pending(next) = queue.raw_cursor() {
            assert!(next <= queue.len());
        }
    }

    #[test]
    fn new_queue_has_no_current_track() {
        let queue = Queue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.cursor(), None);
        assert!(queue.is_finished());
    }

    #[test]
    fn move_next_walks_the_queue_then_finishes() {
        let mut queue = queue_of(&["a", "b", "c"]);

        assert_eq!(queue.move_next().map(|t| t.identifier.as_str()), Some("a"));
        assert_eq!(queue.move_next().map(|t| t.identifier.as_str()), Some("b"));
        assert_eq!(queue.move_next().map(|t| t.identifier.as_str()), Some("c"));
        assert!(queue.move_next().is_none());
        assert_eq!(queue.cursor(), None);
        assert!(queue.is_finished());
        assert_eq!(ids(queue.history()), vec!["a", "b", "c"]);
    }

    #[test]
    fn repeat_track_never_advances_on_completion() {
        let mut queue = queue_of(&["a", "b"]);
        queue.move_next();
        queue.set_mode(RepeatMode::Track);

        for _ in 0..10 {
            assert_eq!(queue.move_next().map(|t| t.identifier.as_str()), Some("a"));
        }
        assert_eq!(queue.cursor(), Some(0));
    }

    #[test]
    fn skip_ignores_repeat_track() {
        let mut queue = queue_of(&["a", "b"]);
        queue.move_next();
        queue.set_mode(RepeatMode::Track);

        assert_eq!(queue.skip().map(|t| t.identifier.as_str()), Some("b"));
    }

    #[test]
    fn repeat_queue_wraps_to_first_track() {
        let mut queue = queue_of(&["a", "b"]);
        queue.set_mode(RepeatMode::Queue);
        queue.move_next();
        queue.move_next();

        assert_eq!(queue.move_next().map(|t| t.identifier.as_str()), Some("a"));
        assert_eq!(queue.cursor(), Some(0));
    }

    #[test]
    fn enqueue_after_finish_plays_new_track_next() {
        let mut queue = queue_of(&["a"]);
        queue.move_next();
        assert!(queue.move_next().is_none());

        queue.enqueue(track("b"));
        assert_eq!(queue.move_next().map(|t| t.identifier.as_str()), Some("b"));
    }

    #[test]
    fn push_next_inserts_after_current() {
        let mut queue = queue_of(&["a", "b", "c"]);
        queue.move_next();

        assert_eq!(queue.push_next(track("x")), 1);
        assert_eq!(ids(queue.tracks_in_play_order()), vec!["a", "x", "b", "c"]);
        assert_eq!(queue.skip().map(|t| t.identifier.as_str()), Some("x"));
    }

    #[test]
    fn remove_before_cursor_keeps_current_track() {
        let mut queue = queue_of(&["a", "b", "c"]);
        queue.move_to(2).unwrap();

        let (removed, was_current) = queue.remove_at(0).unwrap();
        assert_eq!(removed.identifier, "a");
        assert!(!was_current);
        assert_eq!(current_id(&queue).as_deref(), Some("c"));
        assert_eq!(queue.cursor(), Some(1));
    }

    #[test]
    fn remove_current_track_resumes_with_its_successor() {
        let mut queue = queue_of(&["a", "b", "c"]);
        queue.move_to(1).unwrap();

        let (removed, was_current) = queue.remove_at(1).unwrap();
        assert_eq!(removed.identifier, "b");
        assert!(was_current);
        assert_eq!(queue.cursor(), None);
        assert_eq!(queue.move_next().map(|t| t.identifier.as_str()), Some("c"));
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        let mut queue = queue_of(&["a"]);

        assert_eq!(
            queue.remove_at(3).unwrap_err(),
            QueueError::IndexOutOfRange { index: 3, len: 1 }
        );
        assert!(matches!(
            queue.move_to(1),
            Err(QueueError::IndexOutOfRange { index: 1, len: 1 })
        ));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn move_previous_does_not_wrap() {
        let mut queue = queue_of(&["a", "b"]);
        assert!(queue.move_previous().is_none());

        queue.move_to(1).unwrap();
        assert_eq!(queue.move_previous().map(|t| t.identifier.as_str()), Some("a"));
        assert_eq!(queue.move_previous().map(|t| t.identifier.as_str()), Some("a"));

        queue.skip();
        queue.skip();
        assert!(queue.is_finished());
        assert_eq!(queue.move_previous().map(|t| t.identifier.as_str()), Some("b"));
    }

    #[test]
    fn shuffle_keeps_history_and_current_track_in_place() {
        let ids_in: Vec<String> = (0..20).map(|i| format!("t{i}")).collect();
        let refs: Vec<&str> = ids_in.iter().map(String::as_str).collect();
        let mut queue = queue_of(&refs);
        queue.move_to(4).unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        queue.shuffle(&mut rng);

        assert!(queue.is_shuffled());
        assert_eq!(queue.cursor(), Some(4));
        assert_eq!(current_id(&queue).as_deref(), Some("t4"));
        assert_eq!(ids(queue.history()), vec!["t0", "t1", "t2", "t3"]);

        let mut upcoming = ids(queue.upcoming());
        assert_ne!(upcoming, refs[5..].to_vec());
        upcoming.sort();
        let mut expected: Vec<String> = refs[5..].iter().map(|s| s.to_string()).collect();
        expected.sort();
        assert_eq!(upcoming, expected);
    }

    #[test]
    fn unshuffle_restores_order_and_keeps_current_identity() {
        let mut queue = queue_of(&["a", "b", "c", "d", "e", "f"]);
        queue.move_next();
        let mut rng = StdRng::seed_from_u64(42);
        queue.shuffle(&mut rng);

        queue.skip();
        queue.skip();
        let playing = current_id(&queue);

        queue.unshuffle();
        assert!(!queue.is_shuffled());
        assert_eq!(ids(queue.tracks_in_play_order()), vec!["a", "b", "c", "d", "e", "f"]);
        assert_eq!(current_id(&queue), playing);
    }

    #[test]
    fn enqueue_while_shuffled_appends_to_both_orders() {
        let mut queue = queue_of(&["a", "b", "c"]);
        queue.move_next();
        queue.shuffle(&mut StdRng::seed_from_u64(3));

        queue.enqueue(track("z"));
        assert_eq!(
            queue.tracks_in_play_order().last().map(|t| t.identifier.as_str()),
            Some("z")
        );
        queue.unshuffle();
        assert_eq!(ids(queue.tracks_in_play_order()), vec!["a", "b", "c", "z"]);
    }

    #[test]
    fn remove_while_shuffled_keeps_permutation_valid() {
        let mut queue = queue_of(&["a", "b", "c", "d"]);
        queue.move_next();
        queue.shuffle(&mut StdRng::seed_from_u64(11));

        queue.remove_at(2).unwrap();
        let snapshot = queue.snapshot();
        assert!(Queue::from_snapshot(snapshot).is_ok());
        queue.unshuffle();
        assert_eq!(queue.len(), 3);
        assert_eq!(current_id(&queue).as_deref(), Some("a"));
    }

    #[test]
    fn clear_keeps_mode() {
        let mut queue = queue_of(&["a", "b"]);
        queue.set_mode(RepeatMode::Queue);
        queue.move_next();
        queue.clear();

        assert!(queue.is_empty());
        assert_eq!(queue.cursor(), None);
        assert_eq!(queue.mode(), RepeatMode::Queue);
        assert!(queue.move_next().is_none());
    }

    #[test]
    fn snapshot_restores_equivalent_queue() {
        let mut queue = queue_of(&["a", "b", "c"]);
        queue.set_mode(RepeatMode::Queue);
        queue.move_to(1).unwrap();
        queue.shuffle(&mut StdRng::seed_from_u64(5));

        let restored = Queue::from_snapshot(queue.snapshot()).unwrap();
        assert_eq!(restored.snapshot(), queue.snapshot());
        assert_eq!(current_id(&restored).as_deref(), Some("b"));
    }

    #[test]
    fn corrupt_snapshots_are_rejected() {
        let mut snapshot = queue_of(&["a", "b"]).snapshot();
        snapshot.cursor = Some(2);
        assert!(Queue::from_snapshot(snapshot).is_err());

        let mut snapshot = queue_of(&["a", "b"]).snapshot();
        snapshot.order = Some(vec![0, 0]);
        assert!(Queue::from_snapshot(snapshot).is_err());

        let mut snapshot = queue_of(&["a"]).snapshot();
        snapshot.pending = 5;
        assert!(Queue::from_snapshot(snapshot).is_err());
    }

    #[test]
    fn random_operation_sequences_keep_cursor_in_bounds() {
        let mut rng = StdRng::seed_from_u64(0xC0FFEE);
        let mut queue = Queue::new();
        let mut counter = 0;

        for _ in 0..5_000 {
            match rng.random_range(0..9) {
                0 | 1 => {
                    counter += 1;
                    queue.enqueue(track(&format!("t{counter}")));
                }
                2 => {
                    let index = rng.random_range(0..queue.len() + 2);
                    let _ = queue.remove_at(index);
                }
                3 | 4 => {
                    queue.move_next();
                }
                5 => {
                    let index = rng.random_range(0..queue.len() + 2);
                    let _ = queue.move_to(index);
                }
                6 => {
                    let mode = match rng.random_range(0..3) {
                        0 => RepeatMode::None,
                        1 => RepeatMode::Track,
                        _ => RepeatMode::Queue,
                    };
                    queue.set_mode(mode);
                }
                7 => {
                    let before = current_id(&queue);
                    if rng.random_bool(0.5) {
                        queue.shuffle(&mut rng);
                    } else {
                        queue.unshuffle();
                    }
                    assert_eq!(current_id(&queue), before);
                }
                _ => {
                    counter += 1;
                    queue.push_next(track(&format!("t{counter}")));
                }
            }
            assert_cursor_invariant(&queue);
        }
    }
}
