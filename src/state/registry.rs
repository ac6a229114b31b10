//! Directory of live session actors on this replica.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::mpsc;

use crate::state::{node_pool::GuildId, session::SessionInput};

/// Mailbox handle of a running session actor.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionInput>,
    generation: u64,
}

impl SessionHandle {
    /// Wrap an actor mailbox.
    pub fn new(tx: mpsc::UnboundedSender<SessionInput>, generation: u64) -> Self {
        Self { tx, generation }
    }

    /// Queue an input for the actor. Fails once the actor has exited.
    pub fn send(&self, input: SessionInput) -> Result<(), SessionInput> {
        self.tx.send(input).map_err(|err| err.0)
    }

    /// Incarnation number of the actor behind this handle.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the actor stopped reading its mailbox.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Guild id to actor mailbox map. At most one live actor exists per guild.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<GuildId, SessionHandle>,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle of the guild's actor, if one is running.
    pub fn get(&self, guild_id: GuildId) -> Option<SessionHandle> {
        self.sessions
            .get(&guild_id)
            .map(|entry| entry.value().clone())
            .filter(|handle| !handle.is_closed())
    }

    /// Return the guild's live handle or register a new actor built by `spawn`.
    ///
    /// `spawn` receives the generation assigned to the new actor and runs while the map
    /// entry is locked, so two callers can never start two actors for one guild.
    pub fn get_or_spawn<F>(&self, guild_id: GuildId, spawn: F) -> SessionHandle
    where
        F: FnOnce(u64) -> mpsc::UnboundedSender<SessionInput>,
    {
        let next_generation = || self.next_generation.fetch_add(1, Ordering::Relaxed);
        match self.sessions.entry(guild_id) {
            Entry::Occupied(occupied) if !occupied.get().is_closed() => occupied.get().clone(),
            Entry::Occupied(mut occupied) => {
                let generation = next_generation();
                let handle = SessionHandle::new(spawn(generation), generation);
                occupied.insert(handle.clone());
                handle
            }
            Entry::Vacant(vacant) => {
                let generation = next_generation();
                let handle = SessionHandle::new(spawn(generation), generation);
                vacant.insert(handle.clone());
                handle
            }
        }
    }

    /// Remove the guild's entry if it still belongs to the given actor incarnation.
    pub fn remove_if_generation(&self, guild_id: GuildId, generation: u64) -> bool {
        self.sessions
            .remove_if(&guild_id, |_, handle| handle.generation == generation)
            .is_some()
    }

    /// Guilds with a registered actor.
    pub fn guild_ids(&self) -> Vec<GuildId> {
        let mut guilds: Vec<GuildId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        guilds.sort_unstable();
        guilds
    }

    /// Number of registered actors.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no actor is registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_actor_per_guild_until_its_generation_is_removed() {
        let registry = SessionRegistry::new();
        let mut receivers = Vec::new();
        let mut spawned = 0;

        let first = registry.get_or_spawn(1, |_| {
            spawned += 1;
            let (tx, rx) = mpsc::unbounded_channel();
            receivers.push(rx);
            tx
        });
        let again = registry.get_or_spawn(1, |_| unreachable!("actor already running"));
        assert_eq!(first.generation(), again.generation());
        assert_eq!(spawned, 1);

        assert!(!registry.remove_if_generation(1, first.generation() + 1));
        assert!(registry.remove_if_generation(1, first.generation()));
        assert!(registry.get(1).is_none());

        let second = registry.get_or_spawn(1, |_| {
            let (tx, rx) = mpsc::unbounded_channel();
            receivers.push(rx);
            tx
        });
        assert_ne!(second.generation(), first.generation());
    }

    #[test]
    fn closed_mailboxes_are_replaced() {
        let registry = SessionRegistry::new();
        let stale = registry.get_or_spawn(5, |_| {
            let (tx, rx) = mpsc::unbounded_channel();
            drop(rx);
            tx
        });
        assert!(registry.get(5).is_none());

        let (tx, _rx) = mpsc::unbounded_channel();
        let fresh = registry.get_or_spawn(5, move |_| tx);
        assert!(!fresh.is_closed());
        assert_ne!(fresh.generation(), stale.generation());
    }
}
