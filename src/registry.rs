//! Channel/listener bookkeeping for the notifier actor.
//!
//! [`Registry`] is the source of truth for "which channels are we
//! subscribed to at the database" and "which listeners care about each
//! channel". Every mutation keeps the two maps consistent and returns
//! the delta of channels whose subscriber count crossed zero — exactly
//! the channels that need a `LISTEN` or `UNLISTEN` at the database.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::notifier::Envelope;

/// Identity of a registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ListenerId(Uuid);

impl ListenerId {
    /// Generates a fresh identity.
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Liveness handle for one listener: aborts the listener's watch task
/// when dropped, which happens exactly when the listener's registry
/// entry is removed.
#[derive(Debug)]
pub(crate) struct MonitorGuard {
    handle: Option<AbortHandle>,
}

impl MonitorGuard {
    /// Wraps the abort handle of a spawned watch task.
    pub(crate) fn new(handle: AbortHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// A guard with no backing task, for registry unit tests.
    #[cfg(test)]
    pub(crate) fn disabled() -> Self {
        Self { handle: None }
    }
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Per-listener registry entry.
#[derive(Debug)]
struct ListenerEntry {
    /// Held for its `Drop`; created once per listener lifetime.
    _monitor: MonitorGuard,
    sender: UnboundedSender<Envelope>,
    channels: BTreeSet<String>,
}

/// Two-sided mapping between channels and listeners.
///
/// Invariants:
/// - a channel is a key in `channels` iff at least one listener lists
///   it in its entry (no dangling keys, no empty subscriber lists);
/// - a listener has exactly one monitor guard, created on its first
///   subscription and dropped when its channel set becomes empty.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    channels: BTreeMap<String, Vec<ListenerId>>,
    listeners: HashMap<ListenerId, ListenerEntry>,
}

impl Registry {
    /// Registers `listener` for `channels`, creating the entry (and its
    /// monitor, via `monitor`) if the listener is unknown.
    ///
    /// Returns the subset of channels that had zero prior subscribers —
    /// the delta to `LISTEN` for at the database. Channels the listener
    /// already holds contribute nothing. An empty channel list creates
    /// no entry: entries exist exactly while their channel set is
    /// non-empty.
    pub(crate) fn add_listener(
        &mut self,
        listener: ListenerId,
        sender: &UnboundedSender<Envelope>,
        channels: Vec<String>,
        monitor: impl FnOnce() -> MonitorGuard,
    ) -> Vec<String> {
        if channels.is_empty() {
            return Vec::new();
        }

        let entry = self
            .listeners
            .entry(listener)
            .or_insert_with(|| ListenerEntry {
                _monitor: monitor(),
                sender: sender.clone(),
                channels: BTreeSet::new(),
            });

        let mut delta = Vec::new();
        for channel in channels {
            if !entry.channels.insert(channel.clone()) {
                continue;
            }
            match self.channels.entry(channel) {
                std::collections::btree_map::Entry::Vacant(vacant) => {
                    delta.push(vacant.key().clone());
                    vacant.insert(vec![listener]);
                }
                std::collections::btree_map::Entry::Occupied(mut occupied) => {
                    occupied.get_mut().push(listener);
                }
            }
        }
        delta
    }

    /// Removes `channels` from `listener`'s interest set, deleting the
    /// entry (and releasing its monitor) when the set becomes empty.
    ///
    /// Returns the subset of channels whose key was deleted — the delta
    /// to `UNLISTEN` at the database. Unknown listeners and channels the
    /// listener never held are no-ops.
    pub(crate) fn remove_listener_channels(
        &mut self,
        listener: ListenerId,
        channels: &[String],
    ) -> Vec<String> {
        let Some(entry) = self.listeners.get_mut(&listener) else {
            return Vec::new();
        };

        let mut delta = Vec::new();
        for channel in channels {
            if !entry.channels.remove(channel) {
                continue;
            }
            if let Some(subscribers) = self.channels.get_mut(channel) {
                subscribers.retain(|id| id != &listener);
                if subscribers.is_empty() {
                    self.channels.remove(channel);
                    delta.push(channel.clone());
                }
            }
        }

        if entry.channels.is_empty() {
            self.listeners.remove(&listener);
        }
        delta
    }

    /// Removes `listener` entirely, as on termination. Equivalent to
    /// [`remove_listener_channels`](Self::remove_listener_channels) over
    /// the listener's full channel set.
    pub(crate) fn remove_listener(&mut self, listener: ListenerId) -> Vec<String> {
        let channels: Vec<String> = match self.listeners.get(&listener) {
            Some(entry) => entry.channels.iter().cloned().collect(),
            None => return Vec::new(),
        };
        self.remove_listener_channels(listener, &channels)
    }

    /// Returns the (possibly empty) list of listeners interested in a
    /// channel.
    pub(crate) fn subscribers_of(&self, channel: &str) -> &[ListenerId] {
        self.channels.get(channel).map_or(&[], Vec::as_slice)
    }

    /// Iterates the envelope senders of every listener interested in a
    /// channel, in registration order.
    pub(crate) fn senders_of(
        &self,
        channel: &str,
    ) -> impl Iterator<Item = &UnboundedSender<Envelope>> {
        self.channels
            .get(channel)
            .into_iter()
            .flatten()
            .filter_map(|id| self.listeners.get(id).map(|entry| &entry.sender))
    }

    /// All currently registered channel names, sorted. Used to rebuild
    /// database-side LISTEN state on reconnect.
    pub(crate) fn channel_names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    /// Whether any channel is registered.
    pub(crate) fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Whether the listener has a live entry.
    #[cfg(test)]
    pub(crate) fn contains_listener(&self, listener: ListenerId) -> bool {
        self.listeners.contains_key(&listener)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn sender() -> UnboundedSender<Envelope> {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        tx
    }

    fn chans(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| (*n).to_string()).collect()
    }

    #[test]
    fn first_subscriber_creates_the_channel() {
        let mut registry = Registry::default();
        let l1 = ListenerId::new();

        let delta = registry.add_listener(l1, &sender(), chans(&["c.oban_a"]), MonitorGuard::disabled);
        assert_eq!(delta, chans(&["c.oban_a"]));
        assert_eq!(registry.subscribers_of("c.oban_a"), &[l1]);
    }

    #[test]
    fn resubscribing_is_idempotent() {
        let mut registry = Registry::default();
        let l1 = ListenerId::new();
        let tx = sender();

        let first = registry.add_listener(l1, &tx, chans(&["c.oban_a"]), MonitorGuard::disabled);
        let second = registry.add_listener(l1, &tx, chans(&["c.oban_a"]), MonitorGuard::disabled);
        assert_eq!(first, chans(&["c.oban_a"]));
        assert!(second.is_empty());
        assert_eq!(registry.subscribers_of("c.oban_a"), &[l1]);
    }

    #[test]
    fn delta_tracks_zero_crossings_only() {
        let mut registry = Registry::default();
        let l1 = ListenerId::new();
        let l2 = ListenerId::new();

        let d1 = registry.add_listener(l1, &sender(), chans(&["c.oban_t"]), MonitorGuard::disabled);
        let d2 = registry.add_listener(l2, &sender(), chans(&["c.oban_t"]), MonitorGuard::disabled);
        assert_eq!(d1, chans(&["c.oban_t"]));
        assert!(d2.is_empty());

        let d3 = registry.remove_listener_channels(l1, &chans(&["c.oban_t"]));
        assert!(d3.is_empty());
        assert_eq!(registry.subscribers_of("c.oban_t"), &[l2]);

        let d4 = registry.remove_listener_channels(l2, &chans(&["c.oban_t"]));
        assert_eq!(d4, chans(&["c.oban_t"]));
        assert!(registry.is_empty());
    }

    #[test]
    fn listener_entry_dies_with_its_last_channel() {
        let mut registry = Registry::default();
        let l1 = ListenerId::new();

        registry.add_listener(
            l1,
            &sender(),
            chans(&["c.oban_a", "c.oban_b"]),
            MonitorGuard::disabled,
        );
        registry.remove_listener_channels(l1, &chans(&["c.oban_a"]));
        assert!(registry.contains_listener(l1));

        registry.remove_listener_channels(l1, &chans(&["c.oban_b"]));
        assert!(!registry.contains_listener(l1));
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_listener_drops_the_full_set() {
        let mut registry = Registry::default();
        let l1 = ListenerId::new();
        let l2 = ListenerId::new();

        registry.add_listener(
            l1,
            &sender(),
            chans(&["c.oban_a", "c.oban_b"]),
            MonitorGuard::disabled,
        );
        registry.add_listener(l2, &sender(), chans(&["c.oban_b"]), MonitorGuard::disabled);

        let delta = registry.remove_listener(l1);
        assert_eq!(delta, chans(&["c.oban_a"]));
        assert!(!registry.contains_listener(l1));
        assert_eq!(registry.subscribers_of("c.oban_b"), &[l2]);
    }

    #[test]
    fn empty_channel_list_creates_no_entry() {
        let mut registry = Registry::default();
        let l1 = ListenerId::new();

        let delta = registry.add_listener(l1, &sender(), Vec::new(), || {
            panic!("no monitor for an empty subscription")
        });
        assert!(delta.is_empty());
        assert!(!registry.contains_listener(l1));
        assert!(registry.is_empty());
    }

    #[test]
    fn unknown_listener_is_a_noop() {
        let mut registry = Registry::default();
        let ghost = ListenerId::new();

        assert!(registry.remove_listener(ghost).is_empty());
        assert!(
            registry
                .remove_listener_channels(ghost, &chans(&["c.oban_a"]))
                .is_empty()
        );
    }

    #[test]
    fn channel_names_are_sorted() {
        let mut registry = Registry::default();
        let l1 = ListenerId::new();

        registry.add_listener(
            l1,
            &sender(),
            chans(&["c.oban_b", "c.oban_a"]),
            MonitorGuard::disabled,
        );
        assert_eq!(registry.channel_names(), chans(&["c.oban_a", "c.oban_b"]));
    }

    #[test]
    fn subscribers_of_unknown_channel_is_empty() {
        let registry = Registry::default();
        assert!(registry.subscribers_of("c.oban_missing").is_empty());
    }
}
