//! Named broadcast channels
//!
//! "Wireless" routing: producers and consumers meet on a string key instead
//! of an edge. A channel exists while it has subscribers. Delivery is
//! synchronous, at most once per subscriber per broadcast, and there is no
//! replay for late subscribers.

use hashbrown::HashMap;

use crate::value::Value;

/// Which end of a channel a subscriber is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    /// Publishes into the channel, never receives from it
    Send,
    /// Receives whatever is published
    Receive,
}

/// Delivery details handed to subscriber callbacks.
#[derive(Clone, Copy, Debug)]
pub struct ChannelMeta<'a> {
    pub channel: &'a str,
    pub sender: Option<&'a str>,
}

pub type ChannelCallback = Box<dyn FnMut(&Value, &ChannelMeta<'_>) + Send>;

struct Subscriber {
    id: String,
    role: ChannelRole,
    callback: Option<ChannelCallback>,
}

#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Vec<Subscriber>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` on `channel` without a callback. Used for audio
    /// channels, where the subscription only records which end a node is.
    pub fn subscribe(&mut self, channel: &str, id: &str, role: ChannelRole) {
        self.insert(channel, id, role, None);
    }

    /// Register `id` on `channel`, invoking `callback` for every broadcast it
    /// receives. Subscribing again replaces the previous registration.
    pub fn subscribe_with(
        &mut self,
        channel: &str,
        id: &str,
        role: ChannelRole,
        callback: ChannelCallback,
    ) {
        self.insert(channel, id, role, Some(callback));
    }

    /// Returns whether `id` was subscribed. Empty channels are dropped.
    pub fn unsubscribe(&mut self, channel: &str, id: &str) -> bool {
        let Some(subscribers) = self.channels.get_mut(channel) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            self.channels.remove(channel);
        }
        removed
    }

    /// Drop `id` from every channel it is on.
    pub fn unsubscribe_all(&mut self, id: &str) {
        self.channels.retain(|_, subscribers| {
            subscribers.retain(|s| s.id != id);
            !subscribers.is_empty()
        });
    }

    /// Invoke every receiving callback on `channel` exactly once. A
    /// subscriber whose id is `sender` is skipped: a node never hears its
    /// own broadcast, as with Pd's `send`/`receive` pairs. Returns the
    /// number of deliveries.
    pub fn broadcast(&mut self, channel: &str, data: &Value, sender: Option<&str>) -> usize {
        let Some(subscribers) = self.channels.get_mut(channel) else {
            tracing::trace!(channel, "broadcast on empty channel");
            return 0;
        };
        let meta = ChannelMeta { channel, sender };
        let mut delivered = 0;
        for subscriber in subscribers
            .iter_mut()
            .filter(|s| s.role == ChannelRole::Receive && Some(s.id.as_str()) != sender)
        {
            if let Some(callback) = subscriber.callback.as_mut() {
                callback(data, &meta);
                delivered += 1;
            }
        }
        delivered
    }

    /// Ids subscribed to `channel` with `role`, in subscription order.
    pub fn subscribers(&self, channel: &str, role: ChannelRole) -> Vec<&str> {
        self.channels
            .get(channel)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|s| s.role == role)
                    .map(|s| s.id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// Names of all live channels.
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    fn insert(&mut self, channel: &str, id: &str, role: ChannelRole, callback: Option<ChannelCallback>) {
        let subscribers = self.channels.entry_ref(channel).or_default();
        let subscriber = Subscriber {
            id: id.to_owned(),
            role,
            callback,
        };
        match subscribers.iter_mut().find(|s| s.id == id) {
            Some(existing) => *existing = subscriber,
            None => subscribers.push(subscriber),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter(hits: &Arc<AtomicUsize>) -> ChannelCallback {
        let hits = hits.clone();
        Box::new(move |_, _| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn broadcast_reaches_each_receiver_once() {
        let mut registry = ChannelRegistry::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        registry.subscribe_with("bus", "a", ChannelRole::Receive, counter(&a));
        registry.subscribe_with("bus", "b", ChannelRole::Receive, counter(&b));
        assert_eq!(registry.broadcast("bus", &Value::Bang, None), 2);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_channel_is_a_no_op() {
        let mut registry = ChannelRegistry::new();
        assert_eq!(registry.broadcast("nobody", &Value::Bang, Some("x")), 0);
    }

    #[test]
    fn senders_never_receive() {
        let mut registry = ChannelRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.subscribe_with("bus", "tx", ChannelRole::Send, counter(&hits));
        registry.subscribe_with("bus", "rx", ChannelRole::Receive, counter(&hits));
        assert_eq!(registry.broadcast("bus", &Value::Bang, Some("rx")), 0);
        assert_eq!(registry.broadcast("bus", &Value::Bang, Some("tx")), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn broadcast_skips_only_the_sender() {
        let mut registry = ChannelRegistry::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        registry.subscribe_with("bus", "a", ChannelRole::Receive, counter(&a));
        registry.subscribe_with("bus", "b", ChannelRole::Receive, counter(&b));

        assert_eq!(registry.broadcast("bus", &Value::Int(1), Some("a")), 1);
        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(b.load(Ordering::SeqCst), 1);

        // An outside sender reaches everyone
        assert_eq!(registry.broadcast("bus", &Value::Int(2), Some("elsewhere")), 2);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn last_unsubscribe_drops_channel() {
        let mut registry = ChannelRegistry::new();
        registry.subscribe("audio", "s", ChannelRole::Send);
        registry.subscribe("audio", "r", ChannelRole::Receive);
        assert_eq!(registry.subscribers("audio", ChannelRole::Receive), vec!["r"]);
        assert!(registry.unsubscribe("audio", "s"));
        assert!(!registry.unsubscribe("audio", "s"));
        registry.unsubscribe_all("r");
        assert!(!registry.contains("audio"));
    }

    #[test]
    fn resubscribing_replaces_role() {
        let mut registry = ChannelRegistry::new();
        registry.subscribe("c", "n", ChannelRole::Send);
        registry.subscribe("c", "n", ChannelRole::Receive);
        assert!(registry.subscribers("c", ChannelRole::Send).is_empty());
        assert_eq!(registry.subscribers("c", ChannelRole::Receive), vec!["n"]);
    }
}
