//! Message routing core
//!
//! Discrete messages travel along edges from a node's outlet to the inlets
//! downstream of it, or through a named channel. Routing never calls into
//! objects itself: it turns one `send` into an ordered list of [`Envelope`]s
//! and the caller delivers them depth-first, so delivery stays synchronous
//! and in edge-list order.
//!
//! Channel subscriptions are callbacks that push envelopes onto the router's
//! delivery queue; a channel send broadcasts and then drains that queue.

use crossbeam_channel::{Receiver, Sender};
use hashbrown::HashMap;

use crate::channel::{ChannelMeta, ChannelRegistry, ChannelRole};
use crate::handle::Edge;
use crate::object::spec::ObjectSpec;
use crate::value::Value;

/// Where a `send` goes.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum SendTarget {
    /// Every edge leaving outlet 0
    #[default]
    Default,
    /// Every edge leaving this outlet
    Outlet(usize),
    /// Every receiver subscribed to this channel
    Channel(String),
}

/// What the receiving object learns about a message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageMeta {
    /// Sending node, if the message came from one
    pub source: Option<String>,
    /// Sending outlet
    pub outlet: Option<usize>,
    pub inlet: usize,
    /// Inlet name from the receiver's port descriptors
    pub inlet_name: Option<&'static str>,
    pub hot: bool,
    /// Channel the message arrived on
    pub channel: Option<String>,
}

/// A message addressed to one node inlet.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub target: String,
    pub data: Value,
    pub meta: MessageMeta,
}

#[derive(Clone, Debug)]
struct Route {
    source: String,
    outlet: usize,
    target: String,
    inlet: usize,
}

pub struct MessageRouter {
    routes: Vec<Route>,
    specs: HashMap<String, &'static ObjectSpec>,
    channels: ChannelRegistry,
    queue_tx: Sender<Envelope>,
    queue_rx: Receiver<Envelope>,
    max_depth: usize,
}

impl MessageRouter {
    pub fn new(max_depth: usize) -> Self {
        let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
        Self {
            routes: Vec::new(),
            specs: HashMap::new(),
            channels: ChannelRegistry::new(),
            queue_tx,
            queue_rx,
            max_depth,
        }
    }

    /// Nesting limit for re-entrant delivery.
    #[inline]
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Make a node addressable; its descriptors name its inlets.
    pub fn register(&mut self, node_id: &str, spec: &'static ObjectSpec) {
        self.specs.insert(node_id.to_owned(), spec);
    }

    /// Forget a node and every channel subscription it holds.
    pub fn unregister(&mut self, node_id: &str) {
        self.specs.remove(node_id);
        self.channels.unsubscribe_all(node_id);
    }

    /// Replace the routing table with the given edge list.
    pub fn update_edges(&mut self, edges: &[Edge]) {
        self.routes = edges
            .iter()
            .map(|edge| Route {
                source: edge.source.clone(),
                outlet: edge.source_port(),
                target: edge.target.clone(),
                inlet: edge.target_port(),
            })
            .collect();
    }

    /// Subscribe a node to a channel. Receivers get channel messages on
    /// inlet 0.
    pub fn subscribe(&mut self, channel: &str, node_id: &str, role: ChannelRole) {
        if role == ChannelRole::Send {
            self.channels.subscribe(channel, node_id, role);
            return;
        }
        let queue = self.queue_tx.clone();
        let target = node_id.to_owned();
        let (inlet_name, hot) = self.resolve(node_id, 0);
        self.channels.subscribe_with(
            channel,
            node_id,
            role,
            Box::new(move |data: &Value, meta: &ChannelMeta<'_>| {
                let _ = queue.send(Envelope {
                    target: target.clone(),
                    data: data.clone(),
                    meta: MessageMeta {
                        source: meta.sender.map(str::to_owned),
                        outlet: None,
                        inlet: 0,
                        inlet_name,
                        hot,
                        channel: Some(meta.channel.to_owned()),
                    },
                });
            }),
        );
    }

    pub fn unsubscribe(&mut self, channel: &str, node_id: &str) {
        self.channels.unsubscribe(channel, node_id);
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Expand one `send` from `from` into envelopes, in delivery order.
    /// Sends that reach nobody produce nothing.
    pub fn route(&mut self, from: &str, target: &SendTarget, data: Value) -> Vec<Envelope> {
        let outlet = match target {
            SendTarget::Default => 0,
            SendTarget::Outlet(outlet) => *outlet,
            SendTarget::Channel(channel) => {
                self.channels.broadcast(channel, &data, Some(from));
                return self.queue_rx.try_iter().collect();
            }
        };
        self.routes
            .iter()
            .filter(|route| route.source == from && route.outlet == outlet)
            .map(|route| {
                let (inlet_name, hot) = self.resolve(&route.target, route.inlet);
                Envelope {
                    target: route.target.clone(),
                    data: data.clone(),
                    meta: MessageMeta {
                        source: Some(from.to_owned()),
                        outlet: Some(outlet),
                        inlet: route.inlet,
                        inlet_name,
                        hot,
                        channel: None,
                    },
                }
            })
            .collect()
    }

    /// An envelope for a message injected from outside the patch.
    pub fn envelope(&self, target: &str, inlet: usize, data: Value) -> Envelope {
        let (inlet_name, hot) = self.resolve(target, inlet);
        Envelope {
            target: target.to_owned(),
            data,
            meta: MessageMeta {
                inlet,
                inlet_name,
                hot,
                ..MessageMeta::default()
            },
        }
    }

    /// Nodes directly downstream of `node`, in edge order.
    pub fn targets_of<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.routes
            .iter()
            .filter(move |route| route.source == node)
            .map(|route| route.target.as_str())
    }

    fn resolve(&self, node: &str, inlet: usize) -> (Option<&'static str>, bool) {
        match self.specs.get(node) {
            Some(spec) => spec.resolve_inlet(inlet),
            None => (None, inlet == 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::spec::{PortKind, PortSpec};

    static ADD: ObjectSpec = ObjectSpec {
        type_name: "+",
        group: None,
        inlets: &[
            PortSpec::new("left", PortKind::Float).hot(),
            PortSpec::new("right", PortKind::Float),
        ],
        outlets: &[PortSpec::new("sum", PortKind::Float)],
    };

    fn router(edges: &[Edge]) -> MessageRouter {
        let mut router = MessageRouter::new(16);
        for id in ["a", "b", "c"] {
            router.register(id, &ADD);
        }
        router.update_edges(edges);
        router
    }

    #[test]
    fn default_send_uses_outlet_zero_in_edge_order() {
        let mut router = router(&[
            Edge::new("a", "c").with_inlet(1),
            Edge::new("a", "b").with_outlet(1),
            Edge::new("a", "b"),
        ]);
        let envelopes = router.route("a", &SendTarget::Default, Value::Int(1));
        let targets: Vec<_> = envelopes.iter().map(|e| (e.target.as_str(), e.meta.inlet)).collect();
        assert_eq!(targets, [("c", 1), ("b", 0)]);
        assert_eq!(envelopes[0].meta.inlet_name, Some("right"));
        assert!(!envelopes[0].meta.hot);
        assert!(envelopes[1].meta.hot);
    }

    #[test]
    fn numbered_outlet_restricts_delivery() {
        let mut router = router(&[Edge::new("a", "b").with_outlet(1), Edge::new("a", "c")]);
        let envelopes = router.route("a", &SendTarget::Outlet(1), Value::Bang);
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].target, "b");
        assert_eq!(envelopes[0].meta.outlet, Some(1));
    }

    #[test]
    fn targets_follow_edge_order() {
        let router = router(&[Edge::new("a", "c"), Edge::new("b", "a"), Edge::new("a", "b")]);
        let node = String::from("a");
        let targets: Vec<&str> = router.targets_of(&node).collect();
        assert_eq!(targets, ["c", "b"]);
        assert_eq!(router.targets_of("c").count(), 0);
    }

    #[test]
    fn channel_send_skips_edges() {
        let mut router = router(&[Edge::new("a", "b")]);
        router.subscribe("bus", "c", ChannelRole::Receive);
        router.subscribe("bus", "a", ChannelRole::Send);
        let envelopes = router.route("a", &SendTarget::Channel("bus".into()), Value::Int(7));
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].target, "c");
        assert_eq!(envelopes[0].meta.channel.as_deref(), Some("bus"));
        assert_eq!(envelopes[0].meta.source.as_deref(), Some("a"));
    }

    #[test]
    fn unrouted_sends_are_dropped() {
        let mut router = router(&[]);
        assert!(router.route("a", &SendTarget::Default, Value::Bang).is_empty());
        assert!(router
            .route("a", &SendTarget::Channel("void".into()), Value::Bang)
            .is_empty());
    }

    #[test]
    fn unregister_drops_subscriptions() {
        let mut router = router(&[]);
        router.subscribe("bus", "c", ChannelRole::Receive);
        router.unregister("c");
        assert!(!router.channels().contains("bus"));
    }
}
