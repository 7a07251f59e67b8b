//! Audio node registry
//!
//! Owns every live audio object and the native connections between them.
//! The edge list is the only source of truth for wiring: [`AudioService::update_edges`]
//! tears every connection down and replays the list from scratch, so calling
//! it twice with the same edges leaves the same graph behind.
//!
//! The patch-facing calls (`create_node`, `connect`, `update_edges`) never
//! fail: problems are logged and the offending step is skipped. The `try_*`
//! variants return the underlying [`PatchError`].

use std::sync::Arc;

use hashbrown::HashMap;
use itertools::Itertools;

use crate::channel::{ChannelRegistry, ChannelRole};
use crate::config::RuntimeConfig;
use crate::error::PatchError;
use crate::handle::Edge;
use crate::host::analyser::Analyser;
use crate::host::nodes::Gain;
use crate::host::param::AudioParam;
use crate::host::{AudioContext, Connection, HostNodeId, ParamRef};
use crate::object::{Effect, ObjectContext, ObjectRegistry, ObjectSpec, PatchObject, PortKind};
use crate::routing::MessageMeta;
use crate::scheduler::TimeScheduler;
use crate::value::Value;

/// Role of an audio node in the signal chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeGroup {
    /// Generators (oscillators, envelopes, inputs)
    Sources,
    /// Effects and analysers
    Processors,
    /// Outputs; never a connection source
    Destinations,
}

impl NodeGroup {
    pub const ALL: [NodeGroup; 3] = [NodeGroup::Sources, NodeGroup::Processors, NodeGroup::Destinations];
}

/// Whether a plain signal connection from `source` to `target` is allowed.
///
/// Destinations never feed anything and nothing feeds a source, except
/// processors feeding processors or destinations and sources feeding either.
pub fn validate_group_connection(source: NodeGroup, target: NodeGroup) -> bool {
    !matches!(
        (source, target),
        (NodeGroup::Destinations, _)
            | (NodeGroup::Sources, NodeGroup::Sources)
            | (NodeGroup::Processors, NodeGroup::Sources)
    )
}

/// What `create_node` hands back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeHandle {
    pub id: String,
    pub type_name: &'static str,
    pub group: NodeGroup,
    /// Native output, if the object has one
    pub output: Option<HostNodeId>,
    /// False when the object failed to initialise
    pub ready: bool,
}

struct AudioNode {
    spec: &'static ObjectSpec,
    group: NodeGroup,
    object: Box<dyn PatchObject>,
    ready: bool,
}

/// Shared state lent to objects through [`ObjectContext`].
pub(crate) struct ServiceEnv {
    pub(crate) host: AudioContext,
    pub(crate) scheduler: TimeScheduler,
    pub(crate) config: RuntimeConfig,
    pub(crate) audio_channels: ChannelRegistry,
    pub(crate) effects: Vec<Effect>,
}

impl ServiceEnv {
    pub(crate) fn context<'a>(&'a mut self, node_id: &'a str) -> ObjectContext<'a> {
        ObjectContext {
            node_id,
            host: &mut self.host,
            scheduler: &self.scheduler,
            config: &self.config,
            audio_channels: &mut self.audio_channels,
            effects: &mut self.effects,
        }
    }
}

pub struct AudioService {
    registry: Arc<ObjectRegistry>,
    nodes: HashMap<String, AudioNode>,
    /// Creation order, which is also replay order
    order: Vec<String>,
    /// Shared output bus every destination feeds
    bus: HostNodeId,
    env: ServiceEnv,
}

impl AudioService {
    pub fn new(registry: Arc<ObjectRegistry>, config: RuntimeConfig) -> Self {
        let host = AudioContext::new(config.sample_rate);
        Self::with_context(registry, config, host)
    }

    /// Drive an existing host, e.g. one already bound to an output device.
    pub fn with_context(registry: Arc<ObjectRegistry>, config: RuntimeConfig, mut host: AudioContext) -> Self {
        let bus = host.add(Gain::new(1.0));
        if let Err(err) = host.connect(bus, host.destination()) {
            tracing::error!(%err, "failed to connect output bus");
        }
        let scheduler = TimeScheduler::new(host.clock().clone());
        Self {
            registry,
            nodes: HashMap::new(),
            order: Vec::new(),
            bus,
            env: ServiceEnv {
                host,
                scheduler,
                config,
                audio_channels: ChannelRegistry::new(),
                effects: Vec::new(),
            },
        }
    }

    /// Create and register an audio object. Returns `None` (and logs) for
    /// unknown or non-audio types.
    pub fn create_node(&mut self, node_id: &str, type_name: &str, params: &[Value]) -> Option<NodeHandle> {
        match self.try_create_node(node_id, type_name, params) {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(node = node_id, type_name, %err, "audio node not created");
                None
            }
        }
    }

    /// Like [`AudioService::create_node`], returning the error.
    ///
    /// An object whose own initialisation fails is still registered, in a
    /// not-ready state, so that edges naming it resolve and no-op.
    pub fn try_create_node(
        &mut self,
        node_id: &str,
        type_name: &str,
        params: &[Value],
    ) -> Result<NodeHandle, PatchError> {
        if self.nodes.contains_key(node_id) {
            return Err(PatchError::DuplicateNode(node_id.to_owned()));
        }
        let (spec, mut object) = self
            .registry
            .instantiate(type_name)
            .ok_or_else(|| PatchError::UnknownType(type_name.to_owned()))?;
        let group = spec
            .group
            .ok_or_else(|| PatchError::UnknownType(type_name.to_owned()))?;

        let ready = match object.create(&mut self.env.context(node_id), params) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(node = node_id, type_name, %err, "audio node failed to initialise");
                object.destroy(&mut self.env.context(node_id));
                false
            }
        };
        let handle = NodeHandle {
            id: node_id.to_owned(),
            type_name: spec.type_name,
            group,
            output: object.audio_output(),
            ready,
        };
        self.nodes.insert(
            node_id.to_owned(),
            AudioNode {
                spec,
                group,
                object,
                ready,
            },
        );
        self.order.push(node_id.to_owned());
        tracing::debug!(node = node_id, type_name, ?group, ready, "audio node created");
        Ok(handle)
    }

    /// Tear a node down and forget it. Unknown ids are ignored.
    pub fn remove_node(&mut self, node_id: &str) {
        let Some(mut node) = self.nodes.remove(node_id) else {
            tracing::trace!(node = node_id, "remove of unknown audio node");
            return;
        };
        self.order.retain(|id| id != node_id);
        node.object.destroy(&mut self.env.context(node_id));
        self.env.audio_channels.unsubscribe_all(node_id);
        tracing::debug!(node = node_id, "audio node removed");
    }

    #[inline]
    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn group(&self, node_id: &str) -> Option<NodeGroup> {
        self.nodes.get(node_id).map(|node| node.group)
    }

    pub fn spec(&self, node_id: &str) -> Option<&'static ObjectSpec> {
        self.nodes.get(node_id).map(|node| node.spec)
    }

    pub fn is_ready(&self, node_id: &str) -> bool {
        self.nodes.get(node_id).is_some_and(|node| node.ready)
    }

    /// Node ids in creation order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn output_of(&self, node_id: &str) -> Option<HostNodeId> {
        self.nodes.get(node_id)?.object.audio_output()
    }

    pub fn input_of(&self, node_id: &str) -> Option<HostNodeId> {
        self.nodes.get(node_id)?.object.audio_input()
    }

    /// Wire `source` into `target`, or into its parameter `param`. Failures
    /// are logged and ignored.
    pub fn connect(&mut self, source: &str, target: &str, param: Option<&str>) {
        if let Err(err) = self.try_connect(source, target, param) {
            tracing::warn!(source, target, param, %err, "connection skipped");
        }
    }

    pub fn try_connect(&mut self, source: &str, target: &str, param: Option<&str>) -> Result<(), PatchError> {
        let src = self
            .nodes
            .get(source)
            .ok_or_else(|| PatchError::UnknownNode(source.to_owned()))?;
        let tgt = self
            .nodes
            .get(target)
            .ok_or_else(|| PatchError::UnknownNode(target.to_owned()))?;

        // Parameter modulation is legal from any group
        if let Some(name) = param {
            let param = tgt
                .object
                .audio_param(name)
                .ok_or_else(|| PatchError::unknown_param(target, name))?;
            let output = src
                .object
                .audio_output()
                .ok_or_else(|| PatchError::NoAudioOutput(source.to_owned()))?;
            return self.env.host.connect_param(output, param);
        }

        if !validate_group_connection(src.group, tgt.group) {
            return Err(PatchError::IncompatibleGroups {
                source_id: source.to_owned(),
                source_group: src.group,
                target_id: target.to_owned(),
                target_group: tgt.group,
            });
        }
        let input = tgt
            .object
            .audio_input()
            .ok_or_else(|| PatchError::NoAudioInput(target.to_owned()))?;
        let Some(src) = self.nodes.get_mut(source) else {
            return Err(PatchError::UnknownNode(source.to_owned()));
        };
        src.object.connect_to(&mut self.env.context(source), input)
    }

    /// Replay the full edge list.
    ///
    /// Every audio output is disconnected, the output bus is reconnected
    /// first, then each edge is resolved against its target inlet (parameter
    /// binding or plain signal) and connected in list order. Audio channels
    /// are wired last.
    pub fn update_edges(&mut self, edges: &[Edge]) {
        for id in &self.order {
            if let Some(node) = self.nodes.get_mut(id) {
                node.object.disconnect(&mut self.env.context(id));
            }
        }
        if let Err(err) = self.env.host.disconnect(self.bus) {
            tracing::debug!(%err, "output bus was not connected");
        }
        let destination = self.env.host.destination();
        if let Err(err) = self.env.host.connect(self.bus, destination) {
            tracing::error!(%err, "failed to reconnect output bus");
        }
        for id in &self.order {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            if node.group != NodeGroup::Destinations {
                continue;
            }
            if let Some(output) = node.object.audio_output() {
                if let Err(err) = self.env.host.connect(output, self.bus) {
                    tracing::warn!(node = %id, %err, "destination not connected to output bus");
                }
            }
        }

        for edge in edges {
            if let Some(param) = self.resolve_edge(edge) {
                self.connect(&edge.source, &edge.target, param);
            }
        }

        self.wire_audio_channels();
        tracing::debug!(
            edges = edges.len(),
            connections = self.env.host.connections().len(),
            "audio edges replayed"
        );
    }

    /// `None` when the edge carries no audio, otherwise the parameter it
    /// binds to (`Some(None)` for a plain signal input).
    fn resolve_edge(&self, edge: &Edge) -> Option<Option<&'static str>> {
        let source = self.nodes.get(&edge.source)?;
        let target = self.nodes.get(&edge.target)?;
        let outlet = source.spec.outlet(edge.source_port())?;
        if outlet.kind != PortKind::Signal {
            return None;
        }
        let inlet = target.spec.inlet(edge.target_port())?;
        match (inlet.param, inlet.kind) {
            (Some(param), _) => Some(Some(param)),
            (None, PortKind::Signal) => Some(None),
            _ => {
                tracing::debug!(
                    source = %edge.source,
                    target = %edge.target,
                    inlet = inlet.name,
                    "signal edge into a message inlet ignored"
                );
                None
            }
        }
    }

    fn wire_audio_channels(&mut self) {
        let channels = &self.env.audio_channels;
        let pairs: Vec<(String, String)> = channels
            .channels()
            .sorted()
            .flat_map(|channel| {
                let senders = channels.subscribers(channel, ChannelRole::Send);
                let receivers = channels.subscribers(channel, ChannelRole::Receive);
                senders
                    .into_iter()
                    .cartesian_product(receivers)
                    .map(|(s, r)| (s.to_owned(), r.to_owned()))
                    .collect::<Vec<_>>()
            })
            .collect();

        for (sender, receiver) in pairs {
            let (Some(output), Some(input)) = (self.output_of(&sender), self.input_of(&receiver)) else {
                continue;
            };
            if let Err(err) = self.env.host.connect(output, input) {
                tracing::warn!(%sender, %receiver, %err, "audio channel not wired");
            }
        }
    }

    /// Parameter `name` exposed by `node_id`.
    pub fn get_audio_param(&self, node_id: &str, name: &str) -> Option<ParamRef> {
        self.nodes.get(node_id)?.object.audio_param(name)
    }

    /// Resolved parameter state, for inspection.
    pub fn param(&self, node_id: &str, name: &str) -> Option<&AudioParam> {
        let param = self.get_audio_param(node_id, name)?;
        self.env.host.param(param).ok()
    }

    /// Deliver a message to an audio object. Returns false for unknown ids.
    pub fn dispatch(&mut self, node_id: &str, data: Value, meta: &MessageMeta) -> bool {
        let Some(node) = self.nodes.get_mut(node_id) else {
            return false;
        };
        node.object.on_message(&mut self.env.context(node_id), data, meta);
        true
    }

    /// Run every object's housekeeping.
    pub fn tick(&mut self) {
        for id in &self.order {
            if let Some(node) = self.nodes.get_mut(id) {
                node.object.tick(&mut self.env.context(id));
            }
        }
    }

    pub fn analyser(&self, node_id: &str) -> Option<&Analyser> {
        self.env.host.analyser(self.output_of(node_id)?)
    }

    pub fn analyser_mut(&mut self, node_id: &str) -> Option<&mut Analyser> {
        let output = self.output_of(node_id)?;
        self.env.host.analyser_mut(output)
    }

    /// Native connections currently in place.
    pub fn connections(&self) -> Vec<Connection> {
        self.env.host.connections()
    }

    /// The shared output bus.
    #[inline]
    pub fn bus(&self) -> HostNodeId {
        self.bus
    }

    pub fn host(&self) -> &AudioContext {
        &self.env.host
    }

    pub fn host_mut(&mut self) -> &mut AudioContext {
        &mut self.env.host
    }

    pub fn scheduler(&self) -> &TimeScheduler {
        &self.env.scheduler
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.env.config
    }

    pub fn render_quantum(&mut self) -> &[f32] {
        for node in self.nodes.values_mut() {
            node.object.before_quantum();
        }
        self.env.host.render_quantum()
    }

    /// Effects queued by objects since the last call.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.env.effects)
    }

    pub(crate) fn env_mut(&mut self) -> &mut ServiceEnv {
        &mut self.env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AudioService {
        AudioService::new(Arc::new(ObjectRegistry::with_builtins()), RuntimeConfig::default())
    }

    #[test]
    fn group_table() {
        use NodeGroup::*;
        assert!(validate_group_connection(Sources, Processors));
        assert!(validate_group_connection(Sources, Destinations));
        assert!(validate_group_connection(Processors, Processors));
        assert!(validate_group_connection(Processors, Destinations));
        assert!(!validate_group_connection(Sources, Sources));
        assert!(!validate_group_connection(Processors, Sources));
        for target in NodeGroup::ALL {
            assert!(!validate_group_connection(Destinations, target));
        }
    }

    #[test]
    fn unknown_types_return_none() {
        let mut audio = service();
        assert!(audio.create_node("x", "nonexistent~", &[]).is_none());
        assert!(audio.create_node("y", "+", &[]).is_none());
        assert!(!audio.contains("x"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut audio = service();
        assert!(audio.create_node("osc", "osc~", &[]).is_some());
        assert_eq!(
            audio.try_create_node("osc", "osc~", &[]),
            Err(PatchError::DuplicateNode("osc".into()))
        );
    }

    #[test]
    fn remove_is_idempotent() {
        let mut audio = service();
        let handle = audio.create_node("osc", "osc~", &[Value::Float(220.0)]).unwrap();
        let output = handle.output.unwrap();
        audio.remove_node("osc");
        audio.remove_node("osc");
        assert!(!audio.contains("osc"));
        assert!(!audio.host().contains(output));
    }

    #[test]
    fn incompatible_groups_are_skipped() {
        let mut audio = service();
        audio.create_node("a", "osc~", &[]);
        audio.create_node("b", "osc~", &[]);
        assert!(matches!(
            audio.try_connect("a", "b", None),
            Err(PatchError::IncompatibleGroups { .. })
        ));
        audio.connect("a", "b", None);
        assert_eq!(audio.connections().len(), 1); // bus -> destination only
    }

    #[test]
    fn param_connections_bypass_groups() {
        let mut audio = service();
        audio.create_node("lfo", "osc~", &[Value::Float(2.0)]);
        audio.create_node("osc", "osc~", &[]);
        audio.try_connect("lfo", "osc", Some("frequency")).unwrap();
        assert!(audio
            .connections()
            .iter()
            .any(|c| c.param == Some("frequency")));
        assert!(audio.try_connect("lfo", "osc", Some("cutoff")).is_err());
    }

    #[test]
    fn missing_nodes_are_reported() {
        let mut audio = service();
        audio.create_node("osc", "osc~", &[]);
        assert_eq!(
            audio.try_connect("osc", "ghost", None),
            Err(PatchError::UnknownNode("ghost".into()))
        );
    }

    #[test]
    fn get_audio_param_dispatches_by_type() {
        let mut audio = service();
        audio.create_node("osc", "osc~", &[Value::Float(330.0)]);
        audio.create_node("amp", "gain~", &[Value::Null, Value::Float(0.25)]);
        assert!(audio.get_audio_param("osc", "frequency").is_some());
        assert!(audio.get_audio_param("osc", "gain").is_none());
        assert_eq!(audio.param("amp", "gain").map(|p| p.value_at(0.0)), Some(0.25));
        assert!(audio.get_audio_param("nobody", "gain").is_none());
    }

    #[test]
    fn replay_connects_chain_through_bus() {
        let mut audio = service();
        audio.create_node("osc", "osc~", &[Value::Float(440.0), Value::from("sine")]);
        audio.create_node("amp", "gain~", &[Value::Null, Value::Float(0.5)]);
        audio.create_node("dac", "dac~", &[]);
        audio.update_edges(&[Edge::new("osc", "amp"), Edge::new("amp", "dac")]);

        let osc = audio.output_of("osc").unwrap();
        let amp = audio.output_of("amp").unwrap();
        let dac = audio.output_of("dac").unwrap();
        let conns = audio.connections();
        let has = |from, to| conns.iter().any(|c| c.from == from && c.to == to && c.param.is_none());
        assert!(has(osc, amp));
        assert!(has(amp, dac));
        assert!(has(dac, audio.bus()));
        assert!(has(audio.bus(), audio.host().destination()));
    }

    #[test]
    fn replay_keeps_a_single_bus_link() {
        let mut audio = service();
        audio.create_node("dac", "dac~", &[]);
        for _ in 0..3 {
            audio.update_edges(&[]);
        }
        let bus = audio.bus();
        let destination = audio.host().destination();
        let links = audio
            .connections()
            .into_iter()
            .filter(|c| c.from == bus && c.to == destination)
            .count();
        assert_eq!(links, 1);
    }
}
