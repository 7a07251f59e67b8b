//! The patch: every service wired together.
//!
//! [`Patch`] is the one place that owns the audio service, the message
//! router and the analysis subsystem, and carries out the [`Effect`]s
//! objects queue. Audio objects live in the audio service; message-only
//! objects live here, but both receive messages the same way.
//!
//! Message delivery is synchronous and depth-first: a `send` is expanded
//! into envelopes in edge order and each one is delivered, along with
//! everything it triggers, before the next. Nesting deeper than
//! `max_message_depth` is treated as a cycle and cut.

use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::analysis::{AnalysisPayload, Domain, FftAnalysis, Precision, Samples};
use crate::audio::AudioService;
use crate::config::{ConfigError, RuntimeConfig};
use crate::handle::Edge;
use crate::host::AudioContext;
use crate::object::{Effect, ObjectRegistry, ObjectSpec, PatchObject};
use crate::routing::{Envelope, MessageRouter, SendTarget};
use crate::value::Value;

/// One node as the editor describes it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeDesc {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
}

/// A whole patch: nodes and the edges between them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchDocument {
    pub nodes: Vec<NodeDesc>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl PatchDocument {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

struct TextNode {
    spec: &'static ObjectSpec,
    object: Box<dyn PatchObject>,
}

type AnalysisSink = Box<dyn FnMut(&AnalysisPayload<'_>)>;
type DeliveryTap = Box<dyn FnMut(&Envelope)>;

pub struct Patch {
    registry: Arc<ObjectRegistry>,
    audio: AudioService,
    router: MessageRouter,
    analysis: FftAnalysis,
    objects: HashMap<String, TextNode>,
    /// Message-only nodes in creation order
    order: Vec<String>,
    edges: Vec<Edge>,
    analysis_sink: Option<AnalysisSink>,
    tap: Option<DeliveryTap>,
    depth: usize,
}

impl Patch {
    /// A patch with the built-in object types.
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_registry(Arc::new(ObjectRegistry::with_builtins()), config)
    }

    pub fn with_registry(registry: Arc<ObjectRegistry>, config: RuntimeConfig) -> Self {
        let host = AudioContext::new(config.sample_rate);
        Self::with_context(registry, config, host)
    }

    /// Like [`Patch::new`], but rejects a configuration that fails
    /// [`RuntimeConfig::validate`].
    pub fn try_new(config: RuntimeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(config))
    }

    /// Like [`Patch::with_context`], with the configuration validated first.
    pub fn try_with_context(
        registry: Arc<ObjectRegistry>,
        config: RuntimeConfig,
        host: AudioContext,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_context(registry, config, host))
    }

    /// Drive an existing host, e.g. one bound to an output device.
    pub fn with_context(registry: Arc<ObjectRegistry>, config: RuntimeConfig, host: AudioContext) -> Self {
        let router = MessageRouter::new(config.max_message_depth);
        let analysis = FftAnalysis::new(config.analyzer_type.clone(), config.analysis.clone());
        Self {
            audio: AudioService::with_context(registry.clone(), config, host),
            registry,
            router,
            analysis,
            objects: HashMap::new(),
            order: Vec::new(),
            edges: Vec::new(),
            analysis_sink: None,
            tap: None,
            depth: 0,
        }
    }

    /// Create every node of `document`, then apply its edges.
    pub fn load(&mut self, document: &PatchDocument) {
        for node in &document.nodes {
            let params: Vec<Value> = node.params.iter().cloned().map(Value::from).collect();
            self.add_node(&node.id, &node.type_name, &params);
        }
        self.update_edges(&document.edges);
    }

    /// Create a node of any registered type. Returns false (and logs) when
    /// the id is taken or the type is unknown.
    pub fn add_node(&mut self, node_id: &str, type_name: &str, params: &[Value]) -> bool {
        if self.contains(node_id) {
            tracing::warn!(node = node_id, "node id already in use");
            return false;
        }
        let Some(spec) = self.registry.spec(type_name) else {
            tracing::warn!(node = node_id, type_name, "unknown object type");
            return false;
        };

        if spec.is_audio() {
            if self.audio.create_node(node_id, type_name, params).is_none() {
                return false;
            }
        } else {
            let Some((spec, mut object)) = self.registry.instantiate(type_name) else {
                return false;
            };
            let mut cx = self.audio.env_mut().context(node_id);
            if let Err(err) = object.create(&mut cx, params) {
                tracing::error!(node = node_id, type_name, %err, "object failed to initialise");
                object.destroy(&mut cx);
            }
            self.objects.insert(node_id.to_owned(), TextNode { spec, object });
            self.order.push(node_id.to_owned());
        }

        self.router.register(node_id, spec);
        self.analysis.register_node(node_id, type_name);
        self.run_effects();
        tracing::debug!(node = node_id, type_name, "node added");
        true
    }

    /// Destroy a node. Unknown ids are ignored.
    pub fn remove_node(&mut self, node_id: &str) {
        if self.audio.contains(node_id) {
            self.audio.remove_node(node_id);
        } else if let Some(mut node) = self.objects.remove(node_id) {
            self.order.retain(|id| id != node_id);
            node.object.destroy(&mut self.audio.env_mut().context(node_id));
        } else {
            return;
        }
        self.run_effects();
        self.router.unregister(node_id);
        self.analysis.unregister_node(node_id);
        self.edges
            .retain(|edge| edge.source != node_id && edge.target != node_id);
        self.router.update_edges(&self.edges);
        self.analysis.update_edges(&self.edges);
    }

    /// Replace the edge list everywhere.
    pub fn update_edges(&mut self, edges: &[Edge]) {
        self.edges = edges.to_vec();
        self.audio.update_edges(edges);
        self.router.update_edges(edges);
        self.analysis.update_edges(edges);
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.audio.contains(node_id) || self.objects.contains_key(node_id)
    }

    pub fn spec(&self, node_id: &str) -> Option<&'static ObjectSpec> {
        self.audio
            .spec(node_id)
            .or_else(|| self.objects.get(node_id).map(|node| node.spec))
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Send `data` as if `from` had sent it.
    pub fn send(&mut self, from: &str, target: SendTarget, data: Value) {
        for envelope in self.router.route(from, &target, data) {
            self.dispatch(envelope);
        }
    }

    /// Inject `data` into one inlet of `node_id` from outside the patch.
    pub fn deliver(&mut self, node_id: &str, inlet: usize, data: Value) {
        let envelope = self.router.envelope(node_id, inlet, data);
        self.dispatch(envelope);
    }

    fn dispatch(&mut self, envelope: Envelope) {
        if self.depth >= self.router.max_depth() {
            tracing::warn!(
                target_node = %envelope.target,
                source = ?envelope.meta.source,
                depth = self.depth,
                "message cycle cut"
            );
            return;
        }
        let Envelope { target, data, meta } = envelope;
        let data = match self.spec(&target).and_then(|spec| spec.inlet(meta.inlet)) {
            Some(port) => match port.coerce(data) {
                Ok(data) => data,
                Err(err) => {
                    tracing::debug!(node = %target, %err, "message dropped");
                    return;
                }
            },
            None => data,
        };
        if let Some(tap) = self.tap.as_mut() {
            tap(&Envelope {
                target: target.clone(),
                data: data.clone(),
                meta: meta.clone(),
            });
        }

        self.depth += 1;
        if !self.audio.dispatch(&target, data.clone(), &meta) {
            match self.objects.get_mut(&target) {
                Some(node) => {
                    node.object
                        .on_message(&mut self.audio.env_mut().context(&target), data, &meta);
                }
                None => tracing::trace!(node = %target, "message to unknown node dropped"),
            }
        }
        self.run_effects();
        self.depth -= 1;
    }

    fn run_effects(&mut self) {
        for effect in self.audio.take_effects() {
            match effect {
                Effect::Send { from, target, data } => self.send(&from, target, data),
                Effect::Subscribe { node, channel, role } => self.router.subscribe(&channel, &node, role),
                Effect::Unsubscribe { node, channel } => self.router.unsubscribe(&channel, &node),
                Effect::RequestAnalysis {
                    consumer,
                    domain,
                    precision,
                } => self.analysis.request(&consumer, domain, precision),
                Effect::AnalysisInletMeta { consumer, meta } => self.analysis.set_inlet_meta(&consumer, meta),
                Effect::DisableAnalysis { consumer } => self.analysis.disable(&consumer),
            }
        }
    }

    /// Render one quantum of audio.
    pub fn render_quantum(&mut self) -> &[f32] {
        self.audio.render_quantum()
    }

    /// Periodic work off the audio path: poll analysis if due, deliver the
    /// snapshots, then run every object's housekeeping.
    pub fn tick(&mut self, now: Instant) {
        let mut deliveries = Vec::new();
        let sink = &mut self.analysis_sink;
        self.analysis.poll(now, &mut self.audio, |payload| {
            if let Some(sink) = sink.as_mut() {
                sink(payload);
            }
            let data = match payload.samples {
                Samples::Float(samples) => Value::Floats(samples.to_vec()),
                Samples::Int(samples) => Value::Bytes(samples.to_vec()),
            };
            let inlet = payload.inlet_meta.map_or(0, |meta| meta.inlet);
            deliveries.push((payload.consumer_id.to_owned(), inlet, data));
        });
        for (consumer, inlet, data) in deliveries {
            if self.contains(&consumer) {
                self.deliver(&consumer, inlet, data);
            }
        }

        self.audio.tick();
        for id in &self.order {
            if let Some(node) = self.objects.get_mut(id) {
                node.object.tick(&mut self.audio.env_mut().context(id));
            }
        }
        self.run_effects();
    }

    /// Receive every analysis payload, e.g. to forward it to a renderer.
    pub fn set_analysis_sink(&mut self, sink: impl FnMut(&AnalysisPayload<'_>) + 'static) {
        self.analysis_sink = Some(Box::new(sink));
    }

    /// Observe every message right before it is delivered.
    pub fn set_delivery_tap(&mut self, tap: impl FnMut(&Envelope) + 'static) {
        self.tap = Some(Box::new(tap));
    }

    /// Request snapshots for a consumer outside the patch.
    pub fn request_analysis(&mut self, consumer: &str, domain: Domain, precision: Precision) {
        self.analysis.request(consumer, domain, precision);
    }

    pub fn disable_analysis(&mut self, consumer: &str) {
        self.analysis.disable(consumer);
    }

    /// The analyser currently feeding `consumer`.
    pub fn analyzer_of(&mut self, consumer: &str) -> Option<String> {
        self.analysis.get_analyzer_audio_node(consumer)
    }

    pub fn set_analyzer(&mut self, consumer: &str, analyser: Option<&str>) {
        self.analysis.set_analyzer(consumer, analyser);
    }

    pub fn set_focused(&mut self, focused: bool) {
        self.analysis.set_focused(focused);
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.analysis.set_visible(visible);
    }

    /// Current transport time in seconds.
    pub fn now(&self) -> f64 {
        self.audio.scheduler().now()
    }

    pub fn audio(&self) -> &AudioService {
        &self.audio
    }

    pub fn audio_mut(&mut self) -> &mut AudioService {
        &mut self.audio
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn analysis(&self) -> &FftAnalysis {
        &self.analysis
    }

    /// Destroy every node, newest first.
    pub fn shutdown(&mut self) {
        let ids: Vec<String> = self
            .audio
            .node_ids()
            .map(str::to_owned)
            .chain(self.order.iter().cloned())
            .collect();
        for id in ids.iter().rev() {
            self.remove_node(id);
        }
        tracing::debug!(nodes = ids.len(), "patch shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    type Seen = Rc<RefCell<Vec<(String, Value)>>>;

    fn patch(config: RuntimeConfig) -> (Patch, Seen) {
        let mut patch = Patch::new(config);
        let seen: Seen = Rc::default();
        let log = seen.clone();
        patch.set_delivery_tap(move |envelope| {
            log.borrow_mut()
                .push((envelope.target.clone(), envelope.data.clone()));
        });
        (patch, seen)
    }

    fn arrivals(seen: &Seen, node: &str) -> Vec<Value> {
        seen.borrow()
            .iter()
            .filter(|(target, _)| target == node)
            .map(|(_, data)| data.clone())
            .collect()
    }

    #[test]
    fn messages_flow_depth_first_in_edge_order() {
        let (mut patch, seen) = patch(RuntimeConfig::default());
        patch.add_node("t", "trigger", &[Value::from("b"), Value::from("f")]);
        patch.add_node("left", "+", &[]);
        patch.add_node("right", "+", &[Value::Int(1)]);
        patch.add_node("sink", "+", &[]);
        patch.update_edges(&[
            Edge::new("t", "left"),
            Edge::new("t", "right").with_outlet(1),
            Edge::new("right", "sink"),
        ]);
        patch.deliver("t", 0, Value::Int(4));

        let order: Vec<String> = seen.borrow().iter().map(|(t, _)| t.clone()).collect();
        assert_eq!(order, ["t", "right", "sink", "left"]);
        assert_eq!(arrivals(&seen, "sink"), [Value::Float(5.0)]);
    }

    #[test]
    fn cold_inlet_does_not_propagate() {
        let (mut patch, seen) = patch(RuntimeConfig::default());
        patch.add_node("add", "+", &[]);
        patch.add_node("sink", "+", &[]);
        patch.update_edges(&[Edge::new("add", "sink")]);
        patch.deliver("add", 1, Value::Int(3));
        assert!(arrivals(&seen, "sink").is_empty());
        patch.deliver("add", 0, Value::Int(2));
        assert_eq!(arrivals(&seen, "sink"), [Value::Float(5.0)]);
    }

    #[test]
    fn cycles_are_cut_at_the_depth_limit() {
        let config = RuntimeConfig {
            max_message_depth: 8,
            ..RuntimeConfig::default()
        };
        let (mut patch, seen) = patch(config);
        patch.add_node("a", "+", &[Value::Int(1)]);
        patch.add_node("b", "+", &[Value::Int(1)]);
        patch.update_edges(&[Edge::new("a", "b"), Edge::new("b", "a")]);
        patch.deliver("a", 0, Value::Int(0));
        assert_eq!(seen.borrow().len(), 8);
    }

    #[test]
    fn channel_messages_reach_each_receiver_once() {
        let (mut patch, seen) = patch(RuntimeConfig::default());
        patch.add_node("tx", "send", &[Value::from("bus")]);
        patch.add_node("rx1", "receive", &[Value::from("bus")]);
        patch.add_node("rx2", "receive", &[Value::from("bus")]);
        patch.add_node("other", "receive", &[Value::from("elsewhere")]);
        patch.deliver("tx", 0, Value::Int(9));
        assert_eq!(arrivals(&seen, "rx1"), [Value::Int(9)]);
        assert_eq!(arrivals(&seen, "rx2"), [Value::Int(9)]);
        assert!(arrivals(&seen, "other").is_empty());

        patch.remove_node("rx1");
        patch.deliver("tx", 0, Value::Int(10));
        assert_eq!(arrivals(&seen, "rx1"), [Value::Int(9)]);
    }

    #[test]
    fn invalid_inlet_values_are_dropped() {
        let (mut patch, seen) = patch(RuntimeConfig::default());
        patch.add_node("osc", "osc~", &[]);
        patch.deliver("osc", 1, Value::from("noise"));
        assert!(seen.borrow().is_empty());
        patch.deliver("osc", 0, Value::Float(50_000.0));
        assert_eq!(
            patch.audio().param("osc", "frequency").map(|p| p.value_at(0.0)),
            Some(20_000.0)
        );
    }

    #[test]
    fn unknown_types_and_duplicate_ids_are_rejected() {
        let (mut patch, _) = patch(RuntimeConfig::default());
        assert!(!patch.add_node("x", "nope", &[]));
        assert!(patch.add_node("x", "+", &[]));
        assert!(!patch.add_node("x", "osc~", &[]));
    }

    #[test]
    fn spectrum_reports_oscillator_frequency() {
        let (mut patch, seen) = patch(RuntimeConfig::default());
        patch.add_node("osc", "osc~", &[Value::Float(1000.0)]);
        patch.add_node("fft", "fft~", &[]);
        patch.add_node("spec", "spectrum", &[]);
        patch.add_node("out", "+", &[]);
        patch.update_edges(&[
            Edge::new("osc", "fft"),
            Edge::new("fft", "spec"),
            Edge::new("spec", "out"),
        ]);
        for _ in 0..64 {
            patch.render_quantum();
        }
        patch.tick(Instant::now());

        let peaks = arrivals(&seen, "out");
        let [Value::Float(hz)] = peaks.as_slice() else {
            panic!("expected one peak, got {peaks:?}");
        };
        assert!((hz - 1000.0).abs() < 50.0, "peak at {hz} Hz");

        patch.remove_node("spec");
        assert!(!patch.analysis().is_polling());
    }

    #[test]
    fn load_reads_a_json_document() {
        let document = PatchDocument::from_json(
            r#"{
                "nodes": [
                    { "id": "osc", "type": "osc~", "params": [220, "square"] },
                    { "id": "dac", "type": "dac~" }
                ],
                "edges": [ { "source": "osc", "target": "dac", "targetHandle": "inlet-0" } ]
            }"#,
        )
        .unwrap();
        let (mut patch, _) = patch(RuntimeConfig::default());
        patch.load(&document);
        assert!(patch.contains("osc") && patch.contains("dac"));
        let peak = (0..8)
            .map(|_| patch.render_quantum().iter().fold(0.0_f32, |m, s| m.max(s.abs())))
            .fold(0.0, f32::max);
        assert!(peak > 0.5);
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let config = RuntimeConfig {
            analysis: crate::config::AnalysisConfig {
                focused_poll_hz: 0.0,
                ..Default::default()
            },
            ..RuntimeConfig::default()
        };
        assert!(matches!(Patch::try_new(config), Err(ConfigError::Invalid { .. })));
        assert!(Patch::try_new(RuntimeConfig::default()).is_ok());
    }

    #[test]
    fn shutdown_removes_everything() {
        let (mut patch, _) = patch(RuntimeConfig::default());
        patch.add_node("osc", "osc~", &[]);
        patch.add_node("spec", "spectrum", &[]);
        patch.shutdown();
        assert!(!patch.contains("osc"));
        assert!(!patch.contains("spec"));
        assert!(!patch.analysis().is_polling());
    }
}
