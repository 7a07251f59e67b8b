//! `engine~`: an embedded synthesis engine behind the real-time bridge.
//!
//! The engine renders on its own worker thread, or inline before every
//! quantum when `bridge.engine_mode` is `inline` (offline rendering).
//! Incoming audio lands on an internal input bus that feeds the bridge's capture ring, so the node's
//! input and output are different host nodes.

use std::time::Duration;

use dasp_graph::Buffer;

use crate::audio::NodeGroup;
use crate::bridge::{bridge, BridgeControl, BridgeEvent, BridgeEvents, BridgeParts, EngineDriver, SynthEngine};
use crate::error::PatchError;
use crate::host::nodes::{BridgeNode, Gain};
use crate::host::HostNodeId;
use crate::object::{ObjectContext, ObjectRegistry, ObjectSpec, PatchObject, PortKind, PortSpec};
use crate::routing::MessageMeta;
use crate::value::Value;

use super::number;

pub(crate) fn register(registry: &mut ObjectRegistry) {
    registry.register(&ENGINE, || Box::<Engine>::default());
}

static ENGINE: ObjectSpec = ObjectSpec {
    type_name: "engine~",
    group: Some(NodeGroup::Processors),
    inlets: &[
        PortSpec::new("in", PortKind::Signal),
        PortSpec::new("command", PortKind::Message).hot(),
    ],
    outlets: &[
        PortSpec::new("out", PortKind::Signal),
        PortSpec::new("status", PortKind::Message),
    ],
};

const STATUS_OUTLET: usize = 1;

/// `engine~ [frequency]`
///
/// `pause`, `resume` and `restart` drive the bridge; any other message is
/// forwarded to the engine.
#[derive(Default)]
pub struct Engine {
    input: Option<HostNodeId>,
    output: Option<HostNodeId>,
    control: Option<BridgeControl>,
    events: Option<BridgeEvents>,
    driver: Option<EngineDriver>,
}

impl PatchObject for Engine {
    fn create(&mut self, cx: &mut ObjectContext<'_>, params: &[Value]) -> Result<(), PatchError> {
        let sample_rate = cx.host().sample_rate();
        let BridgeParts {
            realtime,
            producer,
            control,
            events,
        } = bridge(Buffer::LEN, &cx.config().bridge);

        self.control = Some(control);
        self.events = Some(events);

        let engine = ToneEngine::new(number(params, 0).unwrap_or(220.0) as f32, sample_rate);
        let poll = Duration::from_secs_f64(Buffer::LEN as f64 / f64::from(sample_rate));
        let driver = EngineDriver::start(cx.config().bridge.engine_mode, producer, Box::new(engine), poll)
            .map_err(|err| PatchError::create(cx.node_id(), format!("engine thread: {err}")))?;
        self.driver = Some(driver);

        let input = cx.add_host(Gain::new(1.0));
        let output = cx.add_host(BridgeNode::new(realtime));
        self.input = Some(input);
        self.output = Some(output);
        cx.host_mut().connect(input, output)
    }

    fn on_message(&mut self, cx: &mut ObjectContext<'_>, data: Value, _meta: &MessageMeta) {
        let Some(control) = &self.control else {
            return;
        };
        match data.as_str() {
            Some("pause") => control.pause(),
            Some("resume") => control.resume(),
            Some("restart") => {
                tracing::info!(node = cx.node_id(), "engine restarted");
                control.restart();
            }
            _ => {
                if let Some(driver) = self.driver.as_mut() {
                    driver.send(data);
                }
            }
        }
    }

    fn tick(&mut self, cx: &mut ObjectContext<'_>) {
        let Some(events) = self.events.as_mut() else {
            return;
        };
        let drained: Vec<BridgeEvent> = events.drain().collect();
        for event in drained {
            let status = match event {
                BridgeEvent::PerformanceEnded => {
                    tracing::error!(node = cx.node_id(), "engine stopped after sustained underrun");
                    "ended"
                }
                BridgeEvent::Paused => {
                    tracing::info!(node = cx.node_id(), "engine paused");
                    "paused"
                }
                BridgeEvent::Resumed => {
                    tracing::info!(node = cx.node_id(), "engine resumed");
                    "resumed"
                }
            };
            cx.send_to(STATUS_OUTLET, Value::from(status));
        }
    }

    fn destroy(&mut self, cx: &mut ObjectContext<'_>) {
        if let Some(control) = self.control.take() {
            control.invalidate();
        }
        // Joins the worker thread, if there is one
        self.driver = None;
        self.events = None;
        let nodes = self.host_nodes();
        cx.remove_host(&nodes);
        self.input = None;
        self.output = None;
    }

    fn before_quantum(&mut self) {
        if let Some(driver) = self.driver.as_mut() {
            driver.before_quantum();
        }
    }

    fn audio_output(&self) -> Option<HostNodeId> {
        self.output
    }

    fn audio_input(&self) -> Option<HostNodeId> {
        self.input
    }
}

/// A sine voice mixed with whatever audio comes in. Numeric commands set
/// its frequency.
pub struct ToneEngine {
    frequency: f32,
    sample_rate: f32,
    phase: f32,
    level: f32,
}

impl ToneEngine {
    pub fn new(frequency: f32, sample_rate: u32) -> Self {
        Self {
            frequency,
            sample_rate: sample_rate as f32,
            phase: 0.0,
            level: 0.2,
        }
    }
}

impl SynthEngine for ToneEngine {
    fn render(&mut self, input: &[f32], output: &mut [f32]) {
        let step = self.frequency / self.sample_rate;
        for (out, &inp) in output.iter_mut().zip(input) {
            *out = inp + self.level * (self.phase * core::f32::consts::TAU).sin();
            self.phase = (self.phase + step).rem_euclid(1.0);
        }
    }

    fn handle(&mut self, command: &Value) {
        match command.as_f64() {
            Some(hz) if hz.is_finite() => self.frequency = hz as f32,
            _ => tracing::debug!(?command, "engine ignored command"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::audio::AudioService;
    use crate::config::RuntimeConfig;
    use crate::handle::Edge;
    use crate::object::Effect;
    use crate::routing::SendTarget;

    fn service() -> AudioService {
        AudioService::new(Arc::new(ObjectRegistry::with_builtins()), RuntimeConfig::default())
    }

    fn statuses(audio: &mut AudioService) -> Vec<Value> {
        audio
            .take_effects()
            .into_iter()
            .filter_map(|effect| match effect {
                Effect::Send {
                    target: SendTarget::Outlet(STATUS_OUTLET),
                    data,
                    ..
                } => Some(data),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn input_bus_differs_from_output() {
        let mut audio = service();
        audio.create_node("osc", "osc~", &[]);
        audio.create_node("eng", "engine~", &[]);
        let (input, output) = (audio.input_of("eng").unwrap(), audio.output_of("eng").unwrap());
        assert_ne!(input, output);

        audio.update_edges(&[Edge::new("osc", "eng")]);
        let osc = audio.output_of("osc").unwrap();
        let conns = audio.connections();
        assert!(conns.iter().any(|c| c.from == osc && c.to == input));
        assert!(conns.iter().any(|c| c.from == input && c.to == output));
    }

    #[test]
    fn pause_is_reported_on_status_outlet() {
        let mut audio = service();
        audio.create_node("eng", "engine~", &[]);
        audio.dispatch("eng", Value::from("pause"), &MessageMeta::default());
        audio.render_quantum();
        audio.tick();
        assert_eq!(statuses(&mut audio), [Value::from("paused")]);

        audio.dispatch("eng", Value::from("resume"), &MessageMeta::default());
        audio.render_quantum();
        audio.tick();
        assert_eq!(statuses(&mut audio), [Value::from("resumed")]);
    }

    #[test]
    fn remove_releases_host_nodes() {
        let mut audio = service();
        audio.create_node("eng", "engine~", &[]);
        let (input, output) = (audio.input_of("eng").unwrap(), audio.output_of("eng").unwrap());
        audio.remove_node("eng");
        assert!(!audio.host().contains(input));
        assert!(!audio.host().contains(output));
    }

    #[test]
    fn tone_engine_follows_frequency_commands() {
        let mut engine = ToneEngine::new(0.0, 48_000);
        let mut out = [1.0; 4];
        engine.render(&[0.25; 4], &mut out);
        assert!(out.iter().all(|&s| s == 0.25));

        engine.handle(&Value::Float(12_000.0));
        engine.render(&[0.0; 4], &mut out);
        assert!(out[1] > 0.19);
    }

    #[test]
    fn inline_engine_survives_a_fast_offline_render() {
        let mut config = RuntimeConfig::default();
        config.bridge.engine_mode = crate::config::EngineMode::Inline;
        let mut audio = AudioService::new(Arc::new(ObjectRegistry::with_builtins()), config);
        audio.create_node("eng", "engine~", &[Value::Float(440.0)]);
        audio.create_node("dac", "dac~", &[]);
        audio.update_edges(&[Edge::new("eng", "dac")]);

        let mut peak = 0.0_f32;
        for _ in 0..500 {
            peak = audio.render_quantum().iter().fold(peak, |m, s| m.max(s.abs()));
        }
        audio.tick();
        assert!(statuses(&mut audio).is_empty());
        assert!((peak - 0.2).abs() < 0.01, "peak {peak}");
    }
}
