//! Audio objects backed by host primitives.

use crate::audio::NodeGroup;
use crate::channel::ChannelRole;
use crate::error::PatchError;
use crate::host::analyser::{Analyser, DEFAULT_FFT_SIZE, MAX_FFT_SIZE, MIN_FFT_SIZE};
use crate::host::nodes::{ConstantSource, Gain, HostNode, Oscillator, Waveform};
use crate::host::{HostNodeId, ParamRef};
use crate::object::{write_keyed_param, ObjectContext, ObjectRegistry, ObjectSpec, PatchObject, PortKind, PortSpec};
use crate::routing::MessageMeta;
use crate::value::{EnvelopeValues, Phase, ScheduledMessage, Value};

use super::{number, text};

pub(crate) fn register(registry: &mut ObjectRegistry) {
    registry.register(&OSC, || Box::<Osc>::default());
    registry.register(&GAIN, || Box::<GainObject>::default());
    registry.register(&DAC, || Box::<Dac>::default());
    registry.register(&FFT, || Box::<Fft>::default());
    registry.register(&ADSR, || Box::<Adsr>::default());
    registry.register(&SEND_AUDIO, || Box::new(AudioChannel::new(ChannelRole::Send)));
    registry.register(&RECEIVE_AUDIO, || Box::new(AudioChannel::new(ChannelRole::Receive)));
}

const SIGNAL_IN: PortSpec = PortSpec::new("in", PortKind::Signal);
const SIGNAL_OUT: PortSpec = PortSpec::new("out", PortKind::Signal);

/// Resolve `name` against the parameters a host node exposes.
fn host_param(node: Option<HostNodeId>, name: &str, known: &[&'static str]) -> Option<ParamRef> {
    let node = node?;
    known
        .iter()
        .find(|known| **known == name)
        .map(|&name| ParamRef { node, name })
}

static OSC: ObjectSpec = ObjectSpec {
    type_name: "osc~",
    group: Some(NodeGroup::Sources),
    inlets: &[
        PortSpec::new("frequency", PortKind::Float)
            .hot()
            .param("frequency")
            .default_value(440.0)
            .range(0.0, 20_000.0),
        PortSpec::new("type", PortKind::String)
            .hot()
            .options(&["sine", "square", "sawtooth", "triangle"]),
        PortSpec::new("detune", PortKind::Float).param("detune"),
    ],
    outlets: &[SIGNAL_OUT],
};

/// `osc~ [frequency, type]`
#[derive(Default)]
pub struct Osc {
    node: Option<HostNodeId>,
}

impl PatchObject for Osc {
    fn create(&mut self, cx: &mut ObjectContext<'_>, params: &[Value]) -> Result<(), PatchError> {
        let frequency = number(params, 0).unwrap_or(440.0).clamp(0.0, 20_000.0) as f32;
        let waveform = match text(params, 1) {
            Some(name) => Waveform::parse(name)
                .ok_or_else(|| PatchError::create(cx.node_id(), format!("unknown waveform '{name}'")))?,
            None => Waveform::default(),
        };
        self.node = Some(cx.add_host(Oscillator::new(frequency, waveform)));
        Ok(())
    }

    fn set(&mut self, cx: &mut ObjectContext<'_>, key: &str, data: Value) {
        if key != "type" {
            write_keyed_param(cx, self.audio_param(key), key, &data);
            return;
        }
        let Some(waveform) = data.as_str().and_then(Waveform::parse) else {
            tracing::warn!(node = cx.node_id(), ?data, "unknown waveform");
            return;
        };
        if let Some(node) = self.node {
            if let Some(HostNode::Oscillator(osc)) = cx.host_mut().node_mut(node) {
                osc.waveform = waveform;
            }
        }
    }

    fn audio_output(&self) -> Option<HostNodeId> {
        self.node
    }

    fn audio_param(&self, name: &str) -> Option<ParamRef> {
        host_param(self.node, name, &["frequency", "detune"])
    }
}

static GAIN: ObjectSpec = ObjectSpec {
    type_name: "gain~",
    group: Some(NodeGroup::Processors),
    inlets: &[
        SIGNAL_IN,
        PortSpec::new("gain", PortKind::Float).hot().param("gain").default_value(1.0),
    ],
    outlets: &[SIGNAL_OUT],
};

/// `gain~ [_, gain]`
#[derive(Default)]
pub struct GainObject {
    node: Option<HostNodeId>,
}

impl PatchObject for GainObject {
    fn create(&mut self, cx: &mut ObjectContext<'_>, params: &[Value]) -> Result<(), PatchError> {
        let gain = number(params, 1).unwrap_or(1.0) as f32;
        self.node = Some(cx.add_host(Gain::new(gain)));
        Ok(())
    }

    fn audio_output(&self) -> Option<HostNodeId> {
        self.node
    }

    fn audio_param(&self, name: &str) -> Option<ParamRef> {
        host_param(self.node, name, &["gain"])
    }
}

static DAC: ObjectSpec = ObjectSpec {
    type_name: "dac~",
    group: Some(NodeGroup::Destinations),
    inlets: &[SIGNAL_IN],
    outlets: &[],
};

/// `dac~`: feeds the shared output bus.
#[derive(Default)]
pub struct Dac {
    node: Option<HostNodeId>,
}

impl PatchObject for Dac {
    fn create(&mut self, cx: &mut ObjectContext<'_>, _params: &[Value]) -> Result<(), PatchError> {
        self.node = Some(cx.add_host(Gain::new(1.0)));
        Ok(())
    }

    fn audio_output(&self) -> Option<HostNodeId> {
        self.node
    }
}

static FFT: ObjectSpec = ObjectSpec {
    type_name: "fft~",
    group: Some(NodeGroup::Processors),
    inlets: &[
        SIGNAL_IN,
        PortSpec::new("fftSize", PortKind::Int)
            .hot()
            .default_value(DEFAULT_FFT_SIZE as f64)
            .range(MIN_FFT_SIZE as f64, MAX_FFT_SIZE as f64),
    ],
    outlets: &[PortSpec::new("analysis", PortKind::Analysis)],
};

/// `fft~ [_, fftSize]`: an analyser the analysis subsystem polls.
#[derive(Default)]
pub struct Fft {
    node: Option<HostNodeId>,
}

impl PatchObject for Fft {
    fn create(&mut self, cx: &mut ObjectContext<'_>, params: &[Value]) -> Result<(), PatchError> {
        let size = number(params, 1).map_or(DEFAULT_FFT_SIZE, |n| n as usize);
        let analyser = Analyser::new(size).map_err(|err| PatchError::create(cx.node_id(), err.to_string()))?;
        self.node = Some(cx.add_host(analyser));
        Ok(())
    }

    fn set(&mut self, cx: &mut ObjectContext<'_>, key: &str, data: Value) {
        if key != "fftSize" {
            return;
        }
        let (Some(node), Some(size)) = (self.node, data.as_f64()) else {
            return;
        };
        let node_id = cx.node_id().to_owned();
        if let Some(analyser) = cx.host_mut().analyser_mut(node) {
            if let Err(err) = analyser.set_fft_size(size as usize) {
                tracing::warn!(node = %node_id, %err, "fft size unchanged");
            }
        }
    }

    fn audio_output(&self) -> Option<HostNodeId> {
        self.node
    }
}

static ADSR: ObjectSpec = ObjectSpec {
    type_name: "adsr~",
    group: Some(NodeGroup::Sources),
    inlets: &[
        PortSpec::new("trigger", PortKind::Message).hot(),
        PortSpec::new("attack", PortKind::Float).default_value(10.0).range(0.0, 60_000.0),
        PortSpec::new("decay", PortKind::Float).default_value(100.0).range(0.0, 60_000.0),
        PortSpec::new("sustain", PortKind::Float).default_value(0.7).range(0.0, 1.0),
        PortSpec::new("release", PortKind::Float).default_value(300.0).range(0.0, 60_000.0),
    ],
    outlets: &[SIGNAL_OUT],
};

/// `adsr~ [_, attack, decay, sustain, release]`, times in milliseconds.
///
/// A bang or a positive number on the trigger inlet starts the envelope
/// (the number scales the peak), zero or `release` releases it, and a
/// scheduled message is applied to the level as is.
pub struct Adsr {
    node: Option<HostNodeId>,
    attack: f64,
    decay: f64,
    sustain: f32,
    release: f64,
}

impl Default for Adsr {
    fn default() -> Self {
        Self {
            node: None,
            attack: 0.01,
            decay: 0.1,
            sustain: 0.7,
            release: 0.3,
        }
    }
}

impl Adsr {
    fn gate(&mut self, cx: &mut ObjectContext<'_>, data: Value) {
        let message = match data {
            Value::Scheduled(message) => message,
            _ if data.as_str() == Some("release") => self.release_message(),
            _ if data.is_bang() => self.trigger_message(1.0),
            _ => match data.as_f64() {
                Some(level) if level > 0.0 => self.trigger_message(level as f32),
                Some(_) => self.release_message(),
                None => {
                    tracing::debug!(node = cx.node_id(), ?data, "ignored envelope gate");
                    return;
                }
            },
        };
        write_keyed_param(cx, self.audio_param("offset"), "trigger", &Value::Scheduled(message));
    }

    fn trigger_message(&self, peak: f32) -> ScheduledMessage {
        ScheduledMessage::Trigger {
            values: EnvelopeValues {
                start: 0.0,
                peak,
                sustain: self.sustain * peak,
            },
            attack: Phase::linear(self.attack),
            decay: Phase::linear(self.decay),
        }
    }

    fn release_message(&self) -> ScheduledMessage {
        ScheduledMessage::Release {
            end_value: 0.0,
            release: Phase::linear(self.release),
        }
    }
}

impl PatchObject for Adsr {
    fn create(&mut self, cx: &mut ObjectContext<'_>, params: &[Value]) -> Result<(), PatchError> {
        let ms = |index, default: f64| number(params, index).unwrap_or(default).max(0.0) / 1000.0;
        self.attack = ms(1, 10.0);
        self.decay = ms(2, 100.0);
        self.sustain = number(params, 3).unwrap_or(0.7).clamp(0.0, 1.0) as f32;
        self.release = ms(4, 300.0);
        self.node = Some(cx.add_host(ConstantSource::new(0.0)));
        Ok(())
    }

    fn on_message(&mut self, cx: &mut ObjectContext<'_>, data: Value, meta: &MessageMeta) {
        match meta.inlet_name {
            Some("trigger") | None => self.gate(cx, data),
            Some(name) => self.set(cx, name, data),
        }
    }

    fn set(&mut self, cx: &mut ObjectContext<'_>, key: &str, data: Value) {
        if key == "trigger" {
            self.gate(cx, data);
            return;
        }
        let Some(n) = data.as_f64() else {
            tracing::debug!(node = cx.node_id(), key, "expected a number");
            return;
        };
        match key {
            "attack" => self.attack = n / 1000.0,
            "decay" => self.decay = n / 1000.0,
            "sustain" => self.sustain = n as f32,
            "release" => self.release = n / 1000.0,
            _ => tracing::trace!(node = cx.node_id(), key, "no handler for message"),
        }
    }

    fn audio_output(&self) -> Option<HostNodeId> {
        self.node
    }

    fn audio_param(&self, name: &str) -> Option<ParamRef> {
        host_param(self.node, name, &["offset"])
    }
}

static SEND_AUDIO: ObjectSpec = ObjectSpec {
    type_name: "send~",
    group: Some(NodeGroup::Processors),
    inlets: &[SIGNAL_IN],
    outlets: &[],
};

static RECEIVE_AUDIO: ObjectSpec = ObjectSpec {
    type_name: "receive~",
    group: Some(NodeGroup::Sources),
    inlets: &[],
    outlets: &[SIGNAL_OUT],
};

/// `send~ <channel>` and `receive~ <channel>`: wireless audio, wired up
/// whenever the edges are replayed.
pub struct AudioChannel {
    role: ChannelRole,
    channel: Option<String>,
    node: Option<HostNodeId>,
}

impl AudioChannel {
    fn new(role: ChannelRole) -> Self {
        Self {
            role,
            channel: None,
            node: None,
        }
    }
}

impl PatchObject for AudioChannel {
    fn create(&mut self, cx: &mut ObjectContext<'_>, params: &[Value]) -> Result<(), PatchError> {
        let channel = text(params, 0).ok_or_else(|| PatchError::create(cx.node_id(), "missing channel name"))?;
        self.node = Some(cx.add_host(Gain::new(1.0)));
        cx.subscribe_audio(channel, self.role);
        self.channel = Some(channel.to_owned());
        Ok(())
    }

    fn destroy(&mut self, cx: &mut ObjectContext<'_>) {
        if let Some(channel) = self.channel.take() {
            cx.unsubscribe_audio(&channel);
        }
        if let Some(node) = self.node.take() {
            cx.remove_host(&[node]);
        }
    }

    fn audio_output(&self) -> Option<HostNodeId> {
        self.node
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::audio::AudioService;
    use crate::config::RuntimeConfig;
    use crate::handle::Edge;
    use crate::host::nodes::{HostNode, Waveform};
    use crate::object::ObjectRegistry;
    use crate::routing::MessageMeta;
    use crate::value::Value;

    fn service() -> AudioService {
        AudioService::new(Arc::new(ObjectRegistry::with_builtins()), RuntimeConfig::default())
    }

    fn inlet(index: usize, name: &'static str) -> MessageMeta {
        MessageMeta {
            inlet: index,
            inlet_name: Some(name),
            hot: true,
            ..MessageMeta::default()
        }
    }

    #[test]
    fn unknown_waveform_leaves_node_unready() {
        let mut audio = service();
        let before = audio.host().connections();
        let handle = audio
            .try_create_node("osc", "osc~", &[Value::Float(220.0), Value::from("noise")])
            .unwrap();
        assert!(!handle.ready);
        assert!(handle.output.is_none());
        assert_eq!(audio.host().connections(), before);
    }

    #[test]
    fn type_message_switches_waveform() {
        let mut audio = service();
        audio.create_node("osc", "osc~", &[]);
        audio.dispatch("osc", Value::from("square"), &inlet(1, "type"));
        let output = audio.output_of("osc").unwrap();
        match audio.host().node(output) {
            Some(HostNode::Oscillator(osc)) => assert_eq!(osc.waveform, Waveform::Square),
            _ => panic!("expected an oscillator"),
        }
    }

    #[test]
    fn frequency_message_sets_param() {
        let mut audio = service();
        audio.create_node("osc", "osc~", &[]);
        audio.dispatch("osc", Value::Float(880.0), &inlet(0, "frequency"));
        assert_eq!(audio.param("osc", "frequency").map(|p| p.value_at(0.0)), Some(880.0));
    }

    #[test]
    fn adsr_bang_runs_attack_and_decay() {
        let mut audio = service();
        audio.create_node("env", "adsr~", &[Value::Null, Value::Float(10.0), Value::Float(100.0), Value::Float(0.5)]);
        audio.dispatch("env", Value::Bang, &inlet(0, "trigger"));
        let level = audio.param("env", "offset").unwrap();
        assert!((level.value_at(0.01) - 1.0).abs() < 1e-4);
        assert!((level.value_at(1.0) - 0.5).abs() < 1e-4);
    }

    #[test]
    fn adsr_zero_releases_from_held_level() {
        let mut audio = service();
        audio.create_node("env", "adsr~", &[Value::Null, Value::Float(0.0), Value::Float(0.0), Value::Float(1.0), Value::Float(200.0)]);
        audio.dispatch("env", Value::Int(1), &inlet(0, "trigger"));
        audio.dispatch("env", Value::Int(0), &inlet(0, "trigger"));
        let level = audio.param("env", "offset").unwrap();
        assert!((level.value_at(0.1) - 0.5).abs() < 1e-3);
        assert_eq!(level.value_at(0.5), 0.0);
    }

    #[test]
    fn fft_size_follows_messages() {
        let mut audio = service();
        audio.create_node("fft", "fft~", &[Value::Null, Value::Int(512)]);
        assert_eq!(audio.analyser("fft").map(|a| a.fft_size()), Some(512));
        audio.dispatch("fft", Value::Int(1024), &inlet(1, "fftSize"));
        assert_eq!(audio.analyser("fft").map(|a| a.fft_size()), Some(1024));
        audio.dispatch("fft", Value::Int(1000), &inlet(1, "fftSize"));
        assert_eq!(audio.analyser("fft").map(|a| a.fft_size()), Some(1024));
    }

    #[test]
    fn audio_channels_are_wired_on_replay() {
        let mut audio = service();
        audio.create_node("tx", "send~", &[Value::from("bus")]);
        audio.create_node("rx", "receive~", &[Value::from("bus")]);
        audio.update_edges(&[]);
        let tx = audio.output_of("tx").unwrap();
        let rx = audio.output_of("rx").unwrap();
        assert!(audio.connections().iter().any(|c| c.from == tx && c.to == rx));

        audio.remove_node("rx");
        audio.update_edges(&[]);
        assert!(!audio.connections().iter().any(|c| c.from == tx));
    }

    #[test]
    fn channel_objects_need_a_name() {
        let mut audio = service();
        let handle = audio.try_create_node("tx", "send~", &[]).unwrap();
        assert!(!handle.ready);
    }

    #[test]
    fn gain_edge_into_param_inlet_binds_param() {
        let mut audio = service();
        audio.create_node("lfo", "osc~", &[Value::Float(2.0)]);
        audio.create_node("amp", "gain~", &[]);
        audio.update_edges(&[Edge::new("lfo", "amp").with_inlet(1)]);
        assert!(audio.connections().iter().any(|c| c.param == Some("gain")));
    }
}
