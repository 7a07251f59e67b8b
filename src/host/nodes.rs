//! Native node primitives
//!
//! Nodes are organized by role, like the patch groups that drive them:
//! - sources: `Oscillator`, `ConstantSource`
//! - processors: `Gain`, `Analyser`, `Bridge`
//! - sinks: `Destination`
//!
//! All of them are mono and render one 64-frame quantum per call.

use dasp_graph::{Buffer, Input};
use rtrb::Producer;

use crate::bridge::RealtimeBridge;
use crate::host::analyser::Analyser;
use crate::host::param::AudioParam;

/// Information available during a render quantum.
#[derive(Clone, Copy, Debug)]
pub struct ProcessContext {
    /// Sample rate of the graph in Hz
    pub sample_rate: u32,
    /// Frames per quantum
    pub buffer_size: usize,
    /// Transport time of the first frame, in seconds
    pub current_time: f64,
}

/// Oscillator waveform.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Waveform {
    #[default]
    Sine,
    Square,
    Sawtooth,
    Triangle,
}

impl Waveform {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "sine" => Some(Waveform::Sine),
            "square" => Some(Waveform::Square),
            "sawtooth" | "saw" => Some(Waveform::Sawtooth),
            "triangle" | "tri" => Some(Waveform::Triangle),
            _ => None,
        }
    }

    #[inline]
    fn sample(self, phase: f32) -> f32 {
        match self {
            Waveform::Sine => (phase * core::f32::consts::TAU).sin(),
            Waveform::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Waveform::Sawtooth => 2.0 * phase - 1.0,
            Waveform::Triangle => 1.0 - 4.0 * (phase - 0.5).abs(),
        }
    }
}

/// Periodic waveform generator.
pub struct Oscillator {
    pub waveform: Waveform,
    pub frequency: AudioParam,
    pub detune: AudioParam,
    phase: f32,
    scratch_freq: Buffer,
    scratch_detune: Buffer,
}

impl Oscillator {
    pub fn new(frequency: f32, waveform: Waveform) -> Self {
        Self {
            waveform,
            frequency: AudioParam::new("frequency", frequency).with_range(-24_000.0, 24_000.0),
            detune: AudioParam::new("detune", 0.0),
            phase: 0.0,
            scratch_freq: Buffer::SILENT,
            scratch_detune: Buffer::SILENT,
        }
    }

    fn process(&mut self, ctx: &ProcessContext, outputs: &mut [Buffer]) {
        let Some(out) = outputs.first_mut() else {
            return;
        };
        self.frequency
            .fill_block(ctx.current_time, ctx.sample_rate, &mut self.scratch_freq);
        self.detune
            .fill_block(ctx.current_time, ctx.sample_rate, &mut self.scratch_detune);

        let sr = ctx.sample_rate as f32;
        for ((sample, &freq), &cents) in out
            .iter_mut()
            .zip(self.scratch_freq.iter())
            .zip(self.scratch_detune.iter())
        {
            *sample = self.waveform.sample(self.phase);
            let hz = freq * (cents / 1200.0).exp2();
            self.phase = (self.phase + hz / sr).rem_euclid(1.0);
        }
    }
}

/// Amplitude scaling of the summed inputs.
pub struct Gain {
    pub gain: AudioParam,
    scratch: Buffer,
}

impl Gain {
    pub fn new(gain: f32) -> Self {
        Self {
            gain: AudioParam::new("gain", gain),
            scratch: Buffer::SILENT,
        }
    }

    fn process(&mut self, ctx: &ProcessContext, inputs: &[Input], outputs: &mut [Buffer]) {
        let Some(out) = outputs.first_mut() else {
            return;
        };
        sum_inputs(inputs, out);
        self.gain
            .fill_block(ctx.current_time, ctx.sample_rate, &mut self.scratch);
        for (sample, &g) in out.iter_mut().zip(self.scratch.iter()) {
            *sample *= g;
        }
    }
}

/// Constant signal; the building block for envelopes and control signals.
pub struct ConstantSource {
    pub offset: AudioParam,
}

impl ConstantSource {
    pub fn new(offset: f32) -> Self {
        Self {
            offset: AudioParam::new("offset", offset),
        }
    }

    fn process(&mut self, ctx: &ProcessContext, outputs: &mut [Buffer]) {
        if let Some(out) = outputs.first_mut() {
            self.offset
                .fill_block(ctx.current_time, ctx.sample_rate, out);
        }
    }
}

/// Final mix of the graph, optionally forwarded to an output device ring.
pub struct Destination {
    device: Option<Producer<f32>>,
    channels: usize,
    dropped_blocks: u64,
}

impl Destination {
    pub fn new() -> Self {
        Self {
            device: None,
            channels: 1,
            dropped_blocks: 0,
        }
    }

    /// Push every rendered quantum, interleaved to `channels`, into `producer`.
    pub fn with_device(producer: Producer<f32>, channels: usize) -> Self {
        Self {
            device: Some(producer),
            channels: channels.max(1),
            dropped_blocks: 0,
        }
    }

    /// Quanta skipped because the device ring was full.
    pub fn dropped_blocks(&self) -> u64 {
        self.dropped_blocks
    }

    fn process(&mut self, inputs: &[Input], outputs: &mut [Buffer]) {
        let Some(out) = outputs.first_mut() else {
            return;
        };
        sum_inputs(inputs, out);

        let Some(device) = self.device.as_mut() else {
            return;
        };
        // Skip the whole block rather than write part of it
        if device.slots() < out.len() * self.channels {
            self.dropped_blocks += 1;
            return;
        }
        for &sample in out.iter() {
            for _ in 0..self.channels {
                let _ = device.push(sample);
            }
        }
    }
}

impl Default for Destination {
    fn default() -> Self {
        Self::new()
    }
}

/// Real-time end of a [`crate::bridge`]: mixes inputs into the capture ring
/// and plays whatever the engine has rendered.
pub struct BridgeNode {
    bridge: RealtimeBridge,
    scratch: Buffer,
}

impl BridgeNode {
    pub fn new(bridge: RealtimeBridge) -> Self {
        Self {
            bridge,
            scratch: Buffer::SILENT,
        }
    }

    fn process(&mut self, inputs: &[Input], outputs: &mut [Buffer]) {
        let Some(out) = outputs.first_mut() else {
            return;
        };
        let input = if inputs.is_empty() {
            None
        } else {
            sum_inputs(inputs, &mut self.scratch);
            Some(&self.scratch[..])
        };
        self.bridge.process(input, out);
    }
}

/// Every native node kind the host can render.
pub enum HostNode {
    Oscillator(Oscillator),
    Gain(Gain),
    ConstantSource(ConstantSource),
    Analyser(Analyser),
    Destination(Destination),
    Bridge(BridgeNode),
}

impl HostNode {
    pub fn process(&mut self, ctx: &ProcessContext, inputs: &[Input], outputs: &mut [Buffer]) {
        match self {
            HostNode::Oscillator(n) => n.process(ctx, outputs),
            HostNode::Gain(n) => n.process(ctx, inputs, outputs),
            HostNode::ConstantSource(n) => n.process(ctx, outputs),
            HostNode::Analyser(n) => {
                if let Some(out) = outputs.first_mut() {
                    sum_inputs(inputs, out);
                    n.capture(out);
                }
            }
            HostNode::Destination(n) => n.process(inputs, outputs),
            HostNode::Bridge(n) => n.process(inputs, outputs),
        }
    }

    /// Whether signal connections may target this node.
    pub fn accepts_input(&self) -> bool {
        !matches!(self, HostNode::Oscillator(_) | HostNode::ConstantSource(_))
    }

    pub fn param(&self, name: &str) -> Option<&AudioParam> {
        match (self, name) {
            (HostNode::Oscillator(n), "frequency") => Some(&n.frequency),
            (HostNode::Oscillator(n), "detune") => Some(&n.detune),
            (HostNode::Gain(n), "gain") => Some(&n.gain),
            (HostNode::ConstantSource(n), "offset") => Some(&n.offset),
            _ => None,
        }
    }

    pub fn param_mut(&mut self, name: &str) -> Option<&mut AudioParam> {
        match (self, name) {
            (HostNode::Oscillator(n), "frequency") => Some(&mut n.frequency),
            (HostNode::Oscillator(n), "detune") => Some(&mut n.detune),
            (HostNode::Gain(n), "gain") => Some(&mut n.gain),
            (HostNode::ConstantSource(n), "offset") => Some(&mut n.offset),
            _ => None,
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            HostNode::Oscillator(_) => "oscillator",
            HostNode::Gain(_) => "gain",
            HostNode::ConstantSource(_) => "constant",
            HostNode::Analyser(_) => "analyser",
            HostNode::Destination(_) => "destination",
            HostNode::Bridge(_) => "bridge",
        }
    }
}

macro_rules! impl_from_node {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(impl From<$ty> for HostNode {
            fn from(node: $ty) -> Self {
                HostNode::$variant(node)
            }
        })*
    };
}

impl_from_node! {
    Oscillator => Oscillator,
    Gain => Gain,
    ConstantSource => ConstantSource,
    Analyser => Analyser,
    Destination => Destination,
    Bridge => BridgeNode,
}

/// Sum every input channel into `out`, or silence when there are none.
fn sum_inputs(inputs: &[Input], out: &mut Buffer) {
    out.iter_mut().for_each(|s| *s = 0.0);
    for input in inputs {
        for buffer in input.buffers() {
            for (o, &i) in out.iter_mut().zip(buffer.iter()) {
                *o += i;
            }
        }
    }
}
