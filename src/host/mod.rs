//! In-process audio host
//!
//! The native audio graph the patch runtime drives:
//! - nodes live in a `StableGraph` so ids survive removals
//! - rendering goes through `dasp_graph`'s `Processor` in fixed 64-frame quanta
//! - parameter modulation wires are kept beside the graph and applied
//!   once per quantum
//! - a shared [`TransportClock`] advances after every quantum

pub mod analyser;
#[cfg(feature = "cpal_sink")]
pub mod device;
pub mod nodes;
pub mod param;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dasp_graph::{Buffer, Input, NodeData, Processor};
use itertools::Itertools;
use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use rtrb::Producer;

use crate::error::PatchError;
use analyser::Analyser;
use nodes::{Destination, HostNode, ProcessContext};
use param::AudioParam;

/// Transport time in seconds, shared between the host and the scheduler.
#[derive(Clone, Debug, Default)]
pub struct TransportClock(Arc<AtomicU64>);

impl TransportClock {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn now(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    /// Jump the transport to `seconds`. Offline rendering and tests only.
    pub fn set(&self, seconds: f64) {
        self.0.store(seconds.to_bits(), Ordering::Release);
    }

    fn advance(&self, seconds: f64) {
        self.set(self.now() + seconds);
    }
}

/// Identifier of a node inside an [`AudioContext`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct HostNodeId(pub(crate) NodeIndex);

impl fmt::Display for HostNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0.index())
    }
}

/// A named automatable parameter on a host node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ParamRef {
    pub node: HostNodeId,
    pub name: &'static str,
}

/// One native connection, as reported by [`AudioContext::connections`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Connection {
    pub from: HostNodeId,
    pub to: HostNodeId,
    /// Set for parameter modulation wires
    pub param: Option<&'static str>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Wire {
    /// Audio flows along the edge
    Signal,
    /// Only makes the processor visit the source every quantum
    Pull,
}

pub(crate) struct HostSlot {
    node: HostNode,
    sample_rate: u32,
    clock: TransportClock,
}

impl dasp_graph::Node for HostSlot {
    fn process(&mut self, inputs: &[Input], outputs: &mut [Buffer]) {
        let ctx = ProcessContext {
            sample_rate: self.sample_rate,
            buffer_size: Buffer::LEN,
            current_time: self.clock.now(),
        };
        self.node.process(&ctx, inputs, outputs);
    }
}

type HostGraph = StableGraph<NodeData<HostSlot>, Wire>;

/// Owns every native node and renders the graph one quantum at a time.
pub struct AudioContext {
    graph: HostGraph,
    processor: Processor<HostGraph>,
    sample_rate: u32,
    clock: TransportClock,
    destination: NodeIndex,
    /// Hidden node every rendered node is pulled into
    root: NodeIndex,
    param_wires: Vec<(NodeIndex, ParamRef)>,
    modulation_scratch: Vec<(ParamRef, f32)>,
}

impl AudioContext {
    pub fn new(sample_rate: u32) -> Self {
        Self::with_clock(sample_rate, TransportClock::new())
    }

    pub fn with_clock(sample_rate: u32, clock: TransportClock) -> Self {
        let mut graph = HostGraph::with_capacity(64, 64);
        let slot = |node: HostNode| HostSlot {
            node,
            sample_rate,
            clock: clock.clone(),
        };
        let destination = graph.add_node(NodeData::new1(slot(Destination::new().into())));
        let root = graph.add_node(NodeData::new1(slot(Destination::new().into())));
        graph.add_edge(destination, root, Wire::Pull);

        Self {
            graph,
            processor: Processor::with_capacity(64),
            sample_rate,
            clock,
            destination,
            root,
            param_wires: Vec::new(),
            modulation_scratch: Vec::new(),
        }
    }

    /// Forward every rendered quantum to an output device ring.
    pub fn with_output(mut self, producer: Producer<f32>, channels: usize) -> Self {
        self.graph[self.destination].node.node =
            Destination::with_device(producer, channels).into();
        self
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    pub fn current_time(&self) -> f64 {
        self.clock.now()
    }

    pub fn clock(&self) -> &TransportClock {
        &self.clock
    }

    /// The shared output node.
    #[inline]
    pub fn destination(&self) -> HostNodeId {
        HostNodeId(self.destination)
    }

    pub fn add(&mut self, node: impl Into<HostNode>) -> HostNodeId {
        let node = node.into();
        let always_rendered = matches!(node, HostNode::Analyser(_) | HostNode::Bridge(_));
        let slot = HostSlot {
            node,
            sample_rate: self.sample_rate,
            clock: self.clock.clone(),
        };
        let idx = self.graph.add_node(NodeData::new1(slot));
        if always_rendered {
            self.graph.add_edge(idx, self.root, Wire::Pull);
        }
        tracing::trace!(node = %HostNodeId(idx), kind = self.graph[idx].node.node.kind(), "host node added");
        HostNodeId(idx)
    }

    /// Remove a node with all of its connections and parameter wires.
    pub fn remove(&mut self, id: HostNodeId) -> Result<HostNode, PatchError> {
        if id.0 == self.destination || id.0 == self.root {
            return Err(PatchError::UnknownHostNode(id.0.index()));
        }
        let targets: Vec<ParamRef> = self
            .param_wires
            .iter()
            .filter(|(source, param)| *source == id.0 && param.node != id)
            .map(|(_, param)| *param)
            .collect();
        self.param_wires
            .retain(|(source, param)| *source != id.0 && param.node != id);
        for param in targets {
            self.reset_modulation(param);
        }
        self.graph
            .remove_node(id.0)
            .map(|data| data.node.node)
            .ok_or(PatchError::UnknownHostNode(id.0.index()))
    }

    #[inline]
    pub fn contains(&self, id: HostNodeId) -> bool {
        id.0 != self.root && self.graph.contains_node(id.0)
    }

    pub fn node(&self, id: HostNodeId) -> Option<&HostNode> {
        self.slot(id).map(|slot| &slot.node)
    }

    pub fn node_mut(&mut self, id: HostNodeId) -> Option<&mut HostNode> {
        if !self.contains(id) {
            return None;
        }
        self.graph.node_weight_mut(id.0).map(|data| &mut data.node.node)
    }

    /// Plain signal connection. Connecting an existing pair again is a no-op.
    pub fn connect(&mut self, from: HostNodeId, to: HostNodeId) -> Result<(), PatchError> {
        self.check(from)?;
        let target = self.slot(to).ok_or(PatchError::UnknownHostNode(to.0.index()))?;
        if !target.node.accepts_input() {
            return Err(PatchError::NotAnInput(to.0.index()));
        }
        let exists = self
            .graph
            .edges(from.0)
            .any(|edge| edge.target() == to.0 && *edge.weight() == Wire::Signal);
        if !exists {
            self.graph.add_edge(from.0, to.0, Wire::Signal);
        }
        Ok(())
    }

    /// Modulate `param` with the output of `from`.
    pub fn connect_param(&mut self, from: HostNodeId, param: ParamRef) -> Result<(), PatchError> {
        self.check(from)?;
        self.param(param)?;
        if self.param_wires.contains(&(from.0, param)) {
            return Ok(());
        }
        self.param_wires.push((from.0, param));
        if self.graph.find_edge(from.0, self.root).is_none() {
            self.graph.add_edge(from.0, self.root, Wire::Pull);
        }
        Ok(())
    }

    /// Drop every outgoing signal connection and parameter wire of `node`.
    pub fn disconnect(&mut self, node: HostNodeId) -> Result<(), PatchError> {
        self.check(node)?;
        let outgoing: Vec<_> = self
            .graph
            .edges(node.0)
            .filter(|edge| *edge.weight() == Wire::Signal)
            .map(|edge| edge.id())
            .collect();
        for edge in outgoing {
            self.graph.remove_edge(edge);
        }

        let mut released = Vec::new();
        self.param_wires.retain(|(source, param)| {
            let keep = *source != node.0;
            if !keep {
                released.push(*param);
            }
            keep
        });
        for param in released {
            self.reset_modulation(param);
        }

        let pulled = matches!(
            self.graph[node.0].node.node,
            HostNode::Analyser(_) | HostNode::Bridge(_)
        ) || node.0 == self.destination;
        if !pulled {
            if let Some(edge) = self.graph.find_edge(node.0, self.root) {
                self.graph.remove_edge(edge);
            }
        }
        Ok(())
    }

    /// Every live connection, sorted.
    pub fn connections(&self) -> Vec<Connection> {
        let signals = self
            .graph
            .edge_references()
            .filter(|edge| *edge.weight() == Wire::Signal)
            .map(|edge| Connection {
                from: HostNodeId(edge.source()),
                to: HostNodeId(edge.target()),
                param: None,
            });
        let params = self.param_wires.iter().map(|(source, param)| Connection {
            from: HostNodeId(*source),
            to: param.node,
            param: Some(param.name),
        });
        signals.chain(params).sorted().collect()
    }

    /// Resolve a parameter name on a node.
    pub fn param_ref(&self, node: HostNodeId, name: &str) -> Option<ParamRef> {
        let param = self.node(node)?.param(name)?;
        Some(ParamRef {
            node,
            name: param.name(),
        })
    }

    pub fn param(&self, param: ParamRef) -> Result<&AudioParam, PatchError> {
        self.node(param.node)
            .and_then(|node| node.param(param.name))
            .ok_or_else(|| PatchError::unknown_param(param.node.to_string(), param.name))
    }

    pub fn param_mut(&mut self, param: ParamRef) -> Result<&mut AudioParam, PatchError> {
        self.node_mut(param.node)
            .and_then(|node| node.param_mut(param.name))
            .ok_or_else(|| PatchError::unknown_param(param.node.to_string(), param.name))
    }

    pub fn analyser(&self, id: HostNodeId) -> Option<&Analyser> {
        match self.node(id)? {
            HostNode::Analyser(analyser) => Some(analyser),
            _ => None,
        }
    }

    pub fn analyser_mut(&mut self, id: HostNodeId) -> Option<&mut Analyser> {
        match self.node_mut(id)? {
            HostNode::Analyser(analyser) => Some(analyser),
            _ => None,
        }
    }

    /// Render one quantum and return the destination's output.
    pub fn render_quantum(&mut self) -> &[f32] {
        self.apply_modulation();
        self.processor.process(&mut self.graph, self.root);
        self.clock
            .advance(Buffer::LEN as f64 / self.sample_rate as f64);
        self.output()
    }

    /// The most recently rendered destination quantum.
    pub fn output(&self) -> &[f32] {
        &self.graph[self.destination].buffers[0]
    }

    /// Parameter wires are k-rate: each one contributes the mean of its
    /// source's previous quantum.
    fn apply_modulation(&mut self) {
        if self.param_wires.is_empty() {
            return;
        }
        self.modulation_scratch.clear();
        for (source, param) in &self.param_wires {
            let block = &self.graph[*source].buffers[0];
            let mean = block.iter().sum::<f32>() / Buffer::LEN as f32;
            match self.modulation_scratch.iter_mut().find(|(p, _)| p == param) {
                Some((_, sum)) => *sum += mean,
                None => self.modulation_scratch.push((*param, mean)),
            }
        }
        for (param, sum) in &self.modulation_scratch {
            if let Some(node) = self.graph.node_weight_mut(param.node.0) {
                if let Some(p) = node.node.node.param_mut(param.name) {
                    p.set_modulation(*sum);
                }
            }
        }
    }

    fn reset_modulation(&mut self, param: ParamRef) {
        if self.param_wires.iter().any(|(_, p)| *p == param) {
            return;
        }
        if let Ok(p) = self.param_mut(param) {
            p.set_modulation(0.0);
        }
    }

    fn slot(&self, id: HostNodeId) -> Option<&HostSlot> {
        if id.0 == self.root {
            return None;
        }
        self.graph.node_weight(id.0).map(|data| &data.node)
    }

    fn check(&self, id: HostNodeId) -> Result<(), PatchError> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(PatchError::UnknownHostNode(id.0.index()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::nodes::{ConstantSource, Gain, Oscillator, Waveform};
    use super::*;

    #[test]
    fn duplicate_connects_are_ignored() {
        let mut ctx = AudioContext::new(48_000);
        let osc = ctx.add(Oscillator::new(440.0, Waveform::Sine));
        let dest = ctx.destination();
        ctx.connect(osc, dest).unwrap();
        ctx.connect(osc, dest).unwrap();
        assert_eq!(ctx.connections().len(), 1);
    }

    #[test]
    fn sources_reject_signal_input() {
        let mut ctx = AudioContext::new(48_000);
        let a = ctx.add(ConstantSource::new(1.0));
        let b = ctx.add(ConstantSource::new(1.0));
        assert_eq!(ctx.connect(a, b), Err(PatchError::NotAnInput(b.0.index())));
    }

    #[test]
    fn renders_connected_chain_and_advances_clock() {
        let mut ctx = AudioContext::new(48_000);
        let dc = ctx.add(ConstantSource::new(1.0));
        let gain = ctx.add(Gain::new(0.5));
        ctx.connect(dc, gain).unwrap();
        ctx.connect(gain, ctx.destination()).unwrap();
        let out = ctx.render_quantum();
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
        assert!((ctx.current_time() - 64.0 / 48_000.0).abs() < 1e-12);
    }

    #[test]
    fn disconnect_drops_outgoing_only() {
        let mut ctx = AudioContext::new(48_000);
        let dc = ctx.add(ConstantSource::new(1.0));
        let gain = ctx.add(Gain::new(1.0));
        ctx.connect(dc, gain).unwrap();
        ctx.connect(gain, ctx.destination()).unwrap();
        ctx.disconnect(gain).unwrap();
        let conns = ctx.connections();
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].from, dc);
        assert!(ctx.render_quantum().iter().all(|&s| s == 0.0));
    }

    #[test]
    fn param_wire_modulates_from_previous_quantum() {
        let mut ctx = AudioContext::new(48_000);
        let lfo = ctx.add(ConstantSource::new(0.25));
        let dc = ctx.add(ConstantSource::new(1.0));
        let gain = ctx.add(Gain::new(0.5));
        ctx.connect(dc, gain).unwrap();
        ctx.connect(gain, ctx.destination()).unwrap();
        let param = ctx.param_ref(gain, "gain").unwrap();
        ctx.connect_param(lfo, param).unwrap();

        ctx.render_quantum();
        let out = ctx.render_quantum();
        assert!(out.iter().all(|&s| (s - 0.75).abs() < 1e-6));

        ctx.disconnect(lfo).unwrap();
        let out = ctx.render_quantum();
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn removed_nodes_take_their_wires() {
        let mut ctx = AudioContext::new(48_000);
        let osc = ctx.add(Oscillator::new(440.0, Waveform::Sine));
        ctx.connect(osc, ctx.destination()).unwrap();
        assert!(matches!(ctx.remove(osc), Ok(HostNode::Oscillator(_))));
        assert!(ctx.connections().is_empty());
        assert!(ctx.remove(osc).is_err());
        assert!(ctx.remove(ctx.destination()).is_err());
    }

    #[test]
    fn unconnected_analyser_still_captures() {
        let mut ctx = AudioContext::new(48_000);
        let dc = ctx.add(ConstantSource::new(0.5));
        let fft = ctx.add(Analyser::new(64).unwrap());
        ctx.connect(dc, fft).unwrap();
        ctx.render_quantum();
        let mut wave = [0.0; 4];
        ctx.analyser(fft).unwrap().float_time_domain(&mut wave);
        assert_eq!(wave, [0.5; 4]);
    }
}
