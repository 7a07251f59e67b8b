use std::time::Instant;

use dasp_graph::Buffer;
use patchbay::bridge::{bridge, BridgeEvent, BridgeParts};
use patchbay::config::BridgeConfig;
use patchbay::host::nodes::BridgeNode;
use patchbay::host::{AudioContext, Connection};
use patchbay::value::{Curve, EnvelopeValues, Phase};
use patchbay::{Edge, Patch, RuntimeConfig, ScheduledMessage, Value};

fn chain_patch() -> Patch {
    let mut patch = Patch::new(RuntimeConfig::default());
    assert!(patch.add_node("osc", "osc~", &[Value::Float(440.0), Value::from("sine")]));
    assert!(patch.add_node("amp", "gain~", &[Value::Null, Value::Float(0.5)]));
    assert!(patch.add_node("dac", "dac~", &[]));
    patch
}

fn peak(patch: &mut Patch, quanta: usize) -> f32 {
    (0..quanta)
        .map(|_| patch.render_quantum().iter().fold(0.0_f32, |m, s| m.max(s.abs())))
        .fold(0.0, f32::max)
}

#[test]
fn rewiring_leaves_only_the_latest_edges() {
    let mut patch = chain_patch();
    patch.update_edges(&[Edge::new("osc", "amp"), Edge::new("amp", "dac")]);
    let through_gain = peak(&mut patch, 8);
    assert!((through_gain - 0.5).abs() < 0.01, "peak {through_gain}");

    patch.update_edges(&[Edge::new("osc", "dac")]);
    let audio = patch.audio();
    let (osc, amp, dac) = (
        audio.output_of("osc").unwrap(),
        audio.output_of("amp").unwrap(),
        audio.output_of("dac").unwrap(),
    );
    let conns = audio.connections();
    assert!(conns.iter().any(|c| c.from == osc && c.to == dac));
    assert!(!conns.iter().any(|c| c.from == amp || c.to == amp));

    let direct = peak(&mut patch, 8);
    assert!((direct - 1.0).abs() < 0.01, "peak {direct}");
}

#[test]
fn removed_gain_leaves_dac_on_the_output_bus_only() {
    let mut patch = chain_patch();
    patch.update_edges(&[Edge::new("osc", "amp"), Edge::new("amp", "dac")]);
    patch.remove_node("amp");
    patch.update_edges(&[]);

    let audio = patch.audio();
    let dac = audio.output_of("dac").unwrap();
    let touching: Vec<Connection> = audio
        .connections()
        .into_iter()
        .filter(|c| c.from == dac || c.to == dac)
        .collect();
    assert_eq!(touching.len(), 1);
    assert_eq!(touching[0].to, audio.bus());
    assert!(peak(&mut patch, 4) < 1e-6);
}

#[test]
fn replaying_the_same_edges_is_idempotent() {
    let mut patch = chain_patch();
    let edges = [Edge::new("osc", "amp"), Edge::new("amp", "dac")];
    patch.update_edges(&edges);
    let first: Vec<Connection> = patch.audio().connections();
    patch.update_edges(&edges);
    patch.update_edges(&edges);
    assert_eq!(patch.audio().connections(), first);
}

#[test]
fn trigger_envelope_lands_on_the_transport_timeline() {
    let mut patch = chain_patch();
    patch.audio().host().clock().set(5.0);

    let trigger = ScheduledMessage::Trigger {
        values: EnvelopeValues {
            start: 0.0,
            peak: 1.0,
            sustain: 0.25,
        },
        attack: Phase::linear(0.5),
        decay: Phase::linear(1.0).with_curve(Curve::Exponential),
    };
    // Inlet 1 of gain~ is its gain parameter
    patch.deliver("amp", 1, Value::Scheduled(trigger));

    let gain = patch.audio().param("amp", "gain").unwrap();
    assert!(gain.value_at(5.0).abs() < 1e-6);
    assert!((gain.value_at(5.25) - 0.5).abs() < 1e-4);
    assert!((gain.value_at(5.5) - 1.0).abs() < 1e-4);
    assert!((gain.value_at(6.5) - 0.25).abs() < 1e-4);
    assert!((gain.value_at(60.0) - 0.25).abs() < 1e-4);
}

#[test]
fn trigger_from_wire_format_ramps_linearly() {
    let mut patch = chain_patch();
    patch.audio().host().clock().set(5.0);

    let message = Value::from(serde_json::json!({
        "type": "trigger",
        "values": { "start": 0, "peak": 1, "sustain": 0.5 },
        "attack": { "time": 0.1 },
        "decay": { "time": 0.2 }
    }));
    assert!(matches!(message, Value::Scheduled(ScheduledMessage::Trigger { .. })));
    patch.deliver("amp", 1, message);

    let gain = patch.audio().param("amp", "gain").unwrap();
    assert!(gain.value_at(5.0).abs() < 1e-6);
    assert!((gain.value_at(5.05) - 0.5).abs() < 1e-4);
    assert!((gain.value_at(5.1) - 1.0).abs() < 1e-4);
    assert!((gain.value_at(5.2) - 0.75).abs() < 1e-4);
    assert!((gain.value_at(5.3) - 0.5).abs() < 1e-4);
}

#[test]
fn analyser_lookup_follows_edge_changes() {
    let mut patch = Patch::new(RuntimeConfig::default());
    patch.add_node("osc", "osc~", &[]);
    patch.add_node("fft-a", "fft~", &[]);
    patch.add_node("fft-b", "fft~", &[]);
    patch.add_node("spec", "spectrum", &[]);

    patch.update_edges(&[Edge::new("osc", "fft-a"), Edge::new("fft-a", "spec")]);
    assert_eq!(patch.analyzer_of("spec").as_deref(), Some("fft-a"));

    patch.update_edges(&[Edge::new("osc", "fft-b"), Edge::new("fft-b", "spec")]);
    assert_eq!(patch.analyzer_of("spec").as_deref(), Some("fft-b"));

    patch.update_edges(&[]);
    assert_eq!(patch.analyzer_of("spec"), None);
}

#[test]
fn sustained_underrun_ends_performance_exactly_once() {
    let config = BridgeConfig {
        max_consecutive_underruns: 100,
        ..BridgeConfig::default()
    };
    let BridgeParts {
        realtime,
        control,
        mut events,
        ..
    } = bridge(Buffer::LEN, &config);

    // Nothing ever produces into the ring
    let mut host = AudioContext::new(48_000);
    let node = host.add(BridgeNode::new(realtime));
    host.connect(node, host.destination()).unwrap();

    for _ in 0..101 {
        host.render_quantum();
    }
    assert_eq!(events.drain().collect::<Vec<_>>(), [BridgeEvent::PerformanceEnded]);
    assert!(control.is_fatal());
    let attempts = control.production_attempts();

    for _ in 0..200 {
        assert!(host.render_quantum().iter().all(|&s| s == 0.0));
    }
    assert_eq!(events.drain().count(), 0);
    assert_eq!(control.production_attempts(), attempts);
}

#[test]
fn audio_channels_carry_signal_without_edges() {
    let mut patch = Patch::new(RuntimeConfig::default());
    patch.add_node("osc", "osc~", &[Value::Float(440.0), Value::from("square")]);
    patch.add_node("tx", "send~", &[Value::from("wire")]);
    patch.add_node("rx", "receive~", &[Value::from("wire")]);
    patch.add_node("amp", "gain~", &[Value::Null, Value::Float(0.25)]);
    patch.add_node("dac", "dac~", &[]);
    patch.update_edges(&[
        Edge::new("osc", "tx"),
        Edge::new("rx", "amp"),
        Edge::new("amp", "dac"),
    ]);
    let level = peak(&mut patch, 4);
    assert!((level - 0.25).abs() < 1e-4, "peak {level}");
}

#[test]
fn message_channel_delivers_once_per_receiver() {
    let mut patch = Patch::new(RuntimeConfig::default());
    patch.add_node("tx", "send", &[Value::from("notes")]);
    patch.add_node("rx", "receive", &[Value::from("notes")]);
    patch.add_node("sum", "+", &[Value::Int(100)]);
    patch.add_node("out", "trigger", &[Value::from("a")]);
    patch.update_edges(&[Edge::new("rx", "sum"), Edge::new("sum", "out")]);

    let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let log = seen.clone();
    patch.set_delivery_tap(move |envelope| {
        if envelope.target == "out" {
            log.borrow_mut().push(envelope.data.clone());
        }
    });
    patch.deliver("tx", 0, Value::Int(1));
    patch.deliver("tx", 0, Value::Int(2));
    assert_eq!(*seen.borrow(), [Value::Float(101.0), Value::Float(102.0)]);
}

#[test]
fn engine_status_reaches_message_graph() {
    let mut patch = Patch::new(RuntimeConfig::default());
    patch.add_node("eng", "engine~", &[]);
    patch.add_node("status", "trigger", &[Value::from("a")]);
    patch.update_edges(&[Edge::new("eng", "status").with_outlet(1)]);

    let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let log = seen.clone();
    patch.set_delivery_tap(move |envelope| {
        if envelope.target == "status" {
            log.borrow_mut().push(envelope.data.clone());
        }
    });
    patch.deliver("eng", 1, Value::from("pause"));
    patch.render_quantum();
    patch.tick(Instant::now());
    assert_eq!(*seen.borrow(), [Value::from("paused")]);
    patch.shutdown();
}
