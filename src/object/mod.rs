//! The object contract
//!
//! Every pluggable unit, audio or message-only, implements [`PatchObject`].
//! The registry and the routing core only ever talk to objects through this
//! trait and hand them an [`ObjectContext`] for the duration of each call.
//! Objects never reach into other nodes directly: sends, subscriptions and
//! analysis requests are queued as [`Effect`]s and carried out by the patch
//! once the call returns.

pub mod registry;
pub mod spec;

use crate::analysis::{Domain, InletMeta, Precision};
use crate::channel::{ChannelRegistry, ChannelRole};
use crate::config::RuntimeConfig;
use crate::error::PatchError;
use crate::host::nodes::HostNode;
use crate::host::{AudioContext, HostNodeId, ParamRef};
use crate::routing::{MessageMeta, SendTarget};
use crate::scheduler::TimeScheduler;
use crate::value::Value;

pub use registry::{ObjectFactory, ObjectRegistry};
pub use spec::{ObjectSpec, PortKind, PortSpec};

/// Work an object asks the patch to do on its behalf.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    Send {
        from: String,
        target: SendTarget,
        data: Value,
    },
    Subscribe {
        node: String,
        channel: String,
        role: ChannelRole,
    },
    Unsubscribe {
        node: String,
        channel: String,
    },
    RequestAnalysis {
        consumer: String,
        domain: Domain,
        precision: Precision,
    },
    AnalysisInletMeta {
        consumer: String,
        meta: InletMeta,
    },
    DisableAnalysis {
        consumer: String,
    },
}

/// Everything an object may touch while handling one call.
pub struct ObjectContext<'a> {
    pub(crate) node_id: &'a str,
    pub(crate) host: &'a mut AudioContext,
    pub(crate) scheduler: &'a TimeScheduler,
    pub(crate) config: &'a RuntimeConfig,
    pub(crate) audio_channels: &'a mut ChannelRegistry,
    pub(crate) effects: &'a mut Vec<Effect>,
}

impl<'a> ObjectContext<'a> {
    #[inline]
    pub fn node_id(&self) -> &str {
        self.node_id
    }

    pub fn host(&self) -> &AudioContext {
        self.host
    }

    pub fn host_mut(&mut self) -> &mut AudioContext {
        self.host
    }

    pub fn scheduler(&self) -> &TimeScheduler {
        self.scheduler
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.config
    }

    /// Current transport time in seconds.
    #[inline]
    pub fn now(&self) -> f64 {
        self.scheduler.now()
    }

    /// Add a native node owned by this object.
    pub fn add_host(&mut self, node: impl Into<HostNode>) -> HostNodeId {
        self.host.add(node)
    }

    /// Remove native nodes, ignoring ones that are already gone.
    pub fn remove_host(&mut self, nodes: &[HostNodeId]) {
        for &node in nodes {
            let _ = self.host.remove(node);
        }
    }

    /// Send out of outlet 0.
    pub fn send(&mut self, data: Value) {
        self.push_send(SendTarget::Default, data);
    }

    pub fn send_to(&mut self, outlet: usize, data: Value) {
        self.push_send(SendTarget::Outlet(outlet), data);
    }

    pub fn send_channel(&mut self, channel: &str, data: Value) {
        self.push_send(SendTarget::Channel(channel.to_owned()), data);
    }

    pub fn subscribe(&mut self, channel: &str, role: ChannelRole) {
        self.effects.push(Effect::Subscribe {
            node: self.node_id.to_owned(),
            channel: channel.to_owned(),
            role,
        });
    }

    pub fn unsubscribe(&mut self, channel: &str) {
        self.effects.push(Effect::Unsubscribe {
            node: self.node_id.to_owned(),
            channel: channel.to_owned(),
        });
    }

    /// Join an audio channel; wired up on the next edge replay.
    pub fn subscribe_audio(&mut self, channel: &str, role: ChannelRole) {
        self.audio_channels.subscribe(channel, self.node_id, role);
    }

    pub fn unsubscribe_audio(&mut self, channel: &str) {
        self.audio_channels.unsubscribe(channel, self.node_id);
    }

    /// Ask for analysis snapshots of whatever analyser feeds this node.
    pub fn request_analysis(&mut self, domain: Domain, precision: Precision) {
        self.effects.push(Effect::RequestAnalysis {
            consumer: self.node_id.to_owned(),
            domain,
            precision,
        });
    }

    pub fn set_analysis_inlet(&mut self, meta: InletMeta) {
        self.effects.push(Effect::AnalysisInletMeta {
            consumer: self.node_id.to_owned(),
            meta,
        });
    }

    pub fn disable_analysis(&mut self) {
        self.effects.push(Effect::DisableAnalysis {
            consumer: self.node_id.to_owned(),
        });
    }

    /// Write a message into a parameter: scheduled messages become
    /// automation, numbers an immediate value.
    pub fn write_param(&mut self, param: ParamRef, value: &Value) -> Result<(), PatchError> {
        let target = self.host.param_mut(param)?;
        self.scheduler.apply_value(target, value)
    }

    fn push_send(&mut self, target: SendTarget, data: Value) {
        self.effects.push(Effect::Send {
            from: self.node_id.to_owned(),
            target,
            data,
        });
    }
}

/// Write `data` into `param`, logging when there is no such parameter or
/// the value is rejected.
pub fn write_keyed_param(cx: &mut ObjectContext<'_>, param: Option<ParamRef>, key: &str, data: &Value) {
    let Some(param) = param else {
        tracing::trace!(node = cx.node_id(), key, "no handler for message");
        return;
    };
    if let Err(err) = cx.write_param(param, data) {
        tracing::warn!(node = cx.node_id(), key, %err, "parameter write failed");
    }
}

/// The surface every object type implements.
pub trait PatchObject: Send {
    /// Initialise from positional creation arguments.
    fn create(&mut self, cx: &mut ObjectContext<'_>, params: &[Value]) -> Result<(), PatchError>;

    /// Receive a message on an inlet. By default a named inlet is treated as
    /// a key for [`PatchObject::set`].
    fn on_message(&mut self, cx: &mut ObjectContext<'_>, data: Value, meta: &MessageMeta) {
        if let Some(inlet) = meta.inlet_name {
            self.set(cx, inlet, data);
        }
    }

    /// Receive a keyed message. By default the key names an audio parameter.
    fn set(&mut self, cx: &mut ObjectContext<'_>, key: &str, data: Value) {
        write_keyed_param(cx, self.audio_param(key), key, &data);
    }

    /// Release everything the object owns. Safe to call when `create`
    /// failed half way.
    fn destroy(&mut self, cx: &mut ObjectContext<'_>) {
        let nodes = self.host_nodes();
        cx.remove_host(&nodes);
    }

    /// Native node audio leaves from.
    fn audio_output(&self) -> Option<HostNodeId> {
        None
    }

    /// Native node incoming audio is wired to.
    fn audio_input(&self) -> Option<HostNodeId> {
        self.audio_output()
    }

    /// Every native node this object owns.
    fn host_nodes(&self) -> Vec<HostNodeId> {
        let mut nodes: Vec<_> = self.audio_output().into_iter().chain(self.audio_input()).collect();
        nodes.dedup();
        nodes
    }

    /// Automatable parameter exposed under `name`.
    fn audio_param(&self, _name: &str) -> Option<ParamRef> {
        None
    }

    /// Wire this object's audio into `target`.
    fn connect_to(&mut self, cx: &mut ObjectContext<'_>, target: HostNodeId) -> Result<(), PatchError> {
        let source = self
            .audio_output()
            .ok_or_else(|| PatchError::NoAudioOutput(cx.node_id().to_owned()))?;
        cx.host_mut().connect(source, target)
    }

    /// Drop this object's outgoing audio connections.
    fn disconnect(&mut self, cx: &mut ObjectContext<'_>) {
        if let Some(output) = self.audio_output() {
            let _ = cx.host_mut().disconnect(output);
        }
    }

    /// Periodic housekeeping off the audio path.
    fn tick(&mut self, _cx: &mut ObjectContext<'_>) {}

    /// Runs right before every quantum is rendered.
    fn before_quantum(&mut self) {}
}
