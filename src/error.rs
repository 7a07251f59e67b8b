//! Error types shared by the runtime services.
//!
//! Most of these never reach a caller: the patch-facing entry points catch
//! them, log, and carry on, so that one bad node or edge cannot take the rest
//! of the graph down with it. The `try_*` variants of those entry points
//! return them unchanged for callers that want to know.

use thiserror::Error;

use crate::audio::NodeGroup;

/// Errors produced while building or rewiring a patch.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PatchError {
    /// No factory is registered for this object type
    #[error("unknown object type: {0}")]
    UnknownType(String),

    /// A node id that is not (or no longer) part of the patch
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// A node id that already exists in the patch
    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    /// The node exists but exposes no automatable parameter with this name
    #[error("node '{node}' has no parameter '{param}'")]
    UnknownParam {
        /// Node that was asked for the parameter.
        node: String,
        /// Requested parameter name.
        param: String,
    },

    /// The group-pair table forbids this signal connection
    #[error("cannot connect {source_group:?} node '{source_id}' to {target_group:?} node '{target_id}'")]
    IncompatibleGroups {
        /// Source node id.
        source_id: String,
        /// Group of the source node.
        source_group: NodeGroup,
        /// Target node id.
        target_id: String,
        /// Group of the target node.
        target_group: NodeGroup,
    },

    /// The node has no native audio output to connect from
    #[error("node '{0}' has no audio output")]
    NoAudioOutput(String),

    /// The node has no native audio input to connect to
    #[error("node '{0}' has no audio input")]
    NoAudioInput(String),

    /// A native host node handle that has been removed
    #[error("native node {0} does not exist")]
    UnknownHostNode(usize),

    /// The native node accepts no signal inputs
    #[error("native node {0} does not accept inputs")]
    NotAnInput(usize),

    /// A value the native parameter cannot represent
    #[error("invalid value {value} for parameter '{param}': {reason}")]
    InvalidParamValue {
        /// Parameter name.
        param: &'static str,
        /// Rejected value.
        value: f32,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A message an inlet cannot accept
    #[error("inlet '{inlet}' rejected the message: {reason}")]
    InvalidInlet {
        /// Inlet name.
        inlet: &'static str,
        /// Why the message was rejected.
        reason: &'static str,
    },

    /// An object failed to initialise from its creation arguments
    #[error("failed to create '{node}': {reason}")]
    Create {
        /// Node being created.
        node: String,
        /// Failure description from the object.
        reason: String,
    },
}

impl PatchError {
    /// Create an unknown parameter error.
    pub fn unknown_param(node: impl Into<String>, param: impl Into<String>) -> Self {
        PatchError::UnknownParam {
            node: node.into(),
            param: param.into(),
        }
    }

    /// Create an object creation error.
    pub fn create(node: impl Into<String>, reason: impl Into<String>) -> Self {
        PatchError::Create {
            node: node.into(),
            reason: reason.into(),
        }
    }
}
