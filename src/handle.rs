//! Port handle parsing.
//!
//! Edge endpoints carry handle strings such as `"inlet-2"`, `"outlet-0"` or
//! `"video-in-3-uniformName-"`. The port index is the first dash-separated
//! segment that parses as an unsigned integer. Anything without one (or no
//! handle at all) means port 0.

use serde::{Deserialize, Serialize};

/// A directed wire between two node ports, as the editor sends it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub source: String,
    #[serde(default)]
    pub source_handle: Option<String>,
    pub target: String,
    #[serde(default)]
    pub target_handle: Option<String>,
}

impl Edge {
    /// An edge between the default ports of two nodes.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_handle: None,
            target: target.into(),
            target_handle: None,
        }
    }

    pub fn with_outlet(mut self, outlet: usize) -> Self {
        self.source_handle = Some(format!("outlet-{outlet}"));
        self
    }

    pub fn with_inlet(mut self, inlet: usize) -> Self {
        self.target_handle = Some(format!("inlet-{inlet}"));
        self
    }

    #[inline]
    pub fn source_port(&self) -> usize {
        port_index(self.source_handle.as_deref())
    }

    #[inline]
    pub fn target_port(&self) -> usize {
        port_index(self.target_handle.as_deref())
    }
}

/// Parse a handle string into a port index, degrading to 0.
pub fn port_index(handle: Option<&str>) -> usize {
    let Some(handle) = handle else {
        return 0;
    };
    match handle.split('-').find_map(|segment| segment.parse::<usize>().ok()) {
        Some(index) => index,
        None => {
            tracing::debug!(handle, "handle has no port index, using port 0");
            0
        }
    }
}
