//! Runtime for visual patches that mix an audio graph with a message graph.
//!
//! A [`Patch`] owns both graphs. Audio objects are backed by nodes in an
//! in-process [`host::AudioContext`]; every object, audio or not, exchanges
//! discrete [`Value`]s along the same edge list.

pub mod analysis;
pub mod audio;
pub mod bridge;
pub mod channel;
pub mod config;
pub mod error;
pub mod handle;
pub mod host;
pub mod object;
pub mod objects;
pub mod patch;
pub mod routing;
pub mod scheduler;
pub mod value;

pub use audio::{AudioService, NodeGroup, NodeHandle};
pub use config::RuntimeConfig;
pub use error::PatchError;
pub use handle::Edge;
pub use patch::{Patch, PatchDocument};
pub use value::{ScheduledMessage, Value};
