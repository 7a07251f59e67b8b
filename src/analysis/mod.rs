//! FFT analysis subsystem
//!
//! Finds the analyser feeding each consumer and, on a shared poll timer,
//! hands every enabled consumer snapshots in the formats it asked for.
//!
//! - The consumer → analyser lookup walks the edge list backwards one hop and
//!   is cached; any edge update clears the whole cache.
//! - The poll interval has two tiers picked by window focus. A hidden window
//!   is not polled at all.
//! - Snapshot buffers are pooled per analyser and format and only replaced
//!   when the analyser's size changes.
//! - The timer only exists while at least one consumer is enabled.

use std::time::{Duration, Instant};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::audio::AudioService;
use crate::config::AnalysisConfig;
use crate::handle::Edge;
use crate::host::analyser::Analyser;

/// Which view of the signal a consumer wants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// Time-domain waveform
    Wave,
    /// Magnitude spectrum
    Freq,
}

/// Sample format of a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 8-bit unsigned
    Int,
    /// 32-bit float
    Float,
}

/// Where a consumer wants its snapshots delivered.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InletMeta {
    pub inlet: usize,
    /// Shader uniform bound to the inlet, if any
    #[serde(default)]
    pub uniform: Option<String>,
}

/// Borrowed snapshot samples.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Samples<'a> {
    Float(&'a [f32]),
    Int(&'a [u8]),
}

impl Samples<'_> {
    pub fn len(&self) -> usize {
        match self {
            Samples::Float(s) => s.len(),
            Samples::Int(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One snapshot for one consumer.
#[derive(Clone, Copy, Debug)]
pub struct AnalysisPayload<'a> {
    pub consumer_id: &'a str,
    pub domain: Domain,
    pub precision: Precision,
    pub samples: Samples<'a>,
    pub sample_rate: u32,
    pub inlet_meta: Option<&'a InletMeta>,
}

enum Pooled {
    Float(Vec<f32>),
    Int(Vec<u8>),
}

impl Pooled {
    fn new(precision: Precision, len: usize) -> Self {
        match precision {
            Precision::Float => Pooled::Float(vec![0.0; len]),
            Precision::Int => Pooled::Int(vec![0; len]),
        }
    }

    fn len(&self) -> usize {
        match self {
            Pooled::Float(buf) => buf.len(),
            Pooled::Int(buf) => buf.len(),
        }
    }

    fn fill<'a>(&'a mut self, analyser: &mut Analyser, domain: Domain) -> Samples<'a> {
        match (self, domain) {
            (Pooled::Float(buf), Domain::Wave) => {
                analyser.float_time_domain(buf);
                Samples::Float(buf)
            }
            (Pooled::Float(buf), Domain::Freq) => {
                analyser.float_frequency(buf);
                Samples::Float(buf)
            }
            (Pooled::Int(buf), Domain::Wave) => {
                analyser.byte_time_domain(buf);
                Samples::Int(buf)
            }
            (Pooled::Int(buf), Domain::Freq) => {
                analyser.byte_frequency(buf);
                Samples::Int(buf)
            }
        }
    }
}

struct PollTimer {
    interval: Duration,
    /// `None` until the first poll
    next_due: Option<Instant>,
}

pub struct FftAnalysis {
    analyzer_type: String,
    config: AnalysisConfig,
    edges: Vec<Edge>,
    node_types: HashMap<String, String>,
    /// consumer → analyser, `None` meaning "looked, found nothing"
    cache: HashMap<String, Option<String>>,
    explicit: HashMap<String, String>,
    /// Poll order is enable order
    enabled: Vec<String>,
    requests: HashMap<String, Vec<(Domain, Precision)>>,
    inlet_meta: HashMap<String, InletMeta>,
    pool: HashMap<String, HashMap<(Domain, Precision), Pooled>>,
    allocations: usize,
    timer: Option<PollTimer>,
    focused: bool,
    visible: bool,
}

impl FftAnalysis {
    pub fn new(analyzer_type: impl Into<String>, config: AnalysisConfig) -> Self {
        Self {
            analyzer_type: analyzer_type.into(),
            config,
            edges: Vec::new(),
            node_types: HashMap::new(),
            cache: HashMap::new(),
            explicit: HashMap::new(),
            enabled: Vec::new(),
            requests: HashMap::new(),
            inlet_meta: HashMap::new(),
            pool: HashMap::new(),
            allocations: 0,
            timer: None,
            focused: true,
            visible: true,
        }
    }

    /// Record a node's type so the lookup can recognise analysers.
    pub fn register_node(&mut self, node_id: &str, type_name: &str) {
        self.node_types.insert(node_id.to_owned(), type_name.to_owned());
        self.cache.clear();
    }

    /// Forget a node, whether it was a consumer, an analyser or both.
    pub fn unregister_node(&mut self, node_id: &str) {
        self.disable(node_id);
        self.node_types.remove(node_id);
        self.explicit.remove(node_id);
        self.explicit.retain(|_, analyser| analyser != node_id);
        self.pool.remove(node_id);
        self.cache.clear();
    }

    /// Take a new edge list. Every cached lookup is dropped.
    pub fn update_edges(&mut self, edges: &[Edge]) {
        self.edges = edges.to_vec();
        self.cache.clear();
    }

    /// The analyser feeding `consumer`: an explicit assignment if there is
    /// one, otherwise the first directly connected upstream analyser.
    pub fn get_analyzer_audio_node(&mut self, consumer: &str) -> Option<String> {
        if let Some(analyser) = self.explicit.get(consumer) {
            return Some(analyser.clone());
        }
        if let Some(cached) = self.cache.get(consumer) {
            return cached.clone();
        }
        let found = self
            .edges
            .iter()
            .filter(|edge| edge.target == consumer)
            .find(|edge| {
                self.node_types
                    .get(&edge.source)
                    .is_some_and(|ty| *ty == self.analyzer_type)
            })
            .map(|edge| edge.source.clone());
        self.cache.insert(consumer.to_owned(), found.clone());
        found
    }

    /// Pin `consumer` to an analyser, or go back to inferring it.
    pub fn set_analyzer(&mut self, consumer: &str, analyser: Option<&str>) {
        match analyser {
            Some(analyser) => {
                self.explicit.insert(consumer.to_owned(), analyser.to_owned());
            }
            None => {
                self.explicit.remove(consumer);
            }
        }
    }

    /// Add `consumer` to the poll set.
    pub fn enable(&mut self, consumer: &str) {
        if !self.enabled.iter().any(|id| id == consumer) {
            self.enabled.push(consumer.to_owned());
            tracing::debug!(consumer, "analysis consumer enabled");
        }
        if self.timer.is_none() {
            self.timer = Some(PollTimer {
                interval: self.config.poll_interval(self.focused),
                next_due: None,
            });
        }
    }

    /// Ask for one format; enables the consumer.
    pub fn request(&mut self, consumer: &str, domain: Domain, precision: Precision) {
        let formats = self.requests.entry_ref(consumer).or_default();
        if !formats.contains(&(domain, precision)) {
            formats.push((domain, precision));
        }
        self.enable(consumer);
    }

    pub fn set_inlet_meta(&mut self, consumer: &str, meta: InletMeta) {
        self.inlet_meta.insert(consumer.to_owned(), meta);
    }

    /// Drop `consumer` and everything held on its behalf. Pooled buffers go
    /// too, unless another enabled consumer reads the same analyser.
    pub fn disable(&mut self, consumer: &str) {
        self.requests.remove(consumer);
        self.inlet_meta.remove(consumer);
        let Some(position) = self.enabled.iter().position(|id| id == consumer) else {
            return;
        };
        self.enabled.remove(position);

        if let Some(analyser) = self.get_analyzer_audio_node(consumer) {
            let enabled = std::mem::take(&mut self.enabled);
            let shared = enabled
                .iter()
                .any(|other| self.get_analyzer_audio_node(other).as_deref() == Some(analyser.as_str()));
            self.enabled = enabled;
            if !shared {
                self.pool.remove(&analyser);
            }
        }

        if self.enabled.is_empty() {
            self.timer = None;
            tracing::debug!("analysis timer stopped");
        }
    }

    /// Switch poll tier.
    pub fn set_focused(&mut self, focused: bool) {
        self.focused = focused;
        if let Some(timer) = &mut self.timer {
            timer.interval = self.config.poll_interval(focused);
        }
    }

    /// A hidden window is not polled.
    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    #[inline]
    pub fn is_polling(&self) -> bool {
        self.timer.is_some()
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.timer.as_ref().map(|timer| timer.interval)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &str> {
        self.enabled.iter().map(String::as_str)
    }

    /// Snapshot buffers allocated so far.
    #[inline]
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// Deliver snapshots if the timer is due at `now`. Returns the number of
    /// payloads delivered.
    pub fn poll(
        &mut self,
        now: Instant,
        audio: &mut AudioService,
        mut deliver: impl FnMut(&AnalysisPayload<'_>),
    ) -> usize {
        if !self.visible {
            return 0;
        }
        let Some(timer) = &mut self.timer else {
            return 0;
        };
        if timer.next_due.is_some_and(|due| now < due) {
            return 0;
        }
        timer.next_due = Some(now + timer.interval);

        let sample_rate = audio.host().sample_rate();
        let enabled = std::mem::take(&mut self.enabled);
        let mut delivered = 0;
        for consumer in &enabled {
            let Some(formats) = self.requests.get(consumer.as_str()).filter(|f| !f.is_empty()) else {
                continue;
            };
            let formats = formats.clone();
            let Some(analyser_id) = self.get_analyzer_audio_node(consumer) else {
                continue;
            };
            let Some(analyser) = audio.analyser_mut(&analyser_id) else {
                continue;
            };
            let slots = self.pool.entry_ref(analyser_id.as_str()).or_default();
            for (domain, precision) in formats {
                let len = match domain {
                    Domain::Wave => analyser.fft_size(),
                    Domain::Freq => analyser.frequency_bin_count(),
                };
                let pooled = slots
                    .entry((domain, precision))
                    .or_insert_with(|| Pooled::new(precision, 0));
                if pooled.len() != len {
                    *pooled = Pooled::new(precision, len);
                    self.allocations += 1;
                }
                let payload = AnalysisPayload {
                    consumer_id: consumer,
                    domain,
                    precision,
                    samples: pooled.fill(analyser, domain),
                    sample_rate,
                    inlet_meta: self.inlet_meta.get(consumer.as_str()),
                };
                deliver(&payload);
                delivered += 1;
            }
        }
        self.enabled = enabled;
        delivered
    }
}
