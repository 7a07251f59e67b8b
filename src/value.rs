//! Message values and the scheduled-automation wire format.
//!
//! Patch messages arrive as loosely-typed JSON. They are decoded once, at the
//! boundary, into [`Value`]; everything past that point matches on variants.
//! A JSON object whose `type` is `set`, `trigger` or `release` and which
//! decodes cleanly becomes [`Value::Scheduled`]. Anything else (including a
//! malformed scheduled message) stays a plain value.

use serde::{Deserialize, Serialize};

/// A discrete message travelling between nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absence of a value (e.g. a reserved creation slot)
    Null,
    /// "Do your thing now"
    Bang,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// Text, symbols and commands
    Str(String),
    /// Heterogeneous list
    List(Vec<Value>),
    /// Float samples (analysis payloads, signal snapshots)
    Floats(Vec<f32>),
    /// Byte samples (8-bit analysis payloads)
    Bytes(Vec<u8>),
    /// Parameter automation
    Scheduled(ScheduledMessage),
    /// Any other structured payload, passed through untouched
    Json(serde_json::Value),
}

impl Value {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Text view of the value, if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// True for `Bang` and the literal string `"bang"`.
    pub fn is_bang(&self) -> bool {
        matches!(self, Value::Bang) || self.as_str() == Some("bang")
    }

    /// True for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<ScheduledMessage> for Value {
    fn from(v: ScheduledMessage) -> Self {
        Value::Scheduled(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(0.0)),
            },
            Json::String(s) => Value::Str(s),
            Json::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            Json::Object(map) => {
                match map.get("type").and_then(Json::as_str) {
                    Some("bang") => return Value::Bang,
                    Some("set" | "trigger" | "release") => {
                        let json = Json::Object(map);
                        return match serde_json::from_value::<ScheduledMessage>(json.clone()) {
                            Ok(msg) => Value::Scheduled(msg),
                            Err(_) => Value::Json(json),
                        };
                    }
                    _ => {}
                }
                Value::Json(Json::Object(map))
            }
        }
    }
}

/// How the `time` of a `set` message is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeMode {
    /// `time` is a transport timestamp in seconds
    Absolute,
    /// `time` is an offset from the current transport time
    #[default]
    Relative,
}

/// Shape of one envelope phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Curve {
    /// Straight-line ramp
    #[default]
    Linear,
    /// Exponential ramp (cannot reach zero)
    Exponential,
    /// Exponential approach governed by a time constant
    TargetAtTime,
}

/// Duration and curve of one envelope phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Phase {
    /// Phase length in seconds.
    pub time: f64,
    /// Ramp shape.
    pub curve: Curve,
    /// Time constant for `targetAtTime`; 30% of `time` when absent.
    pub time_constant: Option<f64>,
}

impl Phase {
    /// A linear phase of the given length.
    pub fn linear(time: f64) -> Self {
        Self {
            time,
            ..Self::default()
        }
    }

    /// Same phase with a different curve.
    pub fn with_curve(mut self, curve: Curve) -> Self {
        self.curve = curve;
        self
    }
}

/// Start, peak and sustain levels of a `trigger`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeValues {
    /// Value the parameter jumps to when the trigger fires.
    pub start: f32,
    /// Value reached at the end of the attack phase.
    pub peak: f32,
    /// Value held after the decay phase.
    pub sustain: f32,
}

impl Default for EnvelopeValues {
    fn default() -> Self {
        Self {
            start: 0.0,
            peak: 1.0,
            sustain: 1.0,
        }
    }
}

/// Automation applied to a continuous parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ScheduledMessage {
    /// Jump to `value` at a point in time
    #[serde(rename_all = "camelCase")]
    Set {
        /// Target value.
        value: f32,
        /// When to apply it; "now" when absent.
        #[serde(default)]
        time: Option<f64>,
        /// Whether `time` is absolute or an offset.
        #[serde(default)]
        time_mode: TimeMode,
    },
    /// Attack, then decay to sustain
    #[serde(rename_all = "camelCase")]
    Trigger {
        /// Start, peak and sustain levels.
        #[serde(default)]
        values: EnvelopeValues,
        /// Start → peak.
        #[serde(default)]
        attack: Phase,
        /// Peak → sustain.
        #[serde(default)]
        decay: Phase,
    },
    /// Ramp to `end_value`
    #[serde(rename_all = "camelCase")]
    Release {
        /// Value reached at the end of the release.
        #[serde(default)]
        end_value: f32,
        /// Release timing and curve.
        #[serde(default)]
        release: Phase,
    },
}
