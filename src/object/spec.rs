//! Static port descriptors
//!
//! Every object type declares its inlets and outlets once, as `const` data.
//! The descriptors resolve structural handles (`inlet-2`) to names, decide
//! whether an audio edge binds to a parameter or a signal input, and coerce
//! incoming values.

use crate::audio::NodeGroup;
use crate::error::PatchError;
use crate::value::Value;

/// Semantic type of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortKind {
    /// Audio-rate connection
    Signal,
    /// Anything goes, passed through untouched
    Message,
    Bang,
    Float,
    Int,
    String,
    Bool,
    /// Sample arrays
    Floats,
    /// Marks an analyser feeding a consumer; never wired as audio
    Analysis,
}

/// One inlet or outlet.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PortSpec {
    pub name: &'static str,
    pub kind: PortKind,
    /// Receiving on a hot inlet triggers output; cold inlets only store
    pub hot: bool,
    /// Audio parameter an incoming edge or message is bound to
    pub param: Option<&'static str>,
    pub default: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub options: &'static [&'static str],
}

impl PortSpec {
    pub const fn new(name: &'static str, kind: PortKind) -> Self {
        Self {
            name,
            kind,
            hot: false,
            param: None,
            default: None,
            min: None,
            max: None,
            options: &[],
        }
    }

    pub const fn hot(self) -> Self {
        Self { hot: true, ..self }
    }

    pub const fn param(self, param: &'static str) -> Self {
        Self {
            param: Some(param),
            ..self
        }
    }

    pub const fn default_value(self, default: f64) -> Self {
        Self {
            default: Some(default),
            ..self
        }
    }

    pub const fn range(self, min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
            ..self
        }
    }

    pub const fn options(self, options: &'static [&'static str]) -> Self {
        Self { options, ..self }
    }

    /// Validate `value` against this port and convert it to the port's type.
    ///
    /// Numbers are clamped into range; scheduled messages pass through
    /// numeric ports untouched so they can reach the bound parameter.
    pub fn coerce(&self, value: Value) -> Result<Value, PatchError> {
        let reject = |reason| PatchError::InvalidInlet {
            inlet: self.name,
            reason,
        };
        match self.kind {
            PortKind::Signal | PortKind::Message | PortKind::Analysis => Ok(value),
            PortKind::Bang => Ok(Value::Bang),
            PortKind::Float | PortKind::Int => {
                if matches!(value, Value::Scheduled(_)) {
                    return Ok(value);
                }
                let number = value.as_f64().ok_or(reject("expected a number"))?;
                let number = self.clamp(number);
                Ok(match self.kind {
                    PortKind::Int => Value::Int(number.round() as i64),
                    _ => Value::Float(number),
                })
            }
            PortKind::Bool => match value {
                Value::Bool(b) => Ok(Value::Bool(b)),
                other => other
                    .as_f64()
                    .map(|n| Value::Bool(n != 0.0))
                    .ok_or(reject("expected a boolean")),
            },
            PortKind::String => {
                let text = match value {
                    Value::Str(s) => s,
                    Value::Int(i) => i.to_string(),
                    Value::Float(f) => f.to_string(),
                    _ => return Err(reject("expected a string")),
                };
                if self.options.is_empty() || self.options.contains(&text.as_str()) {
                    Ok(Value::Str(text))
                } else {
                    Err(reject("not one of the allowed options"))
                }
            }
            PortKind::Floats => match value {
                Value::Floats(samples) => Ok(Value::Floats(samples)),
                Value::List(items) => items
                    .iter()
                    .map(|item| item.as_f64().map(|n| n as f32))
                    .collect::<Option<Vec<_>>>()
                    .map(Value::Floats)
                    .ok_or(reject("expected a list of numbers")),
                _ => Err(reject("expected a list of numbers")),
            },
        }
    }

    fn clamp(&self, mut number: f64) -> f64 {
        if let Some(min) = self.min {
            number = number.max(min);
        }
        if let Some(max) = self.max {
            number = number.min(max);
        }
        number
    }
}

/// Shape of an object type.
#[derive(Clone, Copy, Debug)]
pub struct ObjectSpec {
    pub type_name: &'static str,
    /// Audio group; `None` for message-only objects
    pub group: Option<NodeGroup>,
    pub inlets: &'static [PortSpec],
    /// Objects with a variable number of outlets list one representative port
    pub outlets: &'static [PortSpec],
}

impl ObjectSpec {
    #[inline]
    pub fn is_audio(&self) -> bool {
        self.group.is_some()
    }

    #[inline]
    pub fn inlet(&self, index: usize) -> Option<&'static PortSpec> {
        self.inlets.get(index)
    }

    #[inline]
    pub fn outlet(&self, index: usize) -> Option<&'static PortSpec> {
        self.outlets.get(index)
    }

    /// Name and hotness of an inlet. Undeclared inlets are unnamed, and
    /// only the leftmost one is hot.
    pub fn resolve_inlet(&self, index: usize) -> (Option<&'static str>, bool) {
        match self.inlet(index) {
            Some(port) => (Some(port.name), port.hot),
            None => (None, index == 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GAIN: PortSpec = PortSpec::new("gain", PortKind::Float).param("gain").range(0.0, 2.0);
    const SHAPE: PortSpec = PortSpec::new("type", PortKind::String).options(&["sine", "square"]);

    #[test]
    fn numbers_are_clamped() {
        assert_eq!(GAIN.coerce(Value::Float(5.0)), Ok(Value::Float(2.0)));
        assert_eq!(GAIN.coerce(Value::Str("0.5".into())), Ok(Value::Float(0.5)));
        assert!(GAIN.coerce(Value::Bang).is_err());
    }

    #[test]
    fn ints_round() {
        let port = PortSpec::new("size", PortKind::Int);
        assert_eq!(port.coerce(Value::Float(2.6)), Ok(Value::Int(3)));
    }

    #[test]
    fn options_are_enforced() {
        assert_eq!(SHAPE.coerce(Value::from("sine")), Ok(Value::from("sine")));
        assert!(SHAPE.coerce(Value::from("noise")).is_err());
    }

    #[test]
    fn lists_become_floats() {
        let port = PortSpec::new("table", PortKind::Floats);
        let list = Value::List(vec![Value::Int(1), Value::Float(0.5)]);
        assert_eq!(port.coerce(list), Ok(Value::Floats(vec![1.0, 0.5])));
    }

    #[test]
    fn undeclared_inlets_resolve_by_position() {
        static SPEC: ObjectSpec = ObjectSpec {
            type_name: "test",
            group: None,
            inlets: &[PortSpec::new("left", PortKind::Float).hot(), PortSpec::new("right", PortKind::Float)],
            outlets: &[],
        };
        assert_eq!(SPEC.resolve_inlet(0), (Some("left"), true));
        assert_eq!(SPEC.resolve_inlet(1), (Some("right"), false));
        assert_eq!(SPEC.resolve_inlet(4), (None, false));
    }
}
