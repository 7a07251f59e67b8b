//! Built-in object types

pub mod audio;
pub mod control;
pub mod engine;

use crate::object::ObjectRegistry;
use crate::value::Value;

/// Register every built-in type.
pub fn register_builtins(registry: &mut ObjectRegistry) {
    audio::register(registry);
    control::register(registry);
    engine::register(registry);
}

/// Numeric creation argument at `index`, skipping `Null` placeholders.
pub(crate) fn number(params: &[Value], index: usize) -> Option<f64> {
    params.get(index).and_then(Value::as_f64)
}

/// Text creation argument at `index`.
pub(crate) fn text(params: &[Value], index: usize) -> Option<&str> {
    params.get(index).and_then(Value::as_str)
}
