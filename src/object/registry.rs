//! Object type registry: type name to descriptors and factory.

use hashbrown::HashMap;
use itertools::Itertools;

use super::spec::ObjectSpec;
use super::PatchObject;

pub type ObjectFactory = fn() -> Box<dyn PatchObject>;

#[derive(Default)]
pub struct ObjectRegistry {
    entries: HashMap<&'static str, (&'static ObjectSpec, ObjectFactory)>,
}

impl ObjectRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in object type.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::objects::register_builtins(&mut registry);
        registry
    }

    /// Register a type under its spec's name, replacing any previous entry.
    pub fn register(&mut self, spec: &'static ObjectSpec, factory: ObjectFactory) {
        if self.entries.insert(spec.type_name, (spec, factory)).is_some() {
            tracing::debug!(type_name = spec.type_name, "object type replaced");
        }
    }

    pub fn spec(&self, type_name: &str) -> Option<&'static ObjectSpec> {
        self.entries.get(type_name).map(|(spec, _)| *spec)
    }

    /// Build a fresh, uninitialised instance of `type_name`.
    pub fn instantiate(&self, type_name: &str) -> Option<(&'static ObjectSpec, Box<dyn PatchObject>)> {
        self.entries
            .get(type_name)
            .map(|(spec, factory)| (*spec, factory()))
    }

    /// Registered type names, sorted.
    pub fn types(&self) -> Vec<&'static str> {
        self.entries.keys().copied().sorted().collect()
    }
}
