//! Probe class registry.
//!
//! Maps `probeClass` names to factories. The registry is an explicit value
//! handed to each router, so isolated routers can coexist in one process.

use std::collections::HashMap;
use std::sync::Arc;

use crate::attributes::WritableAttributes;
use crate::error::ProbeResult;
use crate::probe::{ProbeBehavior, ProbeInit};

/// Creates probe behaviors for one registered class.
pub trait ProbeFactory: Send + Sync + 'static {
    /// Attributes monitors may write on instances of this class.
    fn writable_attributes(&self) -> WritableAttributes {
        WritableAttributes::None
    }

    /// Constructs the behavior of a new instance.
    ///
    /// Synchronous failures are surfaced to the connecting monitor; the
    /// asynchronous part of construction belongs in
    /// [`ProbeBehavior::initialize`].
    fn create(&self, init: ProbeInit) -> ProbeResult<Box<dyn ProbeBehavior>>;
}

impl<F> ProbeFactory for F
where
    F: Fn(ProbeInit) -> ProbeResult<Box<dyn ProbeBehavior>> + Send + Sync + 'static,
{
    fn create(&self, init: ProbeInit) -> ProbeResult<Box<dyn ProbeBehavior>> {
        self(init)
    }
}

/// A factory with an explicit writable set.
struct WithWritable<F> {
    factory: F,
    writable: WritableAttributes,
}

impl<F: ProbeFactory> ProbeFactory for WithWritable<F> {
    fn writable_attributes(&self) -> WritableAttributes {
        self.writable.clone()
    }

    fn create(&self, init: ProbeInit) -> ProbeResult<Box<dyn ProbeBehavior>> {
        self.factory.create(init)
    }
}

/// Registered probe classes, keyed by class name.
#[derive(Clone, Default)]
pub struct ProbeClasses {
    classes: HashMap<String, Arc<dyn ProbeFactory>>,
}

impl ProbeClasses {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `name`, replacing any previous class.
    pub fn register(&mut self, name: impl Into<String>, factory: impl ProbeFactory) -> &mut Self {
        self.classes.insert(name.into(), Arc::new(factory));
        self
    }

    /// Registers `factory` with an explicit writable set.
    pub fn register_writable(
        &mut self,
        name: impl Into<String>,
        writable: WritableAttributes,
        factory: impl ProbeFactory,
    ) -> &mut Self {
        self.register(name, WithWritable { factory, writable })
    }

    /// Returns the factory for `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ProbeFactory>> {
        self.classes.get(name).cloned()
    }

    /// Returns true if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    /// Returns the registered class names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.classes.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ProbeClasses {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeClasses")
            .field("classes", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeBehavior;

    struct Nothing;
    impl ProbeBehavior for Nothing {}

    fn nothing(_init: ProbeInit) -> ProbeResult<Box<dyn ProbeBehavior>> {
        Ok(Box::new(Nothing))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut classes = ProbeClasses::new();
        classes
            .register("B", nothing)
            .register_writable("A", WritableAttributes::All, nothing);

        assert!(classes.contains("A"));
        assert!(!classes.contains("C"));
        assert_eq!(classes.names(), vec!["A".to_string(), "B".to_string()]);

        let a = classes.get("A").unwrap();
        assert_eq!(a.writable_attributes(), WritableAttributes::All);
        let b = classes.get("B").unwrap();
        assert!(b.writable_attributes().is_empty());
    }

    #[test]
    fn test_registries_are_isolated() {
        let mut first = ProbeClasses::new();
        first.register("Only", nothing);
        let second = ProbeClasses::new();

        assert!(first.contains("Only"));
        assert!(!second.contains("Only"));
    }
}
