//! Harness registry -- a named collection of available harness adapters.
//!
//! The loop looks up harnesses by name at runtime (a task's `model:`
//! label picks a model, not a harness; harness selection is a run-level
//! flag/config value).

use std::collections::HashMap;

use super::trait_def::Harness;

/// A collection of registered [`Harness`] implementations, keyed by name.
#[derive(Default)]
pub struct HarnessRegistry {
    harnesses: HashMap<String, Box<dyn Harness>>,
}

impl HarnessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a harness adapter under the name returned by
    /// [`Harness::name`]. Replaces (and returns) any existing registration.
    pub fn register(&mut self, harness: impl Harness + 'static) -> Option<Box<dyn Harness>> {
        let name = harness.name().to_string();
        self.harnesses.insert(name, Box::new(harness))
    }

    pub fn get(&self, name: &str) -> Option<&dyn Harness> {
        self.harnesses.get(name).map(|b| b.as_ref())
    }

    /// Names of all registered harnesses, in no particular order.
    pub fn list(&self) -> Vec<&str> {
        self.harnesses.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.harnesses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.harnesses.is_empty()
    }
}

impl std::fmt::Debug for HarnessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarnessRegistry")
            .field("harnesses", &self.harnesses.keys().collect::<Vec<_>>())
            .finish()
    }
}
