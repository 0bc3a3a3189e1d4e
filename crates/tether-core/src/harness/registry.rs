//! Harness registry -- a named collection of available harness adapters.
//!
//! Lets the client pick an agent by name at runtime (e.g. `--agent cursor`).

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

    /// Register under [`Harness::name`], returning any harness it replaces.
    pub fn register(&mut self, harness: impl Harness + 'static) -> Option<Box<dyn Harness>> {
        let name = harness.name().to_string();
        self.harnesses.insert(name, Box::new(harness))
    }

    pub fn get(&self, name: &str) -> Option<&dyn Harness> {
        self.harnesses.get(name).map(|b| b.as_ref())
    }

    /// Remove a harness, handing ownership back (e.g. to disconnect it).
    pub fn remove(&mut self, name: &str) -> Option<Box<dyn Harness>> {
        self.harnesses.remove(name)
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.harnesses.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
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
            .field("harnesses", &self.list())
            .finish()
    }
}
