use std::{collections::HashMap, fmt};

use super::{ModelVariant, VariantError};

/// Builds a fresh model variant.
pub type VariantFactory = Box<dyn Fn() -> Box<dyn ModelVariant> + Send + Sync>;

/// The model variants a device knows, keyed by model name.
#[derive(Default)]
pub struct VariantRegistry {
    factories: HashMap<String, VariantFactory>,
}

impl fmt::Debug for VariantRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariantRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl VariantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a variant. A variant registered under the same name is replaced.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn ModelVariant> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// # Errors
    /// Fails if no variant is registered under `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn ModelVariant>, VariantError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| VariantError::Unknown(name.to_string()))
    }

    /// The registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
