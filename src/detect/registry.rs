use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::backend::Detector;
use super::backends::{MotionDetector, ScriptedDetector};

/// Builds a fresh detector; every camera pipeline owns its own instance.
pub type DetectorFactory = Arc<dyn Fn() -> Box<dyn Detector> + Send + Sync>;

/// Named detector factories, selected by camera configuration.
#[derive(Clone)]
pub struct DetectorRegistry {
    factories: HashMap<String, DetectorFactory>,
    default_name: Option<String>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            default_name: None,
        }
    }

    /// Registry with the model-free backends: `motion` (default) and `none`.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            "motion",
            Arc::new(|| -> Box<dyn Detector> { Box::new(MotionDetector::default()) }),
        );
        registry.register(
            "none",
            Arc::new(|| -> Box<dyn Detector> { Box::new(ScriptedDetector::default()) }),
        );
        registry
    }

    /// Register a factory. The first registered factory becomes the default.
    pub fn register(&mut self, name: &str, factory: DetectorFactory) {
        if self.default_name.is_none() {
            self.default_name = Some(name.to_string());
        }
        self.factories.insert(name.to_string(), factory);
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.factories.contains_key(name) {
            return Err(anyhow!("detector '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// Build the named detector, or the default when `name` is `None`.
    pub fn build(&self, name: Option<&str>) -> Result<Box<dyn Detector>> {
        let name = name
            .or(self.default_name.as_deref())
            .ok_or_else(|| anyhow!("no detectors registered"))?;
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow!("detector '{}' not registered", name))?;
        Ok(factory())
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
