//! Technology to engine mapping

use std::collections::HashMap;
use std::sync::Arc;

use crate::crd::Technology;
use crate::error::{Error, Result};

use super::{Engine, PostgresEngine};

/// Explicit map of technologies to engines, built at startup and injected
/// into the controller context
#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: HashMap<Technology, Arc<dyn Engine>>,
}

impl EngineRegistry {
    /// Empty registry; every lookup fails until engines are registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every engine shipped in this crate
    pub fn with_builtin_engines() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PostgresEngine::new()));
        registry
    }

    /// Register an engine under its own technology, replacing any previous one
    pub fn register(&mut self, engine: Arc<dyn Engine>) {
        self.engines.insert(engine.technology(), engine);
    }

    /// Look up the engine for a technology
    pub fn resolve(&self, technology: Technology) -> Result<Arc<dyn Engine>> {
        self.engines
            .get(&technology)
            .cloned()
            .ok_or(Error::UnimplementedEngine(technology))
    }

    /// Registered technologies
    pub fn technologies(&self) -> Vec<Technology> {
        self.engines.keys().copied().collect()
    }
}
