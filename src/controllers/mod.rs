//! Kubernetes controller for the Database CRD
//!
//! This module contains the controller that watches Databases and their
//! owned objects and triggers reconciliation.

mod backoff;
mod database_controller;

pub use backoff::ErrorBackoff;
pub use database_controller::run as run_database_controller;

use std::sync::Arc;

use crate::adapters::ExternalSecretStore;
use crate::config::OperatorConfig;
use crate::credentials::CredentialRotationManager;
use crate::engines::EngineRegistry;
use crate::platform::PlatformClient;

/// Shared context for the controller
pub struct Context {
    /// Platform access
    pub client: PlatformClient,
    /// Engines by technology
    pub registry: EngineRegistry,
    /// External vault for credential mirroring
    pub store: Arc<dyn ExternalSecretStore>,
    /// Credential rotation driver
    pub rotation: CredentialRotationManager,
    /// Operator settings
    pub config: OperatorConfig,
    /// Per-resource error backoff
    pub backoff: ErrorBackoff,
}

impl Context {
    /// Create a new context
    pub fn new(
        client: PlatformClient,
        registry: EngineRegistry,
        store: Arc<dyn ExternalSecretStore>,
        config: OperatorConfig,
    ) -> Self {
        let rotation = CredentialRotationManager::new(client.clone(), store.clone());
        let backoff = ErrorBackoff::new(config.error_backoff_base, config.error_backoff_max);
        Self {
            client,
            registry,
            store,
            rotation,
            config,
            backoff,
        }
    }
}
