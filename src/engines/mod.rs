//! Pluggable per-technology database engines
//!
//! Every managed technology implements [`Engine`]. The controller never
//! branches on technology itself; it resolves an engine through the
//! [`EngineRegistry`] and drives the lifecycle contract in a fixed order.

mod postgres;
mod registry;
pub mod resources;

pub use postgres::{PostgresEngine, POSTGRES_DATA_PATH, POSTGRES_PORT};
pub use registry::EngineRegistry;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;

use crate::crd::{Database, Technology};
use crate::error::{Error, Result};
use crate::platform::{Applied, PlatformClient};

/// Observed state of an engine's workload
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkloadState {
    /// Replicas requested on the workload object
    pub replicas: i32,
    /// Replicas reporting ready
    pub ready_replicas: i32,
    /// Version parsed from the container image tag
    pub version: Option<String>,
}

/// Health report produced by an engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthReport {
    /// Healthy, Degraded, Unhealthy or Unknown
    pub status: String,
    pub message: String,
}

impl HealthReport {
    /// Derive health purely from replica readiness
    pub fn from_workload(workload: Option<&WorkloadState>, desired: i32) -> Self {
        match workload {
            None => Self {
                status: "Unknown".to_string(),
                message: "Workload not created yet".to_string(),
            },
            Some(w) if w.ready_replicas >= desired => Self {
                status: "Healthy".to_string(),
                message: format!("{}/{} replicas ready", w.ready_replicas, desired),
            },
            Some(w) if w.ready_replicas > 0 => Self {
                status: "Degraded".to_string(),
                message: format!("{}/{} replicas ready", w.ready_replicas, desired),
            },
            Some(_) => Self {
                status: "Unhealthy".to_string(),
                message: format!("0/{} replicas ready", desired),
            },
        }
    }
}

/// Lifecycle contract implemented once per technology
///
/// `ensure_*` methods are create-or-update and must be idempotent. Operations
/// an engine does not support yet return [`Error::NotImplemented`], which the
/// controller reports like any other error.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Technology served by this engine
    fn technology(&self) -> Technology;

    /// Port the service listens on when the spec sets none
    fn default_port(&self) -> i32;

    /// Administrative username written into fresh credentials
    fn default_username(&self) -> &'static str;

    /// Technology-specific spec checks
    fn validate(&self, db: &Database) -> Result<()>;

    /// Deterministic connection address derived from resource identity
    fn endpoint(&self, db: &Database) -> String {
        let port = db.spec.networking.port.unwrap_or_else(|| self.default_port());
        format!(
            "{}.{}.svc.cluster.local:{}",
            db.name_any(),
            db.namespace_or_default(),
            port
        )
    }

    /// Storage volume claim
    async fn ensure_storage(&self, client: &PlatformClient, db: &Database) -> Result<Applied>;

    /// Engine configuration (credentials are handled by the caller)
    async fn ensure_config(&self, client: &PlatformClient, db: &Database) -> Result<Applied>;

    /// Network endpoint selecting the workload's pods
    async fn ensure_service(&self, client: &PlatformClient, db: &Database) -> Result<Applied>;

    /// Workload running `version`; existing replica counts are preserved
    async fn ensure_workload(
        &self,
        client: &PlatformClient,
        db: &Database,
        version: &str,
    ) -> Result<Applied>;

    /// Move the workload to the desired replica count
    async fn scale(&self, client: &PlatformClient, db: &Database) -> Result<()>;

    /// Move the workload to the desired version
    async fn upgrade(&self, client: &PlatformClient, db: &Database) -> Result<()>;

    /// Current workload state, `None` if it does not exist
    async fn observe(&self, client: &PlatformClient, db: &Database) -> Result<Option<WorkloadState>> {
        let namespace = db.namespace_or_default();
        let sts = client.get::<StatefulSet>(&namespace, &db.name_any()).await?;
        Ok(sts.map(|s| resources::statefulset_state(&s)))
    }

    /// One-shot backup, returning the execution unit name
    async fn backup(&self, _client: &PlatformClient, _db: &Database) -> Result<String> {
        Err(Error::not_implemented(self.technology(), "backup"))
    }

    /// Engine-driven restore
    async fn restore(&self, _client: &PlatformClient, _db: &Database) -> Result<()> {
        Err(Error::not_implemented(self.technology(), "restore"))
    }

    /// Engine-native credential rotation
    async fn rotate_auth(&self, _client: &PlatformClient, _db: &Database) -> Result<()> {
        Err(Error::not_implemented(self.technology(), "credential rotation"))
    }

    /// Self-healing pass
    async fn heal(&self, _client: &PlatformClient, _db: &Database) -> Result<()> {
        Err(Error::not_implemented(self.technology(), "heal"))
    }

    /// Engine-level health probe
    async fn health(&self, _client: &PlatformClient, _db: &Database) -> Result<HealthReport> {
        Err(Error::not_implemented(self.technology(), "status"))
    }
}
