//! Database Custom Resource Definition

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer guarding cleanup of Database resources
pub const FINALIZER_NAME: &str = "db.platform.io/finalizer";

/// Label carried by every object the operator creates for an instance
pub const INSTANCE_LABEL: &str = "instance";

/// Label distinguishing the current/new/old credential slots
pub const ROTATION_LABEL: &str = "rotation";

/// Database resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "db.platform.io",
    version = "v1",
    kind = "Database",
    plural = "databases",
    singular = "database",
    shortname = "db",
    shortname = "dbs",
    namespaced,
    status = "DatabaseStatus",
    printcolumn = r#"{"name": "Engine", "type": "string", "jsonPath": ".spec.engine"}"#,
    printcolumn = r#"{"name": "Version", "type": "string", "jsonPath": ".spec.version"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Ready", "type": "integer", "jsonPath": ".status.readyReplicas"}"#,
    printcolumn = r#"{"name": "Endpoint", "type": "string", "jsonPath": ".status.endpoint"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// Database technology
    pub engine: Technology,

    /// Engine version (e.g. "16", "7.0.4")
    pub version: String,

    /// Named sizing profile
    #[serde(default = "default_profile")]
    pub profile: String,

    /// Deployment topology
    #[serde(default)]
    pub topology: TopologySpec,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageSpec,

    /// Compute resource requests and limits
    #[serde(default)]
    pub resources: ComputeResources,

    /// Networking configuration
    #[serde(default)]
    pub networking: NetworkingSpec,

    /// Backup policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupSpec>,

    /// Restore from an existing backup before the workload starts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreSpec>,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthSpec,

    /// Maintenance windows gating upgrades
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintenance: Option<MaintenanceSpec>,

    /// Lifecycle flags
    #[serde(default)]
    pub lifecycle: LifecycleSpec,

    /// Technology-specific configuration overrides
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub engine_config: BTreeMap<String, String>,
}

fn default_profile() -> String {
    "default".to_string()
}

/// Supported database technologies
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum Technology {
    PostgreSQL,
    MongoDB,
    Redis,
    Elasticsearch,
    SQLite,
}

impl Technology {
    /// Lowercase identifier used in labels and object names
    pub fn label(&self) -> &'static str {
        match self {
            Technology::PostgreSQL => "postgresql",
            Technology::MongoDB => "mongodb",
            Technology::Redis => "redis",
            Technology::Elasticsearch => "elasticsearch",
            Technology::SQLite => "sqlite",
        }
    }
}

impl fmt::Display for Technology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Technology::PostgreSQL => "PostgreSQL",
            Technology::MongoDB => "MongoDB",
            Technology::Redis => "Redis",
            Technology::Elasticsearch => "Elasticsearch",
            Technology::SQLite => "SQLite",
        };
        f.write_str(name)
    }
}

/// Topology specification
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TopologySpec {
    /// Topology mode
    #[serde(default)]
    pub mode: TopologyMode,

    /// Number of replicas
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Number of shards (Sharded mode only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shards: Option<i32>,

    /// Spread replicas across nodes
    #[serde(default)]
    pub anti_affinity: bool,
}

impl Default for TopologySpec {
    fn default() -> Self {
        Self {
            mode: TopologyMode::default(),
            replicas: default_replicas(),
            shards: None,
            anti_affinity: false,
        }
    }
}

fn default_replicas() -> i32 {
    1
}

/// Topology modes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum TopologyMode {
    #[default]
    Standalone,
    Replicated,
    Cluster,
    Sharded,
}

impl fmt::Display for TopologyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Storage specification
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Volume size (e.g., "10Gi")
    #[serde(default = "default_storage_size")]
    pub size: String,

    /// Storage class name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Volume mode (Filesystem or Block)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<String>,
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            size: default_storage_size(),
            storage_class_name: None,
            volume_mode: None,
        }
    }
}

fn default_storage_size() -> String {
    "10Gi".to_string()
}

/// Compute resource bounds
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComputeResources {
    /// CPU request (e.g., "500m")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory request (e.g., "1Gi")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    /// CPU limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,

    /// Memory limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

/// Networking specification
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkingSpec {
    /// Service type
    #[serde(default)]
    pub service_type: ServiceType,

    /// Service port (engine default when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    /// External DNS hostname annotation
    #[serde(rename = "externalDNS", skip_serializing_if = "Option::is_none")]
    pub external_dns: Option<String>,

    /// TLS configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSpec>,
}

/// Kubernetes Service types
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::ClusterIP => "ClusterIP",
            ServiceType::NodePort => "NodePort",
            ServiceType::LoadBalancer => "LoadBalancer",
        }
    }
}

/// TLS configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    /// Enable TLS
    #[serde(default)]
    pub enabled: bool,

    /// Secret holding tls.crt / tls.key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

/// Backup policy
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Enable scheduled backups
    #[serde(default)]
    pub enabled: bool,

    /// Cron schedule (5-field)
    #[serde(default = "default_backup_schedule")]
    pub schedule: String,

    /// Backup method
    #[serde(default)]
    pub method: BackupMethod,

    /// Number of successful backup runs to keep
    #[serde(default = "default_retention")]
    pub retention: i32,

    /// Backup destination
    #[serde(default)]
    pub destination: BackupDestination,
}

fn default_backup_schedule() -> String {
    "0 2 * * *".to_string()
}

fn default_retention() -> i32 {
    7
}

/// Backup methods
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum BackupMethod {
    #[default]
    Snapshot,
    Dump,
    WAL,
    Incremental,
}

impl fmt::Display for BackupMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Backup destination (exactly one of s3 or pvc)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupDestination {
    /// Object storage destination
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Destination>,

    /// Volume destination
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pvc: Option<PvcDestination>,
}

/// S3 destination
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct S3Destination {
    /// Bucket name
    pub bucket: String,

    /// AWS region
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Custom endpoint (MinIO etc.)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Secret with AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY
    pub credentials_secret: String,
}

/// PVC destination
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PvcDestination {
    /// Existing claim to write backups into
    pub claim_name: String,
}

/// Restore request
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    /// Backup to restore from
    pub backup_name: String,

    /// Optional point-in-time recovery target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub point_in_time: Option<DateTime<Utc>>,
}

/// Authentication configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthSpec {
    /// Name of the current credentials secret
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    /// External vault (Consul KV) integration
    #[serde(alias = "consul", skip_serializing_if = "Option::is_none")]
    pub vault: Option<VaultSpec>,

    /// Credential rotation policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation_policy: Option<RotationPolicy>,
}

/// External vault configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VaultSpec {
    #[serde(default)]
    pub enabled: bool,

    /// Base address, e.g. http://consul:8500
    #[serde(default)]
    pub address: String,

    /// KV path prefix for this instance's credentials
    #[serde(default)]
    pub path: String,

    /// Secret key holding the ACL token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_secret_ref: Option<SecretKeyRef>,
}

/// Reference to a key inside a Secret
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

/// Credential rotation policy
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RotationPolicy {
    #[serde(default)]
    pub enabled: bool,

    /// Cron schedule between rotations
    #[serde(default = "default_rotation_schedule")]
    pub schedule: String,

    /// Rotation strategy
    #[serde(default)]
    pub strategy: RotationStrategy,
}

fn default_rotation_schedule() -> String {
    "0 0 1 * *".to_string()
}

/// Rotation strategies
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum RotationStrategy {
    /// Grant a second credential, cut over, then revoke the first
    #[default]
    TwoPhase,
}

/// Maintenance configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceSpec {
    /// Windows during which upgrades may run
    #[serde(default)]
    pub windows: Vec<MaintenanceWindow>,

    /// Apply minor version upgrades automatically
    #[serde(default)]
    pub auto_upgrade: bool,
}

/// Weekly maintenance window
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceWindow {
    /// Day of week (0 = Sunday)
    pub day_of_week: u32,

    /// Start time "HH:MM"
    pub start_time: String,

    /// Window length, e.g. "4h" or "1h30m"
    pub duration: String,
}

/// Lifecycle flags
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleSpec {
    /// Stop reconciling until unset
    #[serde(default)]
    pub paused: bool,

    /// What happens to owned resources on deletion
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
}

/// Deletion policies
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum DeletionPolicy {
    #[default]
    Retain,
    Snapshot,
    Delete,
}

/// Top-level lifecycle phase
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Phase {
    #[default]
    Pending,
    Provisioning,
    Ready,
    Upgrading,
    Scaling,
    Healing,
    Failed,
    Paused,
    Deleting,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Credential rotation phase
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum RotationPhase {
    #[default]
    Idle,
    CreatingNew,
    Cutover,
    Revoking,
    Complete,
}

impl fmt::Display for RotationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Database status
///
/// Optional fields serialize as `null` so that a merge patch of the whole
/// status clears values that are no longer set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStatus {
    /// Current phase
    pub phase: Option<Phase>,

    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Connection endpoint (host:port)
    pub endpoint: Option<String>,

    /// Replicas reporting ready
    #[serde(default)]
    pub ready_replicas: i32,

    /// Version currently running
    pub current_version: Option<String>,

    /// Generation reflected by this status
    pub observed_generation: Option<i64>,

    /// Last successful backup
    pub last_backup: Option<DateTime<Utc>>,

    /// Health snapshot
    pub health: Option<HealthStatus>,

    /// Last completed reconciliation
    pub last_reconcile_time: Option<DateTime<Utc>>,

    /// Credential rotation progress
    pub rotation: Option<RotationStatus>,

    /// Restore progress
    pub restore: Option<RestoreStatus>,
}

/// Status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,

    /// Status (True, False, Unknown)
    pub status: String,

    /// Machine-readable CamelCase reason
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last transition time
    pub last_transition_time: DateTime<Utc>,

    /// Generation the condition was computed for
    pub observed_generation: Option<i64>,
}

/// Health snapshot
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// Healthy, Degraded, Unhealthy or Unknown
    pub status: String,

    pub message: Option<String>,

    pub last_check_time: DateTime<Utc>,
}

/// Credential rotation sub-status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RotationStatus {
    #[serde(default)]
    pub phase: RotationPhase,

    pub last_rotation: Option<DateTime<Utc>>,

    pub next_rotation: Option<DateTime<Utc>>,

    /// Execution unit of the active phase
    pub job_name: Option<String>,

    /// Completed rotations, used for deterministic unit names
    #[serde(default)]
    pub sequence: u32,

    /// Launch attempt within the active phase
    #[serde(default)]
    pub attempt: u32,

    /// When the active phase was entered
    pub phase_started_at: Option<DateTime<Utc>>,
}

/// Restore sub-status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStatus {
    pub backup_name: Option<String>,

    pub job_name: Option<String>,

    pub completed_at: Option<DateTime<Utc>>,
}

impl Database {
    /// Namespace, defaulting the same way the API server does
    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }

    /// Desired replica count
    pub fn desired_replicas(&self) -> i32 {
        self.spec.topology.replicas
    }

    /// Current phase, Pending when no status exists yet
    pub fn phase(&self) -> Phase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or_default()
    }

    /// Running version recorded in status
    pub fn current_version(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.current_version.as_deref())
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER_NAME)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn backup_enabled(&self) -> bool {
        self.spec.backup.as_ref().map(|b| b.enabled).unwrap_or(false)
    }

    pub fn rotation_enabled(&self) -> bool {
        self.spec
            .auth
            .rotation_policy
            .as_ref()
            .map(|p| p.enabled)
            .unwrap_or(false)
    }

    pub fn vault(&self) -> Option<&VaultSpec> {
        self.spec.auth.vault.as_ref().filter(|v| v.enabled)
    }

    /// Name of the "current" credentials secret
    pub fn credentials_secret_name(&self) -> String {
        self.spec
            .auth
            .secret_name
            .clone()
            .unwrap_or_else(|| format!("{}-credentials", self.name_any()))
    }

    /// Name of the transient "new" credentials secret
    pub fn new_credentials_secret_name(&self) -> String {
        format!("{}-new", self.credentials_secret_name())
    }

    /// Name of the transient "old" credentials secret
    pub fn old_credentials_secret_name(&self) -> String {
        format!("{}-old", self.credentials_secret_name())
    }

    pub fn data_claim_name(&self) -> String {
        format!("{}-data", self.name_any())
    }

    pub fn config_map_name(&self) -> String {
        format!("{}-config", self.name_any())
    }

    pub fn backup_schedule_name(&self) -> String {
        format!("{}-backup", self.name_any())
    }

    pub fn restore_job_name(&self) -> String {
        format!("{}-restore", self.name_any())
    }

    /// Labels identifying every object owned by this instance
    pub fn instance_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app".to_string(), "database".to_string()),
            ("engine".to_string(), self.spec.engine.label().to_string()),
            (INSTANCE_LABEL.to_string(), self.name_any()),
        ])
    }

    /// Label selector matching [`Database::instance_labels`]
    pub fn instance_selector(&self) -> String {
        format!("app=database,{}={}", INSTANCE_LABEL, self.name_any())
    }

    /// Controller owner reference pointing back at this Database
    pub fn owner_reference(&self) -> Option<OwnerReference> {
        self.controller_owner_ref(&())
    }

    /// Object key used in logs and the backoff map
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace_or_default(), self.name_any())
    }
}
