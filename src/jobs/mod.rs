//! Asynchronous execution units
//!
//! Backup, restore and the grant/revoke steps of credential rotation run as
//! Kubernetes Jobs. The controller launches them and polls for completion;
//! it never waits on one inside a reconciliation cycle.

pub mod backup;
pub mod commands;
pub mod restore;

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, PersistentVolumeClaimVolumeSource, PodSpec,
    PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::crd::{BackupDestination, Database};
use crate::engines::resources::{env, own, secret_env};
use crate::error::{Error, Result};
use crate::platform::PlatformClient;

/// Label carrying the execution unit's purpose
pub const JOB_TYPE_LABEL: &str = "job-type";

/// Where backup material is mounted inside execution units
pub const BACKUP_MOUNT_PATH: &str = "/backup";

/// Pod retries before a unit is reported Failed
const BACKOFF_LIMIT: i32 = 3;
const TTL_AFTER_FINISHED_SECS: i32 = 86_400;

/// Completion state reported by [`poll`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnitState {
    Running,
    Succeeded,
    Failed(String),
}

/// Everything needed to run one script in a container
#[derive(Clone, Debug)]
pub struct ExecutionUnit {
    /// Deterministic unit name; relaunching with the same name adopts
    pub name: String,
    /// Value of the `job-type` label
    pub job_type: &'static str,
    pub image: String,
    /// Shell script run with `sh -c`
    pub script: String,
    pub env: Vec<EnvVar>,
    pub volumes: Vec<Volume>,
    pub mounts: Vec<VolumeMount>,
}

impl ExecutionUnit {
    pub fn new(name: impl Into<String>, job_type: &'static str, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            job_type,
            image: image.into(),
            script: String::new(),
            env: Vec::new(),
            volumes: Vec::new(),
            mounts: Vec::new(),
        }
    }

    pub fn script(mut self, script: impl Into<String>) -> Self {
        self.script = script.into();
        self
    }

    pub fn env(mut self, vars: impl IntoIterator<Item = EnvVar>) -> Self {
        self.env.extend(vars);
        self
    }

    pub fn volume(mut self, volume: Volume, mount_path: &str) -> Self {
        self.mounts.push(VolumeMount {
            name: volume.name.clone(),
            mount_path: mount_path.to_string(),
            ..Default::default()
        });
        self.volumes.push(volume);
        self
    }

    fn labels(&self, db: &Database) -> BTreeMap<String, String> {
        let mut labels = db.instance_labels();
        labels.insert(JOB_TYPE_LABEL.to_string(), self.job_type.to_string());
        labels
    }

    /// Job spec for this unit; shared by one-shot Jobs and CronJob templates
    pub fn job_spec(&self, db: &Database) -> JobSpec {
        JobSpec {
            backoff_limit: Some(BACKOFF_LIMIT),
            ttl_seconds_after_finished: Some(TTL_AFTER_FINISHED_SECS),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(self.labels(db)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: self.job_type.to_string(),
                        image: Some(self.image.clone()),
                        command: Some(vec![
                            "/bin/sh".to_string(),
                            "-c".to_string(),
                            self.script.clone(),
                        ]),
                        env: Some(self.env.clone()),
                        volume_mounts: Some(self.mounts.clone()),
                        ..Default::default()
                    }],
                    volumes: Some(self.volumes.clone()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }
    }

    /// Owned Job object
    pub fn to_job(&self, db: &Database) -> Job {
        let mut job = Job {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(db.namespace_or_default()),
                labels: Some(self.labels(db)),
                ..Default::default()
            },
            spec: Some(self.job_spec(db)),
            ..Default::default()
        };
        own(&mut job.metadata, db);
        job
    }
}

/// Environment giving a unit connection details and the current credentials
///
/// Credentials are referenced through secret key selectors; their values
/// never pass through the controller into the Job object.
pub fn connection_env(db: &Database, endpoint: &str, credentials_secret: &str) -> Vec<EnvVar> {
    let (host, port) = match endpoint.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.to_string()),
        None => (endpoint.to_string(), String::new()),
    };
    vec![
        env("DB_NAME", db.name_any()),
        env("DB_HOST", host),
        env("DB_PORT", port),
        secret_env("DB_USER", credentials_secret, "username"),
        secret_env("DB_PASSWORD", credentials_secret, "password"),
    ]
}

/// Volume and environment exposing a backup destination at [`BACKUP_MOUNT_PATH`]
///
/// PVC destinations are mounted directly. S3 destinations get scratch space
/// plus the variables the scripts use to sync with the bucket.
pub fn destination(destination: &BackupDestination) -> (Volume, Vec<EnvVar>) {
    let mut vars = Vec::new();
    let volume = match &destination.pvc {
        Some(pvc) => Volume {
            name: "backup".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pvc.claim_name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        },
        None => Volume {
            name: "backup".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    };

    if let Some(s3) = &destination.s3 {
        vars.push(secret_env("AWS_ACCESS_KEY_ID", &s3.credentials_secret, "access_key_id"));
        vars.push(secret_env(
            "AWS_SECRET_ACCESS_KEY",
            &s3.credentials_secret,
            "secret_access_key",
        ));
        vars.push(env("S3_BUCKET", s3.bucket.clone()));
        if let Some(region) = &s3.region {
            vars.push(env("AWS_REGION", region.clone()));
        }
        if let Some(endpoint) = &s3.endpoint {
            vars.push(env("S3_ENDPOINT", endpoint.clone()));
        }
    }
    (volume, vars)
}

/// Launch a unit, adopting an existing Job of the same name
pub async fn launch(client: &PlatformClient, db: &Database, unit: &ExecutionUnit) -> Result<String> {
    let namespace = db.namespace_or_default();
    if client.get::<Job>(&namespace, &unit.name).await?.is_some() {
        debug!(job = %unit.name, "Adopting existing execution unit");
        return Ok(unit.name.clone());
    }

    match client.create(&namespace, &unit.to_job(db)).await {
        Ok(_) => {
            info!(
                job = %unit.name,
                job_type = unit.job_type,
                namespace = %namespace,
                "Launched execution unit"
            );
            Ok(unit.name.clone())
        }
        // Lost a race with a concurrent create of the same deterministic name
        Err(e) if e.is_conflict() => Ok(unit.name.clone()),
        Err(e) => Err(e),
    }
}

/// Completion state of a Job
pub fn job_state(job: &Job) -> UnitState {
    let Some(status) = &job.status else {
        return UnitState::Running;
    };
    for condition in status.conditions.iter().flatten() {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" | "SuccessCriteriaMet" => return UnitState::Succeeded,
            "Failed" | "FailureTarget" => {
                let reason = condition
                    .message
                    .clone()
                    .or_else(|| condition.reason.clone())
                    .unwrap_or_else(|| "job failed".to_string());
                return UnitState::Failed(reason);
            }
            _ => {}
        }
    }
    if status.succeeded.unwrap_or(0) > 0 && status.active.unwrap_or(0) == 0 {
        return UnitState::Succeeded;
    }
    UnitState::Running
}

/// Poll a unit; a unit that no longer exists is an error
pub async fn poll(client: &PlatformClient, namespace: &str, name: &str) -> Result<UnitState> {
    let job = client
        .get::<Job>(namespace, name)
        .await?
        .ok_or_else(|| Error::ExecutionUnitMissing(name.to_string()))?;
    Ok(job_state(&job))
}

/// Delete a unit so a fresh one can be launched
pub async fn remove(client: &PlatformClient, namespace: &str, name: &str) -> Result<()> {
    if client.delete::<Job>(namespace, name).await? {
        debug!(job = %name, "Removed execution unit");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DatabaseSpec, PvcDestination, S3Destination};
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};

    fn database() -> Database {
        let spec: DatabaseSpec =
            serde_yaml::from_str("engine: PostgreSQL\nversion: \"16\"\n").unwrap();
        let mut db = Database::new("orders", spec);
        db.metadata.namespace = Some("shop".to_string());
        db.metadata.uid = Some("uid-1".to_string());
        db
    }

    fn job_with(condition: &str, status: &str) -> Job {
        Job {
            status: Some(JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: condition.to_string(),
                    status: status.to_string(),
                    message: Some("BackoffLimitExceeded".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_job_state_from_conditions() {
        assert_eq!(job_state(&Job::default()), UnitState::Running);
        assert_eq!(job_state(&job_with("Complete", "True")), UnitState::Succeeded);
        assert_eq!(
            job_state(&job_with("Failed", "True")),
            UnitState::Failed("BackoffLimitExceeded".to_string())
        );
        assert_eq!(job_state(&job_with("Failed", "False")), UnitState::Running);
    }

    #[test]
    fn test_job_is_owned_and_labelled() {
        let db = database();
        let unit = ExecutionUnit::new("orders-restore", "restore", "postgres:16").script("true");
        let job = unit.to_job(&db);
        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(JOB_TYPE_LABEL).unwrap(), "restore");
        assert_eq!(labels.get("instance").unwrap(), "orders");
        assert_eq!(job.metadata.owner_references.as_ref().unwrap()[0].uid, "uid-1");

        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(3));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
    }

    #[test]
    fn test_connection_env_references_secret() {
        let db = database();
        let vars = connection_env(&db, "orders.shop.svc.cluster.local:5432", "orders-credentials");
        let host = vars.iter().find(|v| v.name == "DB_HOST").unwrap();
        assert_eq!(host.value.as_deref(), Some("orders.shop.svc.cluster.local"));
        let password = vars.iter().find(|v| v.name == "DB_PASSWORD").unwrap();
        assert!(password.value.is_none());
        assert!(password.value_from.is_some());
    }

    #[test]
    fn test_destination_pvc_and_s3() {
        let (volume, vars) = destination(&BackupDestination {
            s3: None,
            pvc: Some(PvcDestination {
                claim_name: "backups".to_string(),
            }),
        });
        assert_eq!(volume.persistent_volume_claim.unwrap().claim_name, "backups");
        assert!(vars.is_empty());

        let (volume, vars) = destination(&BackupDestination {
            s3: Some(S3Destination {
                bucket: "db-backups".to_string(),
                region: Some("eu-west-1".to_string()),
                endpoint: None,
                credentials_secret: "s3-creds".to_string(),
            }),
            pvc: None,
        });
        assert!(volume.empty_dir.is_some());
        let names: Vec<_> = vars.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(
            names,
            ["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY", "S3_BUCKET", "AWS_REGION"]
        );
    }
}
