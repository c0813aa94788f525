//! Two-phase credential rotation
//!
//! ```text
//! Idle -> CreatingNew -> Cutover -> Revoking -> Complete -> Idle
//! ```
//!
//! [`CredentialRotationManager::advance`] performs at most one transition
//! per call and never waits on an execution unit. All progress lives in
//! [`RotationStatus`], which the caller persists after every call, so a
//! restarted controller resumes exactly where the previous one stopped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::{info, warn};

use super::{generate_password, generate_username, write_slot, SecretSlot};
use crate::adapters::{
    credentials_from_secret, get_credentials, resolve_target, Credentials, ExternalSecretStore,
};
use crate::crd::{Database, RotationPhase, RotationStatus};
use crate::engines::resources::{env, secret_env};
use crate::engines::Engine;
use crate::error::{Error, Result};
use crate::jobs::{self, commands, connection_env, ExecutionUnit, UnitState};
use crate::platform::PlatformClient;
use crate::progress::Progress;
use crate::schedule::{next_after, parse_schedule};

/// Requeue hint while a rotation is in flight
pub const ROTATION_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Drives the rotation protocol for one Database at a time
#[derive(Clone)]
pub struct CredentialRotationManager {
    client: PlatformClient,
    store: Arc<dyn ExternalSecretStore>,
}

impl CredentialRotationManager {
    pub fn new(client: PlatformClient, store: Arc<dyn ExternalSecretStore>) -> Self {
        Self { client, store }
    }

    /// Next scheduled rotation, anchored at the last one or at creation
    pub fn next_rotation(
        db: &Database,
        status: Option<&RotationStatus>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let Some(policy) = db.spec.auth.rotation_policy.as_ref().filter(|p| p.enabled) else {
            return Ok(None);
        };
        let schedule = parse_schedule(&policy.schedule)?;
        let anchor = status
            .and_then(|s| s.last_rotation)
            .or_else(|| db.creation_timestamp().map(|t| t.0))
            .unwrap_or(now);
        Ok(next_after(&schedule, anchor))
    }

    /// Whether [`Self::advance`] has work to do
    ///
    /// An in-flight rotation is always due; it is finished even when the
    /// policy was disabled in the meantime.
    pub fn is_due(db: &Database, status: Option<&RotationStatus>, now: DateTime<Utc>) -> Result<bool> {
        if status.is_some_and(|s| s.phase != RotationPhase::Idle) {
            return Ok(true);
        }
        Ok(Self::next_rotation(db, status, now)?.is_some_and(|next| now >= next))
    }

    /// Non-Idle for longer than `threshold`
    pub fn is_stalled(status: &RotationStatus, now: DateTime<Utc>, threshold: Duration) -> bool {
        if status.phase == RotationPhase::Idle {
            return false;
        }
        let Some(started) = status.phase_started_at else {
            return false;
        };
        chrono::Duration::from_std(threshold).is_ok_and(|threshold| now - started > threshold)
    }

    /// Perform at most one rotation transition
    ///
    /// `status` is updated in place even when an error is returned; the
    /// caller must persist it either way.
    pub async fn advance(
        &self,
        db: &Database,
        engine: &dyn Engine,
        status: &mut RotationStatus,
        now: DateTime<Utc>,
    ) -> Result<Progress> {
        let from = status.phase;
        let result = match status.phase {
            RotationPhase::Idle => self.begin(db, engine, status, now).await,
            RotationPhase::CreatingNew => self.await_grant(db, engine, status, now).await,
            RotationPhase::Cutover => self.cutover(db, engine, status, now).await,
            RotationPhase::Revoking => self.await_revoke(db, engine, status, now).await,
            RotationPhase::Complete => Ok(Self::finish(db, status, now)),
        };
        if status.phase != from {
            info!(
                name = %db.name_any(),
                namespace = %db.namespace_or_default(),
                from = %from,
                to = %status.phase,
                sequence = status.sequence,
                "Credential rotation transition"
            );
        }
        result
    }

    /// Idle -> CreatingNew
    async fn begin(
        &self,
        db: &Database,
        engine: &dyn Engine,
        status: &mut RotationStatus,
        now: DateTime<Utc>,
    ) -> Result<Progress> {
        let namespace = db.namespace_or_default();

        // An "old" secret at Idle is left over from an aborted rotation
        self.client
            .delete::<Secret>(&namespace, &db.old_credentials_secret_name())
            .await?;

        let new_credentials = match self
            .client
            .get::<Secret>(&namespace, &db.new_credentials_secret_name())
            .await?
        {
            Some(existing) => credentials_from_secret(&existing)?,
            None => Credentials {
                username: generate_username(engine.default_username()),
                password: generate_password(),
            },
        };
        write_slot(&self.client, db, SecretSlot::New, &new_credentials).await?;

        if let Some(target) = resolve_target(&self.client, db).await? {
            self.store
                .put(&target.child("next"), &new_credentials.to_map())
                .await?;
        }

        status.attempt = 0;
        let job_name = jobs::launch(&self.client, db, &grant_unit(db, engine, status)?).await?;
        enter(status, RotationPhase::CreatingNew, now);
        status.job_name = Some(job_name);
        Ok(in_progress())
    }

    /// CreatingNew -> Cutover once the grant unit succeeded
    async fn await_grant(
        &self,
        db: &Database,
        engine: &dyn Engine,
        status: &mut RotationStatus,
        now: DateTime<Utc>,
    ) -> Result<Progress> {
        let Some(job_name) = status.job_name.clone() else {
            let unit = grant_unit(db, engine, status)?;
            status.job_name = Some(jobs::launch(&self.client, db, &unit).await?);
            return Ok(in_progress());
        };

        if self.poll(db, &job_name, status).await? {
            enter(status, RotationPhase::Cutover, now);
        }
        Ok(in_progress())
    }

    /// Cutover -> Revoking
    ///
    /// Sub-steps are skipped when already applied, so an interrupted
    /// cutover resumes without repeating work.
    async fn cutover(
        &self,
        db: &Database,
        engine: &dyn Engine,
        status: &mut RotationStatus,
        now: DateTime<Utc>,
    ) -> Result<Progress> {
        let namespace = db.namespace_or_default();
        let new_secret = self
            .client
            .get::<Secret>(&namespace, &db.new_credentials_secret_name())
            .await?;
        let old_exists = self
            .client
            .get::<Secret>(&namespace, &db.old_credentials_secret_name())
            .await?
            .is_some();

        match new_secret {
            Some(new_secret) => {
                let new_credentials = credentials_from_secret(&new_secret)?;
                if !old_exists {
                    let current =
                        get_credentials(&self.client, &namespace, &db.credentials_secret_name())
                            .await?;
                    write_slot(&self.client, db, SecretSlot::Old, &current).await?;
                }
                write_slot(&self.client, db, SecretSlot::Current, &new_credentials).await?;
                self.client
                    .delete::<Secret>(&namespace, &db.new_credentials_secret_name())
                    .await?;
            }
            // Promotion already happened before an interruption
            None if old_exists => {}
            None => {
                reset(status);
                return Err(Error::SecretNotFound(format!(
                    "{}/{} (rotation aborted)",
                    namespace,
                    db.new_credentials_secret_name()
                )));
            }
        }

        if let Some(target) = resolve_target(&self.client, db).await? {
            let current =
                get_credentials(&self.client, &namespace, &db.credentials_secret_name()).await?;
            self.store.put(&target, &current.to_map()).await?;
        }

        status.attempt = 0;
        let job_name = jobs::launch(&self.client, db, &revoke_unit(db, engine, status)?).await?;
        enter(status, RotationPhase::Revoking, now);
        status.job_name = Some(job_name);
        Ok(in_progress())
    }

    /// Revoking -> Complete once the revoke unit succeeded
    async fn await_revoke(
        &self,
        db: &Database,
        engine: &dyn Engine,
        status: &mut RotationStatus,
        now: DateTime<Utc>,
    ) -> Result<Progress> {
        let namespace = db.namespace_or_default();
        let old_name = db.old_credentials_secret_name();
        if self.client.get::<Secret>(&namespace, &old_name).await?.is_none() {
            enter(status, RotationPhase::Complete, now);
            return Ok(in_progress());
        }

        let Some(job_name) = status.job_name.clone() else {
            let unit = revoke_unit(db, engine, status)?;
            status.job_name = Some(jobs::launch(&self.client, db, &unit).await?);
            return Ok(in_progress());
        };

        if self.poll(db, &job_name, status).await? {
            self.client.delete::<Secret>(&namespace, &old_name).await?;
            enter(status, RotationPhase::Complete, now);
        }
        Ok(in_progress())
    }

    /// Complete -> Idle, scheduling the next rotation
    fn finish(db: &Database, status: &mut RotationStatus, now: DateTime<Utc>) -> Progress {
        status.last_rotation = Some(now);
        status.sequence += 1;
        reset(status);
        status.next_rotation = Self::next_rotation(db, Some(status), now).ok().flatten();
        Progress::Complete
    }

    /// Poll the recorded unit, true once it succeeded
    ///
    /// A failed or vanished unit is cleared and the attempt counter bumped,
    /// so the next call launches a fresh unit.
    async fn poll(&self, db: &Database, job_name: &str, status: &mut RotationStatus) -> Result<bool> {
        let namespace = db.namespace_or_default();
        match jobs::poll(&self.client, &namespace, job_name).await {
            Ok(UnitState::Running) => Ok(false),
            Ok(UnitState::Succeeded) => Ok(true),
            Ok(UnitState::Failed(reason)) => {
                warn!(
                    name = %db.name_any(),
                    job = %job_name,
                    phase = %status.phase,
                    "Rotation execution unit failed"
                );
                jobs::remove(&self.client, &namespace, job_name).await?;
                status.job_name = None;
                status.attempt += 1;
                Err(Error::ExecutionFailed {
                    unit: job_name.to_string(),
                    reason,
                })
            }
            Err(e @ Error::ExecutionUnitMissing(_)) => {
                status.job_name = None;
                status.attempt += 1;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

fn in_progress() -> Progress {
    Progress::deferred("RotationInProgress", ROTATION_POLL_INTERVAL)
}

fn enter(status: &mut RotationStatus, phase: RotationPhase, now: DateTime<Utc>) {
    status.phase = phase;
    status.phase_started_at = Some(now);
    status.job_name = None;
    status.attempt = 0;
}

fn reset(status: &mut RotationStatus) {
    status.phase = RotationPhase::Idle;
    status.phase_started_at = None;
    status.job_name = None;
    status.attempt = 0;
}

/// Deterministic unit name for a rotation step
pub fn unit_name(db: &Database, status: &RotationStatus, step: &str) -> String {
    format!(
        "{}-rot-{}-{}-{}",
        db.name_any(),
        status.sequence,
        step,
        status.attempt
    )
}

fn client_image(db: &Database, engine: &dyn Engine) -> Result<String> {
    let version = db.current_version().unwrap_or(&db.spec.version);
    commands::client_image(engine.technology(), version)
}

fn grant_unit(db: &Database, engine: &dyn Engine, status: &RotationStatus) -> Result<ExecutionUnit> {
    let script = commands::grant_script(engine.technology())?;
    let new_secret = db.new_credentials_secret_name();
    Ok(
        ExecutionUnit::new(unit_name(db, status, "grant"), "rotation", client_image(db, engine)?)
            .script(script)
            .env(connection_env(
                db,
                &engine.endpoint(db),
                &db.credentials_secret_name(),
            ))
            .env([
                secret_env("NEW_USERNAME", &new_secret, "username"),
                secret_env("NEW_PASSWORD", &new_secret, "password"),
                env("ROTATION_SEQUENCE", status.sequence.to_string()),
            ]),
    )
}

fn revoke_unit(db: &Database, engine: &dyn Engine, status: &RotationStatus) -> Result<ExecutionUnit> {
    let script = commands::revoke_script(engine.technology())?;
    Ok(
        ExecutionUnit::new(unit_name(db, status, "revoke"), "rotation", client_image(db, engine)?)
            .script(script)
            .env(connection_env(
                db,
                &engine.endpoint(db),
                &db.credentials_secret_name(),
            ))
            .env([
                secret_env("OLD_USERNAME", &db.old_credentials_secret_name(), "username"),
                env("ROTATION_SEQUENCE", status.sequence.to_string()),
            ]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DatabaseSpec;
    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn database() -> Database {
        let spec: DatabaseSpec = serde_yaml::from_str(
            r#"
engine: PostgreSQL
version: "16"
auth:
  rotationPolicy:
    enabled: true
    schedule: "0 0 1 * *"
"#,
        )
        .unwrap();
        let mut db = Database::new("orders", spec);
        db.metadata.namespace = Some("shop".to_string());
        db.metadata.creation_timestamp =
            Some(Time(Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()));
        db
    }

    #[test]
    fn test_first_rotation_anchored_at_creation() {
        let db = database();
        let next = CredentialRotationManager::next_rotation(&db, None, Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_due_after_schedule_fires() {
        let db = database();
        let before = Utc.with_ymd_and_hms(2024, 1, 31, 23, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 1).unwrap();
        assert!(!CredentialRotationManager::is_due(&db, None, before).unwrap());
        assert!(CredentialRotationManager::is_due(&db, None, after).unwrap());
    }

    #[test]
    fn test_in_flight_rotation_always_due() {
        let mut db = database();
        db.spec.auth.rotation_policy = None;
        let status = RotationStatus {
            phase: RotationPhase::Cutover,
            ..Default::default()
        };
        assert!(CredentialRotationManager::is_due(&db, Some(&status), Utc::now()).unwrap());
        assert!(!CredentialRotationManager::is_due(&db, None, Utc::now()).unwrap());
    }

    #[test]
    fn test_stall_detection() {
        let started = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let status = RotationStatus {
            phase: RotationPhase::CreatingNew,
            phase_started_at: Some(started),
            ..Default::default()
        };
        let threshold = Duration::from_secs(3600);
        assert!(!CredentialRotationManager::is_stalled(
            &status,
            started + chrono::Duration::minutes(30),
            threshold
        ));
        assert!(CredentialRotationManager::is_stalled(
            &status,
            started + chrono::Duration::minutes(61),
            threshold
        ));
        let idle = RotationStatus::default();
        assert!(!CredentialRotationManager::is_stalled(&idle, started, threshold));
    }

    #[test]
    fn test_unit_names_are_deterministic() {
        let db = database();
        let status = RotationStatus {
            sequence: 2,
            attempt: 1,
            ..Default::default()
        };
        assert_eq!(unit_name(&db, &status, "grant"), "orders-rot-2-grant-1");
    }

    #[test]
    fn test_finish_schedules_next_rotation() {
        let db = database();
        let mut status = RotationStatus {
            phase: RotationPhase::Complete,
            job_name: Some("orders-rot-0-revoke-0".to_string()),
            ..Default::default()
        };
        let now = Utc.with_ymd_and_hms(2024, 2, 1, 0, 5, 0).unwrap();
        let progress = CredentialRotationManager::finish(&db, &mut status, now);
        assert_eq!(progress, Progress::Complete);
        assert_eq!(status.phase, RotationPhase::Idle);
        assert_eq!(status.sequence, 1);
        assert_eq!(status.last_rotation, Some(now));
        assert_eq!(
            status.next_rotation,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
        );
        assert!(status.job_name.is_none());
    }
}
