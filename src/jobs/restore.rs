//! Restore before first workload creation
//!
//! A requested restore runs as the `<name>-restore` Job against the data
//! volume while no workload exists yet. Workload convergence waits until
//! the restore has completed; progress is tracked in `status.restore`.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{PersistentVolumeClaimVolumeSource, Volume};
use kube::ResourceExt;
use tracing::{info, warn};

use super::{commands, connection_env, destination, ExecutionUnit, UnitState};
use crate::crd::{Database, RestoreStatus};
use crate::engines::resources::env;
use crate::engines::{Engine, POSTGRES_DATA_PATH};
use crate::error::{Error, Result};
use crate::platform::PlatformClient;
use crate::progress::Progress;

/// How often a running restore is looked at again
pub const RESTORE_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Whether the requested restore has already been applied
pub fn restore_applied(db: &Database, status: Option<&RestoreStatus>) -> bool {
    let Some(request) = &db.spec.restore else {
        return true;
    };
    status.is_some_and(|s| {
        s.completed_at.is_some() && s.backup_name.as_deref() == Some(request.backup_name.as_str())
    })
}

/// Execution unit replaying the requested backup into the data volume
pub fn restore_unit(db: &Database, engine: &dyn Engine) -> Result<ExecutionUnit> {
    let request = db
        .spec
        .restore
        .as_ref()
        .ok_or_else(|| Error::validation("no restore requested"))?;
    let source = db
        .spec
        .backup
        .as_ref()
        .map(|b| &b.destination)
        .filter(|d| d.s3.is_some() || d.pvc.is_some())
        .ok_or_else(|| Error::validation("restore requires backup.destination to locate the backup"))?;

    let technology = engine.technology();
    let script = commands::restore_script(technology)?;
    let image = commands::client_image(technology, &db.spec.version)?;
    let (backup_volume, source_env) = destination(source);
    let data_volume = Volume {
        name: "data".to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: db.data_claim_name(),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut vars = vec![
        env("BACKUP_NAME", request.backup_name.clone()),
        env("PGDATA", format!("{}/pgdata", POSTGRES_DATA_PATH)),
    ];
    if let Some(target) = request.point_in_time {
        vars.push(env("RECOVERY_TARGET_TIME", recovery_target(target)));
    }

    Ok(ExecutionUnit::new(db.restore_job_name(), "restore", image)
        .script(script)
        .env(connection_env(
            db,
            &engine.endpoint(db),
            &db.credentials_secret_name(),
        ))
        .env(source_env)
        .env(vars)
        .volume(backup_volume, super::BACKUP_MOUNT_PATH)
        .volume(data_volume, POSTGRES_DATA_PATH))
}

fn recovery_target(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Drive the restore one step
///
/// Returns `Complete` when no restore is pending, `Deferred` while the unit
/// runs. A failed unit is removed so the next cycle launches a fresh one.
pub async fn reconcile_restore(
    client: &PlatformClient,
    db: &Database,
    engine: &dyn Engine,
    workload_exists: bool,
    status: &mut Option<RestoreStatus>,
    now: DateTime<Utc>,
) -> Result<Progress> {
    let Some(request) = &db.spec.restore else {
        return Ok(Progress::Complete);
    };
    if restore_applied(db, status.as_ref()) {
        return Ok(Progress::Complete);
    }

    let namespace = db.namespace_or_default();
    let tracked = status
        .as_ref()
        .filter(|s| s.backup_name.as_deref() == Some(request.backup_name.as_str()))
        .and_then(|s| s.job_name.clone());

    let job_name = match tracked {
        Some(job_name) => job_name,
        None => {
            if workload_exists {
                return Err(Error::validation(format!(
                    "restore of '{}' requested after the workload was created; restore only runs on a fresh instance",
                    request.backup_name
                )));
            }
            let unit = restore_unit(db, engine)?;
            let job_name = super::launch(client, db, &unit).await?;
            *status = Some(RestoreStatus {
                backup_name: Some(request.backup_name.clone()),
                job_name: Some(job_name.clone()),
                completed_at: None,
            });
            job_name
        }
    };

    match super::poll(client, &namespace, &job_name).await {
        Ok(UnitState::Running) => Ok(Progress::deferred("RestoreInProgress", RESTORE_POLL_INTERVAL)),
        Ok(UnitState::Succeeded) => {
            info!(name = %db.name_any(), backup = %request.backup_name, "Restore completed");
            *status = Some(RestoreStatus {
                backup_name: Some(request.backup_name.clone()),
                job_name: Some(job_name),
                completed_at: Some(now),
            });
            Ok(Progress::Complete)
        }
        Ok(UnitState::Failed(reason)) => {
            warn!(name = %db.name_any(), job = %job_name, "Restore unit failed");
            super::remove(client, &namespace, &job_name).await?;
            clear_job(status);
            Err(Error::ExecutionFailed {
                unit: job_name,
                reason,
            })
        }
        Err(e @ Error::ExecutionUnitMissing(_)) => {
            clear_job(status);
            Err(e)
        }
        Err(e) => Err(e),
    }
}

fn clear_job(status: &mut Option<RestoreStatus>) {
    if let Some(s) = status.as_mut() {
        s.job_name = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DatabaseSpec;
    use crate::engines::PostgresEngine;
    use chrono::TimeZone;

    fn database(yaml: &str) -> Database {
        let spec: DatabaseSpec = serde_yaml::from_str(yaml).unwrap();
        let mut db = Database::new("orders", spec);
        db.metadata.namespace = Some("shop".to_string());
        db
    }

    const WITH_RESTORE: &str = r#"
engine: PostgreSQL
version: "16"
backup:
  destination:
    pvc:
      claimName: backups
restore:
  backupName: orders-20240301-020000
  pointInTime: "2024-03-01T03:30:00Z"
"#;

    #[test]
    fn test_restore_applied_tracks_backup_name() {
        let db = database(WITH_RESTORE);
        assert!(!restore_applied(&db, None));

        let mut status = RestoreStatus {
            backup_name: Some("orders-20240301-020000".to_string()),
            job_name: Some("orders-restore".to_string()),
            completed_at: None,
        };
        assert!(!restore_applied(&db, Some(&status)));

        status.completed_at = Some(Utc::now());
        assert!(restore_applied(&db, Some(&status)));

        status.backup_name = Some("something-else".to_string());
        assert!(!restore_applied(&db, Some(&status)));
    }

    #[test]
    fn test_restore_unit_mounts_data_and_source() {
        let db = database(WITH_RESTORE);
        let unit = restore_unit(&db, &PostgresEngine::new()).unwrap();
        assert_eq!(unit.name, "orders-restore");
        let paths: Vec<_> = unit.mounts.iter().map(|m| m.mount_path.as_str()).collect();
        assert_eq!(paths, ["/backup", "/var/lib/postgresql/data"]);
        let target = unit.env.iter().find(|e| e.name == "RECOVERY_TARGET_TIME").unwrap();
        assert_eq!(target.value.as_deref(), Some("2024-03-01T03:30:00Z"));
    }

    #[test]
    fn test_restore_requires_a_source() {
        let db = database(
            "engine: PostgreSQL\nversion: \"16\"\nrestore:\n  backupName: orders-1\n",
        );
        let err = restore_unit(&db, &PostgresEngine::new()).unwrap_err();
        assert!(err.to_string().contains("backup.destination"));
    }

    #[test]
    fn test_recovery_target_format() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 3, 30, 0).unwrap();
        assert_eq!(recovery_target(at), "2024-03-01T03:30:00Z");
    }
}
