//! Scheduled backups
//!
//! One CronJob per Database, named `<name>-backup`. Disabling backups
//! suspends the schedule instead of deleting it, so its history survives.

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{CronJob, JobTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info};

use super::{commands, connection_env, destination, ExecutionUnit};
use crate::crd::Database;
use crate::engines::resources::own;
use crate::engines::Engine;
use crate::error::Result;
use crate::platform::{covers, Applied, PlatformClient};

const FAILED_JOBS_HISTORY_LIMIT: i32 = 3;

/// Observed state of the backup schedule
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupScheduleState {
    pub applied: Option<Applied>,
    pub suspended: bool,
    /// Completion time of the newest successful run
    pub last_successful: Option<DateTime<Utc>>,
}

/// Execution unit a scheduled firing runs
pub fn backup_unit(db: &Database, engine: &dyn Engine) -> Result<Option<ExecutionUnit>> {
    let Some(backup) = &db.spec.backup else {
        return Ok(None);
    };
    let technology = engine.technology();
    let script = commands::backup_script(technology, backup.method)?;
    let image = commands::client_image(technology, &db.spec.version)?;
    let (volume, destination_env) = destination(&backup.destination);

    let unit = ExecutionUnit::new(db.backup_schedule_name(), "backup", image)
        .script(script)
        .env(connection_env(
            db,
            &engine.endpoint(db),
            &db.credentials_secret_name(),
        ))
        .env(destination_env)
        .volume(volume, super::BACKUP_MOUNT_PATH);
    Ok(Some(unit))
}

/// Ensure the backup CronJob matches the policy
///
/// With backups enabled the schedule is created or updated in place. With
/// backups disabled an existing schedule is suspended; none is created.
pub async fn sync_backup_schedule(
    client: &PlatformClient,
    db: &Database,
    engine: &dyn Engine,
) -> Result<BackupScheduleState> {
    let namespace = db.namespace_or_default();
    let name = db.backup_schedule_name();

    if !db.backup_enabled() {
        return suspend_schedule(client, &namespace, &name).await;
    }

    let Some(unit) = backup_unit(db, engine)? else {
        return Ok(BackupScheduleState::default());
    };
    let Some(policy) = &db.spec.backup else {
        return Ok(BackupScheduleState::default());
    };

    let job_spec = unit.job_spec(db);
    let labels = db.instance_labels();
    let applied = client
        .create_or_update::<CronJob, _>(&namespace, &name, |cron| {
            own(&mut cron.metadata, db);
            let spec = cron.spec.get_or_insert_with(Default::default);
            spec.schedule = policy.schedule.clone();
            spec.suspend = Some(false);
            spec.concurrency_policy = Some("Forbid".to_string());
            spec.successful_jobs_history_limit = Some(policy.retention);
            spec.failed_jobs_history_limit = Some(FAILED_JOBS_HISTORY_LIMIT);
            let template = JobTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(job_spec),
            };
            // The server defaults most pod fields; only rewrite on real drift
            let live = serde_json::to_value(&spec.job_template)?;
            if !covers(&live, &serde_json::to_value(&template)?) {
                spec.job_template = template;
            }
            Ok(())
        })
        .await?;

    if applied != Applied::Unchanged {
        info!(
            name = %db.name_any(),
            schedule = %policy.schedule,
            method = %policy.method,
            "Backup schedule {:?}", applied
        );
    }

    let cron = client.get::<CronJob>(&namespace, &name).await?;
    Ok(BackupScheduleState {
        applied: Some(applied),
        suspended: false,
        last_successful: cron.as_ref().and_then(last_successful_time),
    })
}

async fn suspend_schedule(
    client: &PlatformClient,
    namespace: &str,
    name: &str,
) -> Result<BackupScheduleState> {
    let Some(mut cron) = client.get::<CronJob>(namespace, name).await? else {
        return Ok(BackupScheduleState::default());
    };
    let last_successful = last_successful_time(&cron);
    let spec = cron.spec.get_or_insert_with(Default::default);
    if spec.suspend == Some(true) {
        return Ok(BackupScheduleState {
            applied: Some(Applied::Unchanged),
            suspended: true,
            last_successful,
        });
    }
    spec.suspend = Some(true);
    client.replace(namespace, &cron).await?;
    debug!(cronjob = %name, "Suspended backup schedule");
    Ok(BackupScheduleState {
        applied: Some(Applied::Updated),
        suspended: true,
        last_successful,
    })
}

fn last_successful_time(cron: &CronJob) -> Option<DateTime<Utc>> {
    cron.status
        .as_ref()
        .and_then(|s| s.last_successful_time.as_ref())
        .map(|t| t.0)
}
