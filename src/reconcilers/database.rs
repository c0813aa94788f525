//! Database reconciler
//!
//! Converges one Database per call:
//! - finalizer and pause handling
//! - validation and engine resolution
//! - owned sub-resources in a fixed order, restore before the workload
//! - maintenance-gated upgrades and scaling
//! - backup schedule, credential rotation and healing
//! - phase, conditions and status persistence

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::status::{self, set_condition, set_phase};
use super::{deletion, validation};
use crate::controllers::Context;
use crate::credentials::{ensure_current_credentials, CredentialRotationManager};
use crate::crd::{Database, DatabaseStatus, Phase, RotationPhase, FINALIZER_NAME};
use crate::engines::{Engine, HealthReport, WorkloadState};
use crate::error::{Error, Result};
use crate::jobs::{backup, restore};
use crate::maintenance::{self, GateDecision};
use crate::metrics;
use crate::platform::Applied;
use crate::progress::Progress;

/// What the cycle decided about requeueing
#[derive(Clone, Debug, Default)]
struct Cycle {
    /// Shortest deferral hint seen during the cycle
    retry_after: Option<Duration>,
    upgrading: bool,
    scaling: bool,
}

impl Cycle {
    fn defer(&mut self, progress: &Progress) {
        if let Progress::Deferred {
            reason,
            retry_after,
        } = progress
        {
            metrics::DEFERRALS.with_label_values(&[reason]).inc();
            self.retry_after = Some(
                self.retry_after
                    .map_or(*retry_after, |current| current.min(*retry_after)),
            );
        }
    }

    fn requeue_after(&self, interval: Duration) -> Duration {
        self.retry_after.map_or(interval, |d| d.min(interval))
    }
}

/// Reconcile the Database `namespace/name` as of `now`
///
/// A Database that no longer exists is treated as deleted.
pub async fn reconcile_at(
    ctx: &Context,
    namespace: &str,
    name: &str,
    now: DateTime<Utc>,
) -> Result<Action> {
    let Some(db) = ctx.client.get::<Database>(namespace, name).await? else {
        debug!(name = %name, namespace = %namespace, "Database no longer exists");
        return Ok(Action::await_change());
    };
    reconcile_database(ctx, &db, now).await
}

/// Reconcile an already fetched Database
pub async fn reconcile_database(ctx: &Context, db: &Database, now: DateTime<Utc>) -> Result<Action> {
    if db.is_deleting() {
        return deletion::finalize(ctx, db, now).await;
    }

    if !db.has_finalizer() {
        add_finalizer(ctx, db).await?;
        return Ok(Action::requeue(Duration::ZERO));
    }

    let generation = db.metadata.generation;
    let mut status = db.status.clone().unwrap_or_default();
    let mut cycle = Cycle::default();

    match converge(ctx, db, &mut status, &mut cycle, now).await {
        Ok(()) => {
            status.observed_generation = generation;
            status::persist(&ctx.client, db, status, now).await?;
            Ok(Action::requeue(
                cycle.requeue_after(ctx.config.reconcile_interval),
            ))
        }
        Err(e) if e.is_transient() => Err(e),
        Err(e) => {
            set_phase(&mut status, Phase::Failed);
            set_condition(&mut status, status::READY, false, e.reason(), e.to_string(), generation, now);
            status.observed_generation = generation;
            if let Err(persist_error) = status::persist(&ctx.client, db, status, now).await {
                warn!(
                    name = %db.name_any(),
                    error = %persist_error,
                    "Failed to record failure in status"
                );
            }
            Err(e)
        }
    }
}

async fn add_finalizer(ctx: &Context, db: &Database) -> Result<()> {
    ctx.client
        .add_finalizer(&db.namespace_or_default(), db, FINALIZER_NAME)
        .await?;
    info!(name = %db.name_any(), "Added finalizer");
    Ok(())
}

/// Record a step's outcome on its condition, passing errors through
fn step<T>(
    status: &mut DatabaseStatus,
    type_: &str,
    ok_reason: &str,
    ok_message: &str,
    generation: Option<i64>,
    now: DateTime<Utc>,
    result: Result<T>,
) -> Result<T> {
    match &result {
        Ok(_) => set_condition(status, type_, true, ok_reason, ok_message, generation, now),
        Err(e) => set_condition(status, type_, false, e.reason(), e.to_string(), generation, now),
    }
    result
}

async fn converge(
    ctx: &Context,
    db: &Database,
    status: &mut DatabaseStatus,
    cycle: &mut Cycle,
    now: DateTime<Utc>,
) -> Result<()> {
    let client = &ctx.client;
    let generation = db.metadata.generation;
    let name = db.name_any();

    if db.spec.lifecycle.paused {
        set_phase(status, Phase::Paused);
        set_condition(status, status::READY, false, "Paused", "Reconciliation is paused", generation, now);
        return Ok(());
    }

    let validated = validation::validate(db);
    step(status, status::VALIDATED, "Valid", "Spec is valid", generation, now, validated)?;

    let engine = ctx.registry.resolve(db.spec.engine)?;
    let validated = engine.validate(db);
    step(status, status::VALIDATED, "Valid", "Spec is valid", generation, now, validated)?;

    if matches!(status.phase, None | Some(Phase::Pending | Phase::Failed | Phase::Paused)) {
        set_phase(status, Phase::Provisioning);
    }

    let storage = engine.ensure_storage(client, db).await;
    step(status, status::STORAGE_READY, "ClaimBound", "Storage claim converged", generation, now, storage)?;

    let credentials = ensure_current_credentials(client, ctx.store.as_ref(), db, engine.as_ref()).await;
    step(status, status::CONFIG_READY, "Converged", "Credentials and configuration converged", generation, now, credentials)?;
    let config = engine.ensure_config(client, db).await;
    step(status, status::CONFIG_READY, "Converged", "Credentials and configuration converged", generation, now, config)?;

    let service = engine.ensure_service(client, db).await;
    step(status, status::SERVICE_READY, "Converged", "Network endpoint converged", generation, now, service)?;
    status.endpoint = Some(engine.endpoint(db));

    let existing = engine.observe(client, db).await?;

    if db.spec.restore.is_some() {
        let restored = restore::reconcile_restore(
            client,
            db,
            engine.as_ref(),
            existing.is_some(),
            &mut status.restore,
            now,
        )
        .await;
        match restored {
            Ok(progress @ Progress::Deferred { .. }) => {
                set_condition(status, status::RESTORED, false, "RestoreInProgress", "Restore is running", generation, now);
                set_condition(status, status::READY, false, "RestoreInProgress", "Waiting for restore to finish", generation, now);
                cycle.defer(&progress);
                return Ok(());
            }
            restored => {
                step(status, status::RESTORED, "RestoreCompleted", "Backup restored", generation, now, restored)?;
            }
        }
    }

    let running = existing
        .as_ref()
        .and_then(|w| w.version.clone())
        .or_else(|| status.current_version.clone())
        .unwrap_or_else(|| db.spec.version.clone());
    let workload = engine.ensure_workload(client, db, &running).await;
    let applied = step(status, status::PROVISIONED, "WorkloadConverged", "Workload converged", generation, now, workload)?;
    if applied == Applied::Created {
        info!(name = %name, version = %running, "Created workload");
    }
    status.current_version = Some(running.clone());

    if let Some(observed) = &existing {
        upgrade(ctx, db, engine.as_ref(), status, cycle, &running, now).await?;
        scale(ctx, db, engine.as_ref(), status, cycle, observed, now).await?;
    }

    let observed = engine.observe(client, db).await?;
    let desired = db.desired_replicas();
    status.ready_replicas = observed.as_ref().map_or(0, |w| w.ready_replicas);
    let report = match engine.health(client, db).await {
        Ok(report) => report,
        Err(Error::NotImplemented { .. }) => HealthReport::from_workload(observed.as_ref(), desired),
        Err(e) => {
            warn!(name = %name, error = %e, "Engine health probe failed");
            HealthReport::from_workload(observed.as_ref(), desired)
        }
    };
    status::set_health(status, report, now);

    if db.spec.backup.is_some() {
        sync_backups(ctx, db, engine.as_ref(), status, now).await;
    }

    rotate(ctx, db, engine.as_ref(), status, cycle, now).await;

    match engine.heal(client, db).await {
        Ok(()) => {}
        Err(Error::NotImplemented { .. }) => {}
        Err(e) => warn!(name = %name, error = %e, "Heal pass failed"),
    }

    let phase = next_phase(status.phase.unwrap_or_default(), cycle, status.ready_replicas, desired);
    set_phase(status, phase);
    let ready_message = format!("{}/{} replicas ready", status.ready_replicas, desired);
    if phase == Phase::Ready {
        set_condition(status, status::READY, true, "Ready", ready_message, generation, now);
    } else {
        set_condition(status, status::READY, false, &phase.to_string(), ready_message, generation, now);
    }
    Ok(())
}

/// Phase after a successful cycle
fn next_phase(previous: Phase, cycle: &Cycle, ready: i32, desired: i32) -> Phase {
    if cycle.upgrading {
        return Phase::Upgrading;
    }
    if cycle.scaling {
        return Phase::Scaling;
    }
    if ready >= desired {
        return Phase::Ready;
    }
    match previous {
        Phase::Ready | Phase::Healing => Phase::Healing,
        Phase::Upgrading => Phase::Upgrading,
        Phase::Scaling => Phase::Scaling,
        _ => Phase::Provisioning,
    }
}

async fn upgrade(
    ctx: &Context,
    db: &Database,
    engine: &dyn Engine,
    status: &mut DatabaseStatus,
    cycle: &mut Cycle,
    running: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let desired = &db.spec.version;
    let generation = db.metadata.generation;
    if validation::compare_versions(running, desired) == std::cmp::Ordering::Equal {
        if status::condition(status, status::UPGRADING).is_some() {
            set_condition(status, status::UPGRADING, false, "UpToDate", format!("Running version {}", running), generation, now);
        }
        return Ok(());
    }

    let windows = db
        .spec
        .maintenance
        .as_ref()
        .map(|m| m.windows.as_slice())
        .unwrap_or_default();
    match maintenance::evaluate(windows, now)? {
        GateDecision::Deferred { opens_in } => {
            info!(
                name = %db.name_any(),
                from = %running,
                to = %desired,
                opens_in_secs = opens_in.num_seconds(),
                "Upgrade deferred until the next maintenance window"
            );
            set_condition(
                status,
                status::UPGRADING,
                false,
                "MaintenanceWindowClosed",
                format!("Upgrade from {} to {} waits for the next maintenance window", running, desired),
                generation,
                now,
            );
            let retry_after = opens_in.to_std().unwrap_or(Duration::from_secs(60));
            cycle.defer(&Progress::deferred("MaintenanceWindowClosed", retry_after));
            Ok(())
        }
        GateDecision::Allowed => {
            set_phase(status, Phase::Upgrading);
            let upgraded = engine.upgrade(&ctx.client, db).await;
            step(
                status,
                status::UPGRADING,
                "UpgradeApplied",
                &format!("Upgrading from {} to {}", running, desired),
                generation,
                now,
                upgraded,
            )?;
            status.current_version = Some(desired.clone());
            cycle.upgrading = true;
            Ok(())
        }
    }
}

async fn scale(
    ctx: &Context,
    db: &Database,
    engine: &dyn Engine,
    status: &mut DatabaseStatus,
    cycle: &mut Cycle,
    observed: &WorkloadState,
    now: DateTime<Utc>,
) -> Result<()> {
    let desired = db.desired_replicas();
    if observed.replicas == desired {
        return Ok(());
    }
    info!(name = %db.name_any(), from = observed.replicas, to = desired, "Scaling workload");
    set_phase(status, Phase::Scaling);
    let scaled = engine.scale(&ctx.client, db).await;
    step(
        status,
        status::SCALING,
        "Scaled",
        &format!("Scaled from {} to {} replicas", observed.replicas, desired),
        db.metadata.generation,
        now,
        scaled,
    )?;
    cycle.scaling = true;
    Ok(())
}

/// Keep the backup schedule in line; failures only surface on the condition
async fn sync_backups(
    ctx: &Context,
    db: &Database,
    engine: &dyn Engine,
    status: &mut DatabaseStatus,
    now: DateTime<Utc>,
) {
    let generation = db.metadata.generation;
    match backup::sync_backup_schedule(&ctx.client, db, engine).await {
        Ok(state) => {
            if let Some(last) = state.last_successful {
                status.last_backup = Some(last);
            }
            let outcome = match (state.suspended, state.applied) {
                (true, _) => "suspended",
                (false, Some(Applied::Created)) => "created",
                (false, Some(Applied::Updated)) => "updated",
                _ => "unchanged",
            };
            metrics::BACKUP_SCHEDULE_SYNCS.with_label_values(&[outcome]).inc();
            if state.suspended {
                set_condition(status, status::BACKUP_CONFIGURED, false, "BackupDisabled", "Backup schedule is suspended", generation, now);
            } else if state.applied.is_some() {
                set_condition(status, status::BACKUP_CONFIGURED, true, "ScheduleActive", "Backup schedule is configured", generation, now);
            }
        }
        Err(e) => {
            warn!(name = %db.name_any(), error = %e, "Failed to sync backup schedule");
            metrics::BACKUP_SCHEDULE_SYNCS.with_label_values(&["error"]).inc();
            set_condition(status, status::BACKUP_CONFIGURED, false, e.reason(), e.to_string(), generation, now);
        }
    }
}

/// Advance credential rotation by at most one phase
///
/// Rotation errors are reported on the CredentialRotation condition and
/// retried on a short requeue; they do not fail the cycle.
async fn rotate(
    ctx: &Context,
    db: &Database,
    engine: &dyn Engine,
    status: &mut DatabaseStatus,
    cycle: &mut Cycle,
    now: DateTime<Utc>,
) {
    let generation = db.metadata.generation;
    let due = match CredentialRotationManager::is_due(db, status.rotation.as_ref(), now) {
        Ok(due) => due,
        Err(e) => {
            set_condition(status, status::CREDENTIAL_ROTATION, false, e.reason(), e.to_string(), generation, now);
            return;
        }
    };

    if due {
        let mut rotation = status.rotation.clone().unwrap_or_default();
        let from = rotation.phase;
        let result = ctx.rotation.advance(db, engine, &mut rotation, now).await;
        if rotation.phase != from {
            metrics::ROTATION_TRANSITIONS
                .with_label_values(&[&rotation.phase.to_string()])
                .inc();
        }
        match result {
            Ok(progress) => {
                cycle.defer(&progress);
                let (reason, message) = match rotation.phase {
                    RotationPhase::Idle => ("RotationComplete", "Credentials rotated".to_string()),
                    phase => ("RotationInProgress", format!("Rotation in phase {}", phase)),
                };
                set_condition(status, status::CREDENTIAL_ROTATION, true, reason, message, generation, now);
            }
            Err(e) => {
                warn!(
                    name = %db.name_any(),
                    phase = %rotation.phase,
                    error = %e,
                    "Credential rotation step failed"
                );
                set_condition(status, status::CREDENTIAL_ROTATION, false, e.reason(), e.to_string(), generation, now);
                cycle.defer(&Progress::deferred(
                    "RotationRetry",
                    crate::credentials::ROTATION_POLL_INTERVAL,
                ));
            }
        }
        status.rotation = Some(rotation);
    } else if db.rotation_enabled() {
        let rotation = status.rotation.get_or_insert_with(Default::default);
        rotation.next_rotation =
            CredentialRotationManager::next_rotation(db, Some(rotation), now).unwrap_or(None);
    }

    if let Some(rotation) = &status.rotation {
        if CredentialRotationManager::is_stalled(rotation, now, ctx.config.rotation_stall_threshold) {
            let message = format!(
                "Rotation has been in phase {} since {}",
                rotation.phase,
                rotation
                    .phase_started_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default()
            );
            set_condition(status, status::ROTATION_STALLED, true, "RotationStalled", message, generation, now);
        } else if status::condition(status, status::ROTATION_STALLED).is_some() {
            set_condition(status, status::ROTATION_STALLED, false, "RotationProgressing", "Rotation is not stalled", generation, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_phase_ready_when_replicas_match() {
        let cycle = Cycle::default();
        assert_eq!(next_phase(Phase::Provisioning, &cycle, 1, 1), Phase::Ready);
        assert_eq!(next_phase(Phase::Provisioning, &cycle, 0, 1), Phase::Provisioning);
    }

    #[test]
    fn test_next_phase_healing_after_ready() {
        let cycle = Cycle::default();
        assert_eq!(next_phase(Phase::Ready, &cycle, 1, 3), Phase::Healing);
        assert_eq!(next_phase(Phase::Healing, &cycle, 3, 3), Phase::Ready);
    }

    #[test]
    fn test_next_phase_active_operations_win() {
        let cycle = Cycle {
            upgrading: true,
            ..Default::default()
        };
        assert_eq!(next_phase(Phase::Ready, &cycle, 1, 1), Phase::Upgrading);
        let cycle = Cycle {
            scaling: true,
            ..Default::default()
        };
        assert_eq!(next_phase(Phase::Ready, &cycle, 1, 1), Phase::Scaling);
        assert_eq!(next_phase(Phase::Scaling, &Cycle::default(), 1, 3), Phase::Scaling);
    }

    #[test]
    fn test_shortest_deferral_wins() {
        let mut cycle = Cycle::default();
        let interval = Duration::from_secs(300);
        assert_eq!(cycle.requeue_after(interval), interval);
        cycle.defer(&Progress::deferred("A", Duration::from_secs(60)));
        cycle.defer(&Progress::deferred("B", Duration::from_secs(30)));
        cycle.defer(&Progress::Complete);
        assert_eq!(cycle.requeue_after(interval), Duration::from_secs(30));
    }

    #[test]
    fn test_long_deferral_capped_by_interval() {
        let mut cycle = Cycle::default();
        cycle.defer(&Progress::deferred("MaintenanceWindowClosed", Duration::from_secs(86_400)));
        assert_eq!(
            cycle.requeue_after(Duration::from_secs(300)),
            Duration::from_secs(300)
        );
    }
}
