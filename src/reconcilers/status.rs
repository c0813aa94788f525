//! Status bookkeeping: conditions, phase and persistence

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use serde_json::json;
use tracing::debug;

use crate::crd::{Condition, Database, DatabaseStatus, HealthStatus, Phase};
use crate::engines::HealthReport;
use crate::error::Result;
use crate::metrics;
use crate::platform::PlatformClient;

/// Condition types
pub const READY: &str = "Ready";
pub const VALIDATED: &str = "Validated";
pub const STORAGE_READY: &str = "StorageReady";
pub const CONFIG_READY: &str = "ConfigReady";
pub const SERVICE_READY: &str = "ServiceReady";
pub const RESTORED: &str = "Restored";
pub const PROVISIONED: &str = "Provisioned";
pub const UPGRADING: &str = "Upgrading";
pub const SCALING: &str = "Scaling";
pub const BACKUP_CONFIGURED: &str = "BackupConfigured";
pub const CREDENTIAL_ROTATION: &str = "CredentialRotation";
pub const ROTATION_STALLED: &str = "RotationStalled";

/// Look up a condition by type
pub fn condition<'a>(status: &'a DatabaseStatus, type_: &str) -> Option<&'a Condition> {
    status.conditions.iter().find(|c| c.type_ == type_)
}

/// Insert or update a condition
///
/// `lastTransitionTime` only moves when the boolean status flips.
pub fn set_condition(
    status: &mut DatabaseStatus,
    type_: &str,
    ok: bool,
    reason: &str,
    message: impl Into<String>,
    generation: Option<i64>,
    now: DateTime<Utc>,
) {
    let value = if ok { "True" } else { "False" };
    let message = message.into();
    match status.conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != value {
                existing.status = value.to_string();
                existing.last_transition_time = now;
            }
            existing.reason = reason.to_string();
            existing.message = message;
            existing.observed_generation = generation;
        }
        None => status.conditions.push(Condition {
            type_: type_.to_string(),
            status: value.to_string(),
            reason: reason.to_string(),
            message,
            last_transition_time: now,
            observed_generation: generation,
        }),
    }
}

/// Set the phase, recording the transition in metrics
pub fn set_phase(status: &mut DatabaseStatus, phase: Phase) {
    let from = status.phase.unwrap_or_default();
    if status.phase != Some(phase) {
        metrics::PHASE_TRANSITIONS
            .with_label_values(&[&from.to_string(), &phase.to_string()])
            .inc();
        status.phase = Some(phase);
    }
}

/// Update the health snapshot; the check time only moves on change
pub fn set_health(status: &mut DatabaseStatus, report: HealthReport, now: DateTime<Utc>) {
    let unchanged = status.health.as_ref().is_some_and(|h| {
        h.status == report.status && h.message.as_deref() == Some(report.message.as_str())
    });
    if !unchanged {
        status.health = Some(HealthStatus {
            status: report.status,
            message: Some(report.message),
            last_check_time: now,
        });
    }
}

/// Whether `after` differs from `before` in anything but bookkeeping times
pub fn changed(before: Option<&DatabaseStatus>, after: &DatabaseStatus) -> bool {
    let Some(before) = before else {
        return true;
    };
    let mut before = before.clone();
    before.last_reconcile_time = after.last_reconcile_time;
    before != *after
}

/// Write the status subresource when it changed
///
/// The patch carries the resourceVersion the cycle started from, so a
/// concurrent writer makes this fail with a conflict and the whole cycle is
/// retried.
pub async fn persist(
    client: &PlatformClient,
    db: &Database,
    mut status: DatabaseStatus,
    now: DateTime<Utc>,
) -> Result<bool> {
    if !changed(db.status.as_ref(), &status) {
        return Ok(false);
    }
    status.last_reconcile_time = Some(now);
    let patch = json!({
        "metadata": { "resourceVersion": db.resource_version() },
        "status": status,
    });
    client
        .patch_status::<Database>(&db.namespace_or_default(), &db.name_any(), patch)
        .await?;
    debug!(name = %db.name_any(), phase = ?status.phase, "Persisted status");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_transition_time_moves_only_on_flip() {
        let mut status = DatabaseStatus::default();
        set_condition(&mut status, READY, false, "Provisioning", "starting", Some(1), at(1));
        set_condition(&mut status, READY, false, "Provisioning", "still starting", Some(1), at(2));
        let ready = condition(&status, READY).unwrap();
        assert_eq!(ready.last_transition_time, at(1));
        assert_eq!(ready.message, "still starting");

        set_condition(&mut status, READY, true, "Ready", "1/1 replicas ready", Some(2), at(3));
        let ready = condition(&status, READY).unwrap();
        assert_eq!(ready.status, "True");
        assert_eq!(ready.last_transition_time, at(3));
        assert_eq!(ready.observed_generation, Some(2));
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn test_reconcile_time_alone_is_not_a_change() {
        let before = DatabaseStatus {
            phase: Some(Phase::Ready),
            last_reconcile_time: Some(at(1)),
            ..Default::default()
        };
        let mut after = before.clone();
        after.last_reconcile_time = None;
        assert!(!changed(Some(&before), &after));

        after.ready_replicas = 1;
        assert!(changed(Some(&before), &after));
        assert!(changed(None, &after));
    }

    #[test]
    fn test_health_check_time_sticky() {
        let mut status = DatabaseStatus::default();
        let report = || HealthReport {
            status: "Healthy".to_string(),
            message: "1/1 replicas ready".to_string(),
        };
        set_health(&mut status, report(), at(1));
        set_health(&mut status, report(), at(2));
        assert_eq!(status.health.as_ref().unwrap().last_check_time, at(1));
    }
}
