//! Database spec validation
//!
//! Runs before any engine is consulted. Every rule reports a validation
//! error; nothing is silently coerced.

use std::cmp::Ordering;

use lazy_static::lazy_static;
use regex::Regex;

use crate::crd::{Database, DatabaseSpec, Technology, TopologyMode};
use crate::error::{Error, Result};
use crate::maintenance::parse_start_time;
use crate::schedule::{parse_duration, parse_schedule};

/// Largest replica count accepted
pub const MAX_REPLICAS: i32 = 100;

lazy_static! {
    static ref VERSION_RE: Regex = Regex::new(r"^\d+(\.\d+){0,3}$").unwrap();
    static ref QUANTITY_RE: Regex =
        Regex::new(r"^\d+(\.\d+)?(Ki|Mi|Gi|Ti|Pi|Ei|k|M|G|T|P|E)?$").unwrap();
    static ref VAULT_ADDRESS_RE: Regex = Regex::new(r"^https?://[^\s/]+").unwrap();
}

/// Validate the whole Database resource
pub fn validate(db: &Database) -> Result<()> {
    validate_spec(&db.spec)?;
    validate_version_transition(db.current_version(), &db.spec.version)
}

/// Validate the spec on its own
pub fn validate_spec(spec: &DatabaseSpec) -> Result<()> {
    if !VERSION_RE.is_match(spec.version.trim()) {
        return Err(Error::validation(format!(
            "Invalid version '{}': expected dotted numeric version such as 16 or 7.0.4",
            spec.version
        )));
    }

    validate_topology(spec)?;
    validate_storage(spec)?;
    validate_backup(spec)?;
    validate_auth(spec)?;
    validate_maintenance(spec)?;

    if let Some(restore) = &spec.restore {
        if restore.backup_name.trim().is_empty() {
            return Err(Error::validation("restore.backupName must not be empty"));
        }
        let has_source = spec
            .backup
            .as_ref()
            .is_some_and(|b| b.destination.s3.is_some() || b.destination.pvc.is_some());
        if !has_source {
            return Err(Error::validation(
                "restore requires backup.destination to locate the backup",
            ));
        }
    }

    Ok(())
}

/// Topology modes each technology supports
pub fn supported_modes(technology: Technology) -> &'static [TopologyMode] {
    match technology {
        Technology::PostgreSQL => &[TopologyMode::Standalone, TopologyMode::Replicated],
        Technology::MongoDB => &[
            TopologyMode::Standalone,
            TopologyMode::Replicated,
            TopologyMode::Sharded,
        ],
        Technology::Redis => &[
            TopologyMode::Standalone,
            TopologyMode::Replicated,
            TopologyMode::Cluster,
        ],
        Technology::Elasticsearch => &[TopologyMode::Cluster],
        Technology::SQLite => &[TopologyMode::Standalone],
    }
}

fn validate_topology(spec: &DatabaseSpec) -> Result<()> {
    let topology = &spec.topology;
    let replicas = topology.replicas;

    if !(1..=MAX_REPLICAS).contains(&replicas) {
        return Err(Error::validation(format!(
            "Invalid replicas {}: must be between 1 and {}",
            replicas, MAX_REPLICAS
        )));
    }

    // Technology-level invariants come first so users see the actionable message
    match spec.engine {
        Technology::SQLite if replicas > 1 => {
            return Err(Error::validation(
                "SQLite only supports a single instance (replicas must be 1)",
            ));
        }
        Technology::Elasticsearch if topology.mode == TopologyMode::Standalone => {
            return Err(Error::validation(
                "Elasticsearch requires at least 3 nodes and cannot run Standalone",
            ));
        }
        Technology::Elasticsearch if replicas < 3 => {
            return Err(Error::validation(format!(
                "Elasticsearch requires at least 3 nodes, got {}",
                replicas
            )));
        }
        _ => {}
    }

    if !supported_modes(spec.engine).contains(&topology.mode) {
        return Err(Error::validation(format!(
            "{} does not support {} topology",
            spec.engine, topology.mode
        )));
    }

    if topology.mode == TopologyMode::Standalone && replicas != 1 {
        return Err(Error::validation(format!(
            "Standalone topology requires exactly 1 replica, got {}",
            replicas
        )));
    }

    match (topology.mode, topology.shards) {
        (TopologyMode::Sharded, None) => {
            return Err(Error::validation("Sharded topology requires shards to be set"));
        }
        (TopologyMode::Sharded, Some(shards)) if shards < 1 => {
            return Err(Error::validation(format!(
                "Invalid shards {}: must be at least 1",
                shards
            )));
        }
        (mode, Some(_)) if mode != TopologyMode::Sharded => {
            return Err(Error::validation(format!(
                "shards is only valid with Sharded topology, not {}",
                mode
            )));
        }
        _ => {}
    }

    Ok(())
}

fn validate_storage(spec: &DatabaseSpec) -> Result<()> {
    if !QUANTITY_RE.is_match(&spec.storage.size) {
        return Err(Error::validation(format!(
            "Invalid storage size '{}'",
            spec.storage.size
        )));
    }
    if let Some(mode) = &spec.storage.volume_mode {
        if mode != "Filesystem" && mode != "Block" {
            return Err(Error::validation(format!(
                "Invalid volumeMode '{}': must be Filesystem or Block",
                mode
            )));
        }
    }
    Ok(())
}

fn validate_backup(spec: &DatabaseSpec) -> Result<()> {
    let Some(backup) = spec.backup.as_ref().filter(|b| b.enabled) else {
        return Ok(());
    };

    parse_schedule(&backup.schedule)?;

    if backup.retention < 1 {
        return Err(Error::validation(format!(
            "Invalid backup retention {}: must be at least 1",
            backup.retention
        )));
    }

    match (&backup.destination.s3, &backup.destination.pvc) {
        (Some(_), Some(_)) => Err(Error::validation(
            "Backup destination must specify only one of s3 or pvc",
        )),
        (None, None) => Err(Error::validation(
            "Backup destination must specify one of s3 or pvc",
        )),
        (Some(s3), None) if s3.bucket.trim().is_empty() => {
            Err(Error::validation("S3 backup destination requires a bucket"))
        }
        (Some(s3), None) if s3.credentials_secret.trim().is_empty() => Err(Error::validation(
            "S3 backup destination requires credentialsSecret",
        )),
        (None, Some(pvc)) if pvc.claim_name.trim().is_empty() => {
            Err(Error::validation("PVC backup destination requires claimName"))
        }
        _ => Ok(()),
    }
}

fn validate_auth(spec: &DatabaseSpec) -> Result<()> {
    if let Some(vault) = spec.auth.vault.as_ref().filter(|v| v.enabled) {
        if !VAULT_ADDRESS_RE.is_match(&vault.address) {
            return Err(Error::validation(format!(
                "Invalid vault address '{}': expected http(s)://host[:port]",
                vault.address
            )));
        }
        if vault.path.trim_matches('/').is_empty() {
            return Err(Error::validation("vault.path must not be empty"));
        }
    }

    if let Some(policy) = spec.auth.rotation_policy.as_ref().filter(|p| p.enabled) {
        parse_schedule(&policy.schedule)?;
    }
    Ok(())
}

fn validate_maintenance(spec: &DatabaseSpec) -> Result<()> {
    let Some(maintenance) = &spec.maintenance else {
        return Ok(());
    };
    for window in &maintenance.windows {
        if window.day_of_week > 6 {
            return Err(Error::validation(format!(
                "Invalid dayOfWeek {}: must be 0 (Sunday) through 6",
                window.day_of_week
            )));
        }
        parse_start_time(&window.start_time)?;
        let length = parse_duration(&window.duration)?;
        if length <= chrono::Duration::zero() || length > chrono::Duration::days(7) {
            return Err(Error::validation(format!(
                "Invalid window duration '{}': must be between 0 and 168h",
                window.duration
            )));
        }
    }
    Ok(())
}

/// Compare dotted versions component-wise, padding missing components with
/// zero. Non-numeric components count as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.trim()
            .split('.')
            .map(|p| p.parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (left, right) = (parse(a), parse(b));
    let len = left.len().max(right.len());
    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Reject moving from the running version to an earlier one
pub fn validate_version_transition(current: Option<&str>, desired: &str) -> Result<()> {
    let Some(current) = current else {
        return Ok(());
    };
    if compare_versions(desired, current) == Ordering::Less {
        return Err(Error::validation(format!(
            "Version downgrade from {} to {} is not supported",
            current, desired
        )));
    }
    Ok(())
}
