//! Object builders shared by engines and job orchestration

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, EnvVarSource, PersistentVolumeClaimSpec, PodAffinityTerm, PodAntiAffinity,
    ResourceRequirements, SecretKeySelector, VolumeResourceRequirements, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use super::WorkloadState;
use crate::crd::{ComputeResources, Database};

/// Stamp instance labels and the controller owner reference onto `meta`
///
/// Existing labels are kept; the owner reference is only added when no
/// reference with the same UID is present.
pub fn own(meta: &mut ObjectMeta, db: &Database) {
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    for (k, v) in db.instance_labels() {
        labels.insert(k, v);
    }
    if let Some(owner) = db.owner_reference() {
        let refs = meta.owner_references.get_or_insert_with(Vec::new);
        if !refs.iter().any(|r| r.uid == owner.uid) {
            refs.push(owner);
        }
    }
}

/// Whether `meta` carries an owner reference to this Database
pub fn owned_by(meta: &ObjectMeta, db: &Database) -> bool {
    match (db.metadata.uid.as_deref(), meta.owner_references.as_ref()) {
        (Some(uid), Some(refs)) => refs.iter().any(|r| r.uid == uid),
        _ => false,
    }
}

/// Remove the Database's owner reference so cascading deletion skips the object
///
/// Returns true when a reference was removed.
pub fn disown(meta: &mut ObjectMeta, db: &Database) -> bool {
    let Some(uid) = db.metadata.uid.as_deref() else {
        return false;
    };
    let Some(refs) = meta.owner_references.as_mut() else {
        return false;
    };
    let before = refs.len();
    refs.retain(|r| r.uid != uid);
    let removed = refs.len() != before;
    if refs.is_empty() {
        meta.owner_references = None;
    }
    removed
}

/// Plain environment variable
pub fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Environment variable sourced from a secret key
pub fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string().into(),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Selector matching the instance's pods
pub fn instance_selector(db: &Database) -> LabelSelector {
    LabelSelector {
        match_labels: Some(db.instance_labels()),
        ..Default::default()
    }
}

/// Container resource bounds from the spec, `None` when nothing is set
pub fn resource_requirements(resources: &ComputeResources) -> Option<ResourceRequirements> {
    let quantities = |pairs: [(&str, &Option<String>); 2]| {
        let map: BTreeMap<String, Quantity> = pairs
            .into_iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| (k.to_string(), Quantity(v.clone()))))
            .collect();
        (!map.is_empty()).then_some(map)
    };

    let requests = quantities([("cpu", &resources.cpu), ("memory", &resources.memory)]);
    let limits = quantities([
        ("cpu", &resources.cpu_limit),
        ("memory", &resources.memory_limit),
    ]);

    if requests.is_none() && limits.is_none() {
        return None;
    }
    Some(ResourceRequirements {
        requests,
        limits,
        ..Default::default()
    })
}

/// ReadWriteOnce claim of the given size
pub fn claim_spec(
    size: &str,
    storage_class_name: Option<String>,
    volume_mode: Option<String>,
) -> PersistentVolumeClaimSpec {
    PersistentVolumeClaimSpec {
        access_modes: Some(vec!["ReadWriteOnce".to_string()]),
        storage_class_name,
        volume_mode,
        resources: Some(VolumeResourceRequirements {
            requests: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity(size.to_string()),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Preferred anti-affinity spreading instance pods across nodes
pub fn spread_affinity(db: &Database) -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: 100,
                    pod_affinity_term: PodAffinityTerm {
                        label_selector: Some(instance_selector(db)),
                        topology_key: "kubernetes.io/hostname".to_string(),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Tag portion of a container image reference
pub fn image_version(image: &str) -> Option<String> {
    let after_slash = image.rsplit('/').next().unwrap_or(image);
    after_slash
        .split_once(':')
        .map(|(_, tag)| tag.to_string())
        .filter(|tag| !tag.is_empty())
}

/// Replica counts and running version of a StatefulSet
pub fn statefulset_state(sts: &StatefulSet) -> WorkloadState {
    let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready_replicas = sts
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    let version = sts
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
        .and_then(|c| c.image.as_deref())
        .and_then(image_version);

    WorkloadState {
        replicas,
        ready_replicas,
        version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_version() {
        assert_eq!(image_version("postgres:16"), Some("16".to_string()));
        assert_eq!(
            image_version("registry.local:5000/postgres:15.4"),
            Some("15.4".to_string())
        );
        assert_eq!(image_version("postgres"), None);
        assert_eq!(image_version("registry.local:5000/postgres"), None);
    }

    #[test]
    fn test_resource_requirements_empty() {
        assert!(resource_requirements(&ComputeResources::default()).is_none());
    }

    #[test]
    fn test_resource_requirements_partial() {
        let spec = ComputeResources {
            cpu: Some("500m".to_string()),
            memory_limit: Some("2Gi".to_string()),
            ..Default::default()
        };
        let req = resource_requirements(&spec).unwrap();
        let requests = req.requests.unwrap();
        assert_eq!(requests.get("cpu"), Some(&Quantity("500m".to_string())));
        assert!(!requests.contains_key("memory"));
        let limits = req.limits.unwrap();
        assert_eq!(limits.get("memory"), Some(&Quantity("2Gi".to_string())));
    }
}
