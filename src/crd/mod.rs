//! Custom Resource Definitions for the Database Operator

mod database;

pub use database::*;

use kube::CustomResourceExt;

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Result<Vec<String>, serde_yaml::Error> {
    Ok(vec![serde_yaml::to_string(&Database::crd())?])
}
