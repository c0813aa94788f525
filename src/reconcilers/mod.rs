//! Reconcilers for the Database CRD
//!
//! This module contains the business logic for reconciling Databases.
//! Reconcilers are responsible for:
//! - Validating specs
//! - Driving engines, jobs and credential rotation
//! - Updating resource status

pub mod database;
pub mod deletion;
pub mod status;
pub mod validation;

pub use database::{reconcile_at, reconcile_database};
