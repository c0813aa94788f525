//! Database Kubernetes Operator
//!
//! This operator manages the lifecycle of database instances declared as
//! `Database` custom resources: provisioning, upgrades, scaling, scheduled
//! backups, restores and credential rotation.

pub mod adapters;
pub mod config;
pub mod controllers;
pub mod credentials;
pub mod crd;
pub mod engines;
pub mod error;
pub mod jobs;
pub mod maintenance;
pub mod metrics;
pub mod platform;
pub mod progress;
pub mod reconcilers;
pub mod schedule;

pub use error::{Error, Result};
