//! Deletion protocol
//!
//! Runs once the Database carries a deletion timestamp and our finalizer.
//! The deletion policy decides what happens to owned objects; removing the
//! finalizer is always the last step.

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use super::status::{self, set_condition, set_phase};
use crate::controllers::Context;
use crate::crd::{Database, DeletionPolicy, Phase, FINALIZER_NAME};
use crate::engines::resources::disown;
use crate::error::Result;
use crate::platform::PlatformClient;

/// Run the deletion protocol and release the finalizer
pub async fn finalize(ctx: &Context, db: &Database, now: DateTime<Utc>) -> Result<Action> {
    if !db.has_finalizer() {
        return Ok(Action::await_change());
    }
    let name = db.name_any();
    let policy = db.spec.lifecycle.deletion_policy;

    let mut status = db.status.clone().unwrap_or_default();
    set_phase(&mut status, Phase::Deleting);
    set_condition(
        &mut status,
        status::READY,
        false,
        "Deleting",
        format!("Database is being deleted with policy {:?}", policy),
        db.metadata.generation,
        now,
    );
    if let Err(e) = status::persist(&ctx.client, db, status, now).await {
        warn!(name = %name, error = %e, "Failed to record Deleting phase");
    }

    match policy {
        DeletionPolicy::Snapshot => match ctx.registry.resolve(db.spec.engine) {
            Ok(engine) => match engine.backup(&ctx.client, db).await {
                Ok(unit) => info!(name = %name, job = %unit, "Launched final snapshot"),
                Err(e) => warn!(name = %name, error = %e, "Final snapshot failed, continuing deletion"),
            },
            Err(e) => warn!(name = %name, error = %e, "Final snapshot skipped, continuing deletion"),
        },
        DeletionPolicy::Retain => {
            let released = release_owned(&ctx.client, db).await?;
            info!(name = %name, released, "Retaining owned objects");
        }
        DeletionPolicy::Delete => {}
    }

    ctx.client
        .remove_finalizer(&db.namespace_or_default(), db, FINALIZER_NAME)
        .await?;
    info!(name = %name, policy = ?policy, "Removed finalizer");
    Ok(Action::await_change())
}

/// Clear our owner reference from every labelled object so cascading
/// deletion leaves them in place
pub async fn release_owned(client: &PlatformClient, db: &Database) -> Result<usize> {
    Ok(release::<PersistentVolumeClaim>(client, db).await?
        + release::<ConfigMap>(client, db).await?
        + release::<Service>(client, db).await?
        + release::<StatefulSet>(client, db).await?
        + release::<Secret>(client, db).await?
        + release::<CronJob>(client, db).await?
        + release::<Job>(client, db).await?)
}

async fn release<K>(client: &PlatformClient, db: &Database) -> Result<usize>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
{
    let namespace = db.namespace_or_default();
    let mut released = 0;
    for mut object in client.list::<K>(&namespace, &db.instance_selector()).await? {
        if disown(object.meta_mut(), db) {
            client.replace(&namespace, &object).await?;
            released += 1;
        }
    }
    Ok(released)
}
