//! Database controller
//!
//! Watches Databases and the objects they own and triggers reconciliation.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service};
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Config as ControllerConfig, Controller},
        watcher::Config as WatcherConfig,
    },
    Api, Client, Resource, ResourceExt,
};
use tracing::{error, info, instrument, warn};

use crate::controllers::Context;
use crate::crd::Database;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers;

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = kube::core::NamespaceResourceScope>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Run the Database controller until shutdown
pub async fn run(client: Client, context: Arc<Context>) {
    let namespace = context.config.watch_namespace.clone();
    let databases: Api<Database> = api(&client, namespace.as_deref());

    // Verify CRD is installed
    if let Err(e) = databases.list(&ListParams::default().limit(1)).await {
        error!("Database CRD not installed: {}", e);
        return;
    }

    info!(
        namespace = namespace.as_deref().unwrap_or("*"),
        concurrency = context.config.concurrency,
        "Starting Database controller"
    );

    let owned = WatcherConfig::default().labels("app=database");
    Controller::new(databases, WatcherConfig::default())
        .owns(api::<StatefulSet>(&client, namespace.as_deref()), owned.clone())
        .owns(api::<Service>(&client, namespace.as_deref()), owned.clone())
        .owns(api::<PersistentVolumeClaim>(&client, namespace.as_deref()), owned.clone())
        .owns(api::<Secret>(&client, namespace.as_deref()), owned.clone())
        .owns(api::<ConfigMap>(&client, namespace.as_deref()), owned.clone())
        .owns(api::<Job>(&client, namespace.as_deref()), owned.clone())
        .owns(api::<CronJob>(&client, namespace.as_deref()), owned)
        .with_config(ControllerConfig::default().concurrency(context.config.concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    info!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or("default"),
                        "Reconciled Database"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Reconciliation error");
                }
            }
        })
        .await;
}

/// Main reconciliation function
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<Database>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&[obj.spec.engine.label()])
        .start_timer();

    let namespace = obj.namespace_or_default();
    let name = obj.name_any();
    let timeout = ctx.config.reconcile_timeout;

    let result = tokio::time::timeout(
        timeout,
        reconcilers::reconcile_at(&ctx, &namespace, &name, Utc::now()),
    )
    .await
    .unwrap_or(Err(Error::Timeout(timeout.as_secs())));

    if let Ok(action) = &result {
        ctx.backoff.reset(&obj.key());
        let outcome = if *action == Action::requeue(ctx.config.reconcile_interval)
            || *action == Action::await_change()
        {
            "success"
        } else {
            "deferred"
        };
        metrics::record_outcome(outcome);
    }
    result
}

/// Error policy for the controller
fn error_policy(obj: Arc<Database>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = obj.key();
    metrics::record_outcome("error");
    metrics::record_error(error.class());

    let (delay, failures) = ctx.backoff.record_failure(&key);
    match error {
        Error::UnimplementedEngine(technology) => error!(
            resource = %key,
            technology = %technology,
            retry_in_secs = delay.as_secs(),
            "No engine registered for technology; add an implementation or change spec.engine"
        ),
        _ => error!(
            resource = %key,
            error = %error,
            reason = error.reason(),
            failures,
            retry_in_secs = delay.as_secs(),
            "Reconciliation failed, scheduling retry"
        ),
    }

    Action::requeue(delay)
}
