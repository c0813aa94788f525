//! Access to the platform's resource store
//!
//! The controller talks to Kubernetes through [`PlatformClient`], a typed facade
//! over an object-safe [`PlatformBackend`] that moves plain JSON objects. The
//! production backend wraps `kube::Api<DynamicObject>`; tests plug in an
//! in-memory store.

mod kube_backend;

pub use kube_backend::KubeBackend;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use kube::core::ApiResource;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Error, Result};

/// Raw object operations against the platform's store
///
/// Objects are addressed by API resource, namespace and name. Writes carry
/// `metadata.resourceVersion` when the caller read the object first, and the
/// backend must reject stale versions with [`Error::Conflict`].
#[async_trait]
pub trait PlatformBackend: Send + Sync {
    /// Fetch an object, `None` when it does not exist
    async fn get(&self, resource: &ApiResource, namespace: &str, name: &str)
        -> Result<Option<Value>>;

    /// List objects matching a label selector
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Value>>;

    /// Create a new object
    async fn create(&self, resource: &ApiResource, namespace: &str, object: Value) -> Result<Value>;

    /// Replace an existing object (optimistic concurrency on resourceVersion)
    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        object: Value,
    ) -> Result<Value>;

    /// JSON merge patch against the status subresource
    async fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> Result<Value>;

    /// RFC 6902 JSON patch against the object itself
    ///
    /// A failing `test` operation is reported as [`Error::Conflict`].
    async fn patch_json(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: json_patch::Patch,
    ) -> Result<Value>;

    /// Delete an object with background propagation
    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<()>;
}

/// Outcome of [`PlatformClient::create_or_update`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
    Unchanged,
}

/// Whether every field set in `desired` holds the same value in `live`
///
/// Fields the API server defaults on top of what the controller wrote do not
/// count as drift. Arrays must match element by element.
pub fn covers(live: &Value, desired: &Value) -> bool {
    match (desired, live) {
        (Value::Null, _) => true,
        (Value::Object(desired), Value::Object(live)) => desired
            .iter()
            .all(|(k, v)| covers(live.get(k).unwrap_or(&Value::Null), v)),
        (Value::Array(desired), Value::Array(live)) => {
            desired.len() == live.len() && desired.iter().zip(live).all(|(d, l)| covers(l, d))
        }
        (desired, live) => desired == live,
    }
}

/// Typed client over a [`PlatformBackend`]
#[derive(Clone)]
pub struct PlatformClient {
    backend: Arc<dyn PlatformBackend>,
}

fn api_resource<K: Resource<DynamicType = ()>>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

fn object_name<K: Resource>(object: &K) -> Result<String> {
    object
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::validation("object has no name"))
}

fn to_object<K: Serialize>(resource: &ApiResource, object: &K) -> Result<Value> {
    let mut value = serde_json::to_value(object)?;
    if let Some(map) = value.as_object_mut() {
        map.insert("apiVersion".into(), Value::String(resource.api_version.clone()));
        map.insert("kind".into(), Value::String(resource.kind.clone()));
    }
    Ok(value)
}

impl PlatformClient {
    pub fn new(backend: Arc<dyn PlatformBackend>) -> Self {
        Self { backend }
    }

    /// Fetch a typed object
    pub async fn get<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let resource = api_resource::<K>();
        match self.backend.get(&resource, namespace, name).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// List typed objects by label selector
    pub async fn list<K>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let resource = api_resource::<K>();
        self.backend
            .list(&resource, namespace, label_selector)
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(Error::from))
            .collect()
    }

    /// Create a typed object
    pub async fn create<K>(&self, namespace: &str, object: &K) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let resource = api_resource::<K>();
        let value = to_object(&resource, object)?;
        let created = self.backend.create(&resource, namespace, value).await?;
        Ok(serde_json::from_value(created)?)
    }

    /// Replace a typed object; its resourceVersion is the concurrency token
    pub async fn replace<K>(&self, namespace: &str, object: &K) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let resource = api_resource::<K>();
        let name = object_name(object)?;
        let value = to_object(&resource, object)?;
        let replaced = self.backend.replace(&resource, namespace, &name, value).await?;
        Ok(serde_json::from_value(replaced)?)
    }

    /// Merge-patch the status subresource
    pub async fn patch_status<K>(&self, namespace: &str, name: &str, patch: Value) -> Result<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let resource = api_resource::<K>();
        let patched = self
            .backend
            .patch_status(&resource, namespace, name, patch)
            .await?;
        Ok(serde_json::from_value(patched)?)
    }

    /// Append `finalizer` to the object's finalizer list
    ///
    /// The patch first tests the list as the caller saw it, so a concurrent
    /// finalizer change surfaces as a conflict instead of a duplicate entry.
    /// Spec edits made in the meantime do not interfere.
    pub async fn add_finalizer<K>(&self, namespace: &str, object: &K, finalizer: &str) -> Result<()>
    where
        K: Resource<DynamicType = ()>,
    {
        let name = object_name(object)?;
        let ops = match object.meta().finalizers.as_deref() {
            None | Some([]) => json!([
                { "op": "test", "path": "/metadata/finalizers", "value": null },
                { "op": "add", "path": "/metadata/finalizers", "value": [finalizer] },
            ]),
            Some(current) => json!([
                { "op": "test", "path": "/metadata/finalizers", "value": current },
                { "op": "add", "path": "/metadata/finalizers/-", "value": finalizer },
            ]),
        };
        self.patch_json::<K>(namespace, &name, ops).await
    }

    /// Remove `finalizer` from the object; false when it was not present
    ///
    /// The entry is addressed by index and tested first, so a list changed by
    /// someone else yields a conflict rather than removing their finalizer.
    pub async fn remove_finalizer<K>(&self, namespace: &str, object: &K, finalizer: &str) -> Result<bool>
    where
        K: Resource<DynamicType = ()>,
    {
        let name = object_name(object)?;
        let Some(index) = object
            .meta()
            .finalizers
            .as_ref()
            .and_then(|f| f.iter().position(|entry| entry == finalizer))
        else {
            return Ok(false);
        };
        let path = format!("/metadata/finalizers/{}", index);
        let ops = json!([
            { "op": "test", "path": path, "value": finalizer },
            { "op": "remove", "path": path },
        ]);
        match self.patch_json::<K>(namespace, &name, ops).await {
            Err(e) if e.is_not_found() => Ok(false),
            other => other.map(|()| true),
        }
    }

    async fn patch_json<K>(&self, namespace: &str, name: &str, ops: Value) -> Result<()>
    where
        K: Resource<DynamicType = ()>,
    {
        let resource = api_resource::<K>();
        let patch: json_patch::Patch = serde_json::from_value(ops)?;
        self.backend
            .patch_json(&resource, namespace, name, patch)
            .await?;
        Ok(())
    }

    /// Delete an object; returns false when it was already gone
    pub async fn delete<K>(&self, namespace: &str, name: &str) -> Result<bool>
    where
        K: Resource<DynamicType = ()>,
    {
        let resource = api_resource::<K>();
        match self.backend.delete(&resource, namespace, name).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Fetch, mutate, and write only when the object actually changed
    ///
    /// `mutate` receives either the live object or a fresh default carrying
    /// only name and namespace. It must set fields in place so that server
    /// populated fields survive and repeated calls converge to no write.
    pub async fn create_or_update<K, F>(&self, namespace: &str, name: &str, mutate: F) -> Result<Applied>
    where
        K: Resource<DynamicType = ()> + Clone + Debug + Default + Serialize + DeserializeOwned + Send,
        F: FnOnce(&mut K) -> Result<()> + Send,
    {
        let kind = K::kind(&());
        match self.get::<K>(namespace, name).await? {
            Some(existing) => {
                let mut desired = existing.clone();
                mutate(&mut desired)?;
                if serde_json::to_value(&desired)? == serde_json::to_value(&existing)? {
                    return Ok(Applied::Unchanged);
                }
                self.replace(namespace, &desired).await?;
                debug!(kind = %kind, name = %name, "Updated owned object");
                Ok(Applied::Updated)
            }
            None => {
                let mut object = K::default();
                object.meta_mut().name = Some(name.to_string());
                object.meta_mut().namespace = Some(namespace.to_string());
                mutate(&mut object)?;
                self.create(namespace, &object).await?;
                debug!(kind = %kind, name = %name, "Created owned object");
                Ok(Applied::Created)
            }
        }
    }
}
