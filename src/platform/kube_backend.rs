//! Kubernetes implementation of the platform backend

use async_trait::async_trait;
use kube::{
    api::{DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    core::ApiResource,
    Api, Client,
};
use serde_json::Value;

use super::PlatformBackend;
use crate::error::{Error, Result};

/// Backend talking to the Kubernetes API server
#[derive(Clone)]
pub struct KubeBackend {
    client: Client,
}

impl KubeBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }
}

/// Map API status codes onto the platform-neutral error variants
fn map_error(e: kube::Error, resource: &ApiResource, namespace: &str, name: &str) -> Error {
    match e {
        kube::Error::Api(resp) if resp.code == 409 => Error::Conflict(format!(
            "{} {}/{}: {}",
            resource.kind, namespace, name, resp.message
        )),
        kube::Error::Api(resp) if resp.code == 404 => {
            Error::NotFound(format!("{} {}/{}", resource.kind, namespace, name))
        }
        other => Error::Kube(other),
    }
}

fn to_dynamic(object: Value) -> Result<DynamicObject> {
    Ok(serde_json::from_value(object)?)
}

fn to_value(object: DynamicObject) -> Result<Value> {
    Ok(serde_json::to_value(object)?)
}

#[async_trait]
impl PlatformBackend for KubeBackend {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>> {
        let found = self
            .api(resource, namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_error(e, resource, namespace, name))?;
        found.map(to_value).transpose()
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Value>> {
        let list = self
            .api(resource, namespace)
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| map_error(e, resource, namespace, label_selector))?;
        list.items.into_iter().map(to_value).collect()
    }

    async fn create(&self, resource: &ApiResource, namespace: &str, object: Value) -> Result<Value> {
        let object = to_dynamic(object)?;
        let name = object.metadata.name.clone().unwrap_or_default();
        let created = self
            .api(resource, namespace)
            .create(&PostParams::default(), &object)
            .await
            .map_err(|e| map_error(e, resource, namespace, &name))?;
        to_value(created)
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        object: Value,
    ) -> Result<Value> {
        let object = to_dynamic(object)?;
        let replaced = self
            .api(resource, namespace)
            .replace(name, &PostParams::default(), &object)
            .await
            .map_err(|e| map_error(e, resource, namespace, name))?;
        to_value(replaced)
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> Result<Value> {
        let patched = self
            .api(resource, namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_error(e, resource, namespace, name))?;
        to_value(patched)
    }

    async fn patch_json(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: json_patch::Patch,
    ) -> Result<Value> {
        let patched = self
            .api(resource, namespace)
            .patch(name, &PatchParams::default(), &Patch::<()>::Json(patch))
            .await
            .map_err(|e| match e {
                // a failed `test` operation
                kube::Error::Api(resp) if resp.code == 422 => Error::Conflict(format!(
                    "{} {}/{}: {}",
                    resource.kind, namespace, name, resp.message
                )),
                other => map_error(other, resource, namespace, name),
            })?;
        to_value(patched)
    }

    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<()> {
        self.api(resource, namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| map_error(e, resource, namespace, name))?;
        Ok(())
    }
}
