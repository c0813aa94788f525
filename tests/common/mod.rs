//! Shared test fixtures: an in-memory platform store and secret vault

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use database_operator::adapters::{ExternalSecretStore, VaultTarget};
use database_operator::config::OperatorConfig;
use database_operator::controllers::Context;
use database_operator::crd::{Database, DatabaseSpec, DatabaseStatus};
use database_operator::engines::EngineRegistry;
use database_operator::platform::{PlatformBackend, PlatformClient};
use database_operator::{reconcilers, Error, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::core::ApiResource;
use kube::runtime::controller::Action;
use serde_json::{json, Map, Value};

pub const NAMESPACE: &str = "shop";
pub const NAME: &str = "orders";

/// Creation time stamped on objects that do not carry one
pub const CREATED_AT: &str = "2024-01-15T12:00:00Z";
const DELETED_AT: &str = "2024-06-01T00:00:00Z";

/// A write issued against the store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub verb: &'static str,
    pub kind: String,
    pub name: String,
}

#[derive(Default)]
struct Store {
    objects: BTreeMap<(String, String, String), Value>,
    next_version: u64,
    next_uid: u64,
    next_port: i64,
    calls: Vec<Call>,
}

impl Store {
    /// Fill in the fields the API server defaults on every write
    fn apply_defaults(&mut self, kind: &str, object: &mut Value, stored: Option<&Value>) {
        let spec = &mut object["spec"];
        if !spec.is_object() {
            return;
        }
        match kind {
            "StatefulSet" => {
                default_field(spec, "podManagementPolicy", json!("OrderedReady"));
                default_field(spec, "revisionHistoryLimit", json!(10));
                default_field(
                    spec,
                    "updateStrategy",
                    json!({ "type": "RollingUpdate", "rollingUpdate": { "partition": 0 } }),
                );
                default_pod_spec(&mut spec["template"]["spec"]);
            }
            "Job" => default_pod_spec(&mut spec["template"]["spec"]),
            "CronJob" => {
                let job = &mut spec["jobTemplate"]["spec"];
                default_field(job, "parallelism", json!(1));
                default_field(job, "completionMode", json!("NonIndexed"));
                default_field(job, "suspend", json!(false));
                default_pod_spec(&mut job["template"]["spec"]);
            }
            "Service" => {
                default_field(spec, "sessionAffinity", json!("None"));
                let cluster_ip = stored
                    .map(|s| s["spec"]["clusterIP"].clone())
                    .filter(|ip| !ip.is_null())
                    .unwrap_or_else(|| json!(format!("10.96.0.{}", self.next_uid)));
                default_field(spec, "clusterIP", cluster_ip);
                let exposed = matches!(spec["type"].as_str(), Some("NodePort" | "LoadBalancer"));
                if let Some(ports) = spec["ports"].as_array_mut() {
                    for port in ports {
                        if exposed && port["nodePort"].is_null() {
                            self.next_port += 1;
                            port["nodePort"] = json!(30000 + self.next_port);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn bump(&mut self, object: &mut Value) {
        self.next_version += 1;
        object["metadata"]["resourceVersion"] = json!(self.next_version.to_string());
    }

    fn record(&mut self, verb: &'static str, kind: &str, name: &str) {
        self.calls.push(Call {
            verb,
            kind: kind.to_string(),
            name: name.to_string(),
        });
    }
}

/// In-memory object store with API server semantics the controller relies on
///
/// - writes carrying a stale resourceVersion fail with a conflict
/// - create and replace ignore status; only patch_status writes it
/// - deleting an object with finalizers only stamps deletionTimestamp, and
///   clearing the last finalizer of a deleting object removes it
/// - pod templates, Services and CronJobs get the server-side defaults the
///   controller has to tolerate when comparing
#[derive(Default)]
pub struct FakeBackend {
    store: Mutex<Store>,
}

fn key(resource: &ApiResource, namespace: &str, name: &str) -> (String, String, String) {
    (resource.kind.clone(), namespace.to_string(), name.to_string())
}

fn version_of(object: &Value) -> Option<&str> {
    object["metadata"]["resourceVersion"].as_str()
}

fn finalizers_empty(object: &Value) -> bool {
    object["metadata"]["finalizers"]
        .as_array()
        .map_or(true, |f| f.is_empty())
}

fn matches_selector(object: &Value, selector: &str) -> bool {
    let labels = &object["metadata"]["labels"];
    selector
        .split(',')
        .filter(|r| !r.is_empty())
        .all(|requirement| match requirement.split_once('=') {
            Some((k, v)) => labels[k].as_str() == Some(v),
            None => !labels[requirement].is_null(),
        })
}

fn default_field(object: &mut Value, field: &str, value: Value) {
    if let Some(map) = object.as_object_mut() {
        map.entry(field.to_string()).or_insert(value);
    }
}

fn default_pod_spec(pod: &mut Value) {
    default_field(pod, "restartPolicy", json!("Always"));
    default_field(pod, "dnsPolicy", json!("ClusterFirst"));
    default_field(pod, "schedulerName", json!("default-scheduler"));
    default_field(pod, "terminationGracePeriodSeconds", json!(30));
    default_field(pod, "securityContext", json!({}));
    if let Some(containers) = pod["containers"].as_array_mut() {
        for container in containers {
            default_field(container, "resources", json!({}));
            default_field(container, "imagePullPolicy", json!("IfNotPresent"));
            default_field(container, "terminationMessagePath", json!("/dev/termination-log"));
            default_field(container, "terminationMessagePolicy", json!("File"));
            if let Some(ports) = container["ports"].as_array_mut() {
                for port in ports {
                    default_field(port, "protocol", json!("TCP"));
                }
            }
        }
    }
    if let Some(volumes) = pod["volumes"].as_array_mut() {
        for volume in volumes {
            for source in ["configMap", "secret"] {
                if volume[source].is_object() {
                    default_field(&mut volume[source], "defaultMode", json!(420));
                }
            }
        }
    }
}

/// RFC 7386 JSON merge patch
pub fn merge(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(map) = target {
                for (k, v) in fields {
                    if v.is_null() {
                        map.remove(k);
                    } else {
                        merge(map.entry(k.clone()).or_insert(Value::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Writes issued so far
    pub fn calls(&self) -> Vec<Call> {
        self.store.lock().unwrap().calls.clone()
    }

    pub fn write_count(&self) -> usize {
        self.store.lock().unwrap().calls.len()
    }

    pub fn deletes_of(&self, kind: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.verb == "delete" && c.kind == kind)
            .map(|c| c.name)
            .collect()
    }

    pub fn raw(&self, kind: &str, namespace: &str, name: &str) -> Option<Value> {
        self.store
            .lock()
            .unwrap()
            .objects
            .get(&(kind.to_string(), namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn exists(&self, kind: &str, name: &str) -> bool {
        self.raw(kind, NAMESPACE, name).is_some()
    }

    /// Apply `patch` to a stored object's status as another controller would
    pub fn patch_raw_status(&self, kind: &str, name: &str, patch: Value) {
        let mut store = self.store.lock().unwrap();
        let k = (kind.to_string(), NAMESPACE.to_string(), name.to_string());
        let mut object = store.objects.remove(&k).expect("object to patch");
        merge(&mut object["status"], &patch);
        store.bump(&mut object);
        store.objects.insert(k, object);
    }

    /// Simulate a concurrent writer by bumping the resourceVersion
    pub fn touch(&self, kind: &str, name: &str) {
        let mut store = self.store.lock().unwrap();
        let k = (kind.to_string(), NAMESPACE.to_string(), name.to_string());
        let mut object = store.objects.remove(&k).expect("object to touch");
        store.bump(&mut object);
        store.objects.insert(k, object);
    }

    pub fn set_ready_replicas(&self, name: &str, ready: i32) {
        self.patch_raw_status("StatefulSet", name, json!({ "readyReplicas": ready }));
    }

    pub fn complete_job(&self, name: &str) {
        self.patch_raw_status(
            "Job",
            name,
            json!({
                "succeeded": 1,
                "conditions": [{ "type": "Complete", "status": "True" }],
            }),
        );
    }

    pub fn fail_job(&self, name: &str) {
        self.patch_raw_status(
            "Job",
            name,
            json!({
                "failed": 4,
                "conditions": [{
                    "type": "Failed",
                    "status": "True",
                    "reason": "BackoffLimitExceeded",
                    "message": "Job has reached the specified backoff limit",
                }],
            }),
        );
    }
}

#[async_trait]
impl PlatformBackend for FakeBackend {
    async fn get(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<Option<Value>> {
        let store = self.store.lock().unwrap();
        Ok(store.objects.get(&key(resource, namespace, name)).cloned())
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Value>> {
        let store = self.store.lock().unwrap();
        Ok(store
            .objects
            .iter()
            .filter(|((kind, ns, _), object)| {
                kind == &resource.kind && ns == namespace && matches_selector(object, label_selector)
            })
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn create(&self, resource: &ApiResource, namespace: &str, mut object: Value) -> Result<Value> {
        let name = object["metadata"]["name"].as_str().unwrap_or_default().to_string();
        let mut store = self.store.lock().unwrap();
        let k = key(resource, namespace, &name);
        if store.objects.contains_key(&k) {
            return Err(Error::Conflict(format!("{} {} already exists", resource.kind, name)));
        }
        store.next_uid += 1;
        let uid = format!("uid-{}", store.next_uid);
        let metadata = &mut object["metadata"];
        metadata["namespace"] = json!(namespace);
        metadata["uid"] = json!(uid);
        metadata["generation"] = json!(1);
        if metadata["creationTimestamp"].is_null() {
            metadata["creationTimestamp"] = json!(CREATED_AT);
        }
        if let Some(map) = object.as_object_mut() {
            map.remove("status");
        }
        store.apply_defaults(&resource.kind, &mut object, None);
        store.bump(&mut object);
        store.record("create", &resource.kind, &name);
        store.objects.insert(k, object.clone());
        Ok(object)
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        mut object: Value,
    ) -> Result<Value> {
        let mut store = self.store.lock().unwrap();
        let k = key(resource, namespace, name);
        let Some(stored) = store.objects.get(&k).cloned() else {
            return Err(Error::NotFound(format!("{} {}", resource.kind, name)));
        };
        if let Some(version) = version_of(&object) {
            if Some(version) != version_of(&stored) {
                return Err(Error::Conflict(format!("{} {} was modified", resource.kind, name)));
            }
        }

        for field in ["uid", "creationTimestamp", "deletionTimestamp", "generation"] {
            object["metadata"][field] = stored["metadata"][field].clone();
        }
        store.apply_defaults(&resource.kind, &mut object, Some(&stored));
        if object["spec"] != stored["spec"] {
            let generation = stored["metadata"]["generation"].as_i64().unwrap_or(1);
            object["metadata"]["generation"] = json!(generation + 1);
        }
        match object.as_object_mut() {
            Some(map) if !stored["status"].is_null() => {
                map.insert("status".into(), stored["status"].clone());
            }
            Some(map) => {
                map.remove("status");
            }
            None => {}
        }
        if let Some(map) = object["metadata"].as_object_mut() {
            map.retain(|_, v| !v.is_null());
        }

        store.bump(&mut object);
        store.record("replace", &resource.kind, name);
        if !object["metadata"]["deletionTimestamp"].is_null() && finalizers_empty(&object) {
            store.objects.remove(&k);
        } else {
            store.objects.insert(k, object.clone());
        }
        Ok(object)
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> Result<Value> {
        let mut store = self.store.lock().unwrap();
        let k = key(resource, namespace, name);
        let Some(mut object) = store.objects.get(&k).cloned() else {
            return Err(Error::NotFound(format!("{} {}", resource.kind, name)));
        };
        if let Some(version) = version_of(&patch) {
            if Some(version) != version_of(&object) {
                return Err(Error::Conflict(format!("{} {} was modified", resource.kind, name)));
            }
        }
        merge(&mut object["status"], &patch["status"]);
        store.bump(&mut object);
        store.record("patch_status", &resource.kind, name);
        store.objects.insert(k, object.clone());
        Ok(object)
    }

    async fn patch_json(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: json_patch::Patch,
    ) -> Result<Value> {
        let mut store = self.store.lock().unwrap();
        let k = key(resource, namespace, name);
        let Some(mut object) = store.objects.get(&k).cloned() else {
            return Err(Error::NotFound(format!("{} {}", resource.kind, name)));
        };
        // The API server tests absent fields as null
        if object["metadata"]["finalizers"].is_null() {
            object["metadata"]["finalizers"] = Value::Null;
        }
        json_patch::patch(&mut object, &patch.0)
            .map_err(|e| Error::Conflict(format!("{} {}: {}", resource.kind, name, e)))?;
        // Empty lists are omitted on the wire
        if let Some(map) = object["metadata"].as_object_mut() {
            map.retain(|_, v| !v.is_null() && *v != json!([]));
        }

        store.bump(&mut object);
        store.record("patch", &resource.kind, name);
        if !object["metadata"]["deletionTimestamp"].is_null() && finalizers_empty(&object) {
            store.objects.remove(&k);
        } else {
            store.objects.insert(k, object.clone());
        }
        Ok(object)
    }

    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        let k = key(resource, namespace, name);
        let Some(mut object) = store.objects.get(&k).cloned() else {
            return Err(Error::NotFound(format!("{} {}", resource.kind, name)));
        };
        store.record("delete", &resource.kind, name);
        if finalizers_empty(&object) {
            store.objects.remove(&k);
        } else if object["metadata"]["deletionTimestamp"].is_null() {
            object["metadata"]["deletionTimestamp"] = json!(DELETED_AT);
            store.bump(&mut object);
            store.objects.insert(k, object);
        }
        Ok(())
    }
}

/// External vault keeping every value in memory
#[derive(Default)]
pub struct FakeSecretStore {
    values: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    puts: Mutex<Vec<String>>,
}

impl FakeSecretStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn value(&self, path: &str) -> Option<BTreeMap<String, String>> {
        self.values.lock().unwrap().get(path).cloned()
    }

    pub fn seed(&self, path: &str, username: &str, password: &str) {
        self.values.lock().unwrap().insert(
            path.to_string(),
            BTreeMap::from([
                ("username".to_string(), username.to_string()),
                ("password".to_string(), password.to_string()),
            ]),
        );
    }

    /// Paths written, in order
    pub fn puts(&self) -> Vec<String> {
        self.puts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExternalSecretStore for FakeSecretStore {
    async fn put(&self, target: &VaultTarget, values: &BTreeMap<String, String>) -> Result<()> {
        self.values
            .lock()
            .unwrap()
            .insert(target.path.clone(), values.clone());
        self.puts.lock().unwrap().push(target.path.clone());
        Ok(())
    }

    async fn get(&self, target: &VaultTarget) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self.values.lock().unwrap().get(&target.path).cloned())
    }
}

/// Controller context wired to the fakes
pub struct Harness {
    pub backend: Arc<FakeBackend>,
    pub store: Arc<FakeSecretStore>,
    pub ctx: Context,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_parts(FakeBackend::new(), FakeSecretStore::new())
    }

    fn with_parts(backend: Arc<FakeBackend>, store: Arc<FakeSecretStore>) -> Self {
        let ctx = Context::new(
            PlatformClient::new(backend.clone()),
            EngineRegistry::with_builtin_engines(),
            store.clone(),
            OperatorConfig::default(),
        );
        Self {
            backend,
            store,
            ctx,
        }
    }

    /// Fresh context over the same stores, as after an operator restart
    pub fn restart(&self) -> Self {
        Self::with_parts(self.backend.clone(), self.store.clone())
    }

    pub fn client(&self) -> &PlatformClient {
        &self.ctx.client
    }

    pub async fn create_database(&self, yaml: &str) -> Database {
        let spec: DatabaseSpec = serde_yaml::from_str(yaml).unwrap();
        let mut db = Database::new(NAME, spec);
        db.metadata.namespace = Some(NAMESPACE.to_string());
        self.client().create(NAMESPACE, &db).await.unwrap()
    }

    pub async fn database(&self) -> Option<Database> {
        self.client().get::<Database>(NAMESPACE, NAME).await.unwrap()
    }

    pub async fn status(&self) -> DatabaseStatus {
        self.database()
            .await
            .and_then(|db| db.status)
            .unwrap_or_default()
    }

    /// Apply a spec change the way a user edit would
    pub async fn update_spec(&self, edit: impl FnOnce(&mut DatabaseSpec)) {
        let mut db = self.database().await.unwrap();
        edit(&mut db.spec);
        self.client().replace(NAMESPACE, &db).await.unwrap();
    }

    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<Action> {
        reconcilers::reconcile_at(&self.ctx, NAMESPACE, NAME, now).await
    }

    /// Reconcile until the workload exists, mark it ready, reconcile again
    pub async fn converge_ready(&self, now: DateTime<Utc>) {
        self.reconcile(now).await.unwrap();
        self.reconcile(now).await.unwrap();
        let replicas = self.database().await.unwrap().desired_replicas();
        self.backend.set_ready_replicas(NAME, replicas);
        self.reconcile(now).await.unwrap();
    }

    pub async fn secret(&self, name: &str) -> Option<Secret> {
        self.client().get::<Secret>(NAMESPACE, name).await.unwrap()
    }

    /// (username, password) held by a credentials secret
    pub async fn credentials(&self, name: &str) -> Option<(String, String)> {
        let secret = self.secret(name).await?;
        let data = secret.data?;
        let read = |k: &str| String::from_utf8(data.get(k)?.0.clone()).ok();
        Some((read("username")?, read("password")?))
    }
}

pub fn condition<'a>(
    status: &'a DatabaseStatus,
    type_: &str,
) -> Option<&'a database_operator::crd::Condition> {
    status.conditions.iter().find(|c| c.type_ == type_)
}

pub fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
}
