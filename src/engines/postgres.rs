//! PostgreSQL engine
//!
//! Reference engine: a PVC for data, a ConfigMap carrying `postgresql.conf`,
//! a Service selecting the instance pods and a StatefulSet running the
//! official image with credentials wired from the "current" secret.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, EnvVar, PersistentVolumeClaim, PodSpec,
    ResourceRequirements, Service, ServicePort, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::info;

use super::resources::{self, own};
use super::Engine;
use crate::crd::{Database, ServiceType, Technology, TopologyMode};
use crate::error::{Error, Result};
use crate::platform::{Applied, PlatformClient};

/// Port PostgreSQL listens on inside the pod
pub const POSTGRES_PORT: i32 = 5432;
/// Mount point of the data volume; PGDATA is a subdirectory of it
pub const POSTGRES_DATA_PATH: &str = "/var/lib/postgresql/data";
const POSTGRES_IMAGE: &str = "postgres";
const CONTAINER_NAME: &str = "postgresql";
const CONFIG_FILE: &str = "postgresql.conf";
const TLS_MOUNT_PATH: &str = "/etc/postgresql/tls";
const EXTERNAL_DNS_ANNOTATION: &str = "external-dns.alpha.kubernetes.io/hostname";

/// PostgreSQL engine
#[derive(Clone, Debug, Default)]
pub struct PostgresEngine;

impl PostgresEngine {
    pub fn new() -> Self {
        Self
    }

    /// Render `postgresql.conf`
    pub fn render_config(db: &Database) -> String {
        let mut config = String::from("# PostgreSQL Configuration\n");
        config.push_str("listen_addresses = '*'\n");
        config.push_str("max_connections = 100\n");
        config.push_str("shared_buffers = 128MB\n");

        if db.spec.topology.mode == TopologyMode::Replicated {
            config.push_str("wal_level = replica\n");
            config.push_str("max_wal_senders = 10\n");
            config.push_str("hot_standby = on\n");
        }

        if db.spec.networking.tls.as_ref().is_some_and(|t| t.enabled) {
            config.push_str("ssl = on\n");
            config.push_str(&format!("ssl_cert_file = '{}/tls.crt'\n", TLS_MOUNT_PATH));
            config.push_str(&format!("ssl_key_file = '{}/tls.key'\n", TLS_MOUNT_PATH));
        }

        for (key, value) in &db.spec.engine_config {
            config.push_str(&format!("{} = {}\n", key, value));
        }
        config
    }

    fn image(version: &str) -> String {
        format!("{}:{}", POSTGRES_IMAGE, version)
    }

    /// Update the named container in place, appending it when missing
    fn converge_container(pod: &mut PodSpec, db: &Database, version: &str) {
        let index = match pod.containers.iter().position(|c| c.name == CONTAINER_NAME) {
            Some(i) => i,
            None => {
                pod.containers.push(Container {
                    name: CONTAINER_NAME.to_string(),
                    ..Default::default()
                });
                pod.containers.len() - 1
            }
        };
        let container = &mut pod.containers[index];
        let secret = db.credentials_secret_name();

        container.image = Some(Self::image(version));
        container.ports = Some(vec![ContainerPort {
            name: Some(CONTAINER_NAME.to_string()),
            container_port: POSTGRES_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]);
        container.args = Some(vec![
            "-c".to_string(),
            format!("config_file=/etc/postgresql/{}", CONFIG_FILE),
        ]);
        container.env = Some(vec![
            resources::secret_env("POSTGRES_USER", &secret, "username"),
            resources::secret_env("POSTGRES_PASSWORD", &secret, "password"),
            EnvVar {
                name: "PGDATA".to_string(),
                value: Some(format!("{}/pgdata", POSTGRES_DATA_PATH)),
                ..Default::default()
            },
        ]);

        let mut mounts = vec![
            VolumeMount {
                name: "data".to_string(),
                mount_path: POSTGRES_DATA_PATH.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "config".to_string(),
                mount_path: "/etc/postgresql".to_string(),
                ..Default::default()
            },
        ];
        if Self::tls_secret(db).is_some() {
            mounts.push(VolumeMount {
                name: "tls".to_string(),
                mount_path: TLS_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }
        container.volume_mounts = Some(mounts);
        match resources::resource_requirements(&db.spec.resources) {
            Some(requirements) => container.resources = Some(requirements),
            // the API server stores unset requirements as `{}`
            None => {
                if container.resources.as_ref().is_some_and(|r| *r != ResourceRequirements::default()) {
                    container.resources = None;
                }
            }
        }
    }

    /// Converge the pod volumes in place so server defaults such as
    /// `defaultMode` survive
    fn converge_volumes(pod: &mut PodSpec, db: &Database) {
        let volumes = pod.volumes.get_or_insert_with(Vec::new);
        upsert_volume(volumes, "data", |v| {
            v.persistent_volume_claim
                .get_or_insert_with(Default::default)
                .claim_name = db.data_claim_name();
        });
        upsert_volume(volumes, "config", |v| {
            v.config_map.get_or_insert_with(Default::default).name = db.config_map_name().into();
        });
        match Self::tls_secret(db) {
            Some(secret_name) => upsert_volume(volumes, "tls", |v| {
                v.secret.get_or_insert_with(Default::default).secret_name = Some(secret_name);
            }),
            None => volumes.retain(|v| v.name != "tls"),
        }
    }

    fn tls_secret(db: &Database) -> Option<String> {
        db.spec
            .networking
            .tls
            .as_ref()
            .filter(|t| t.enabled)
            .map(|t| {
                t.secret_name
                    .clone()
                    .unwrap_or_else(|| format!("{}-tls", db.name_any()))
            })
    }

    /// Fetch the existing StatefulSet, apply `mutate`, write back if it changed
    async fn update_workload<F>(&self, client: &PlatformClient, db: &Database, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut StatefulSet) + Send,
    {
        let namespace = db.namespace_or_default();
        let name = db.name_any();
        let mut sts = client
            .get::<StatefulSet>(&namespace, &name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("StatefulSet {}/{}", namespace, name)))?;
        let before = sts.clone();
        mutate(&mut sts);
        if sts != before {
            client.replace(&namespace, &sts).await?;
        }
        Ok(())
    }
}

/// Apply `converge` to the named volume, appending it when missing
fn upsert_volume(volumes: &mut Vec<Volume>, name: &str, converge: impl FnOnce(&mut Volume)) {
    let index = match volumes.iter().position(|v| v.name == name) {
        Some(i) => i,
        None => {
            volumes.push(Volume {
                name: name.to_string(),
                ..Default::default()
            });
            volumes.len() - 1
        }
    };
    converge(&mut volumes[index]);
}

#[async_trait]
impl Engine for PostgresEngine {
    fn technology(&self) -> Technology {
        Technology::PostgreSQL
    }

    fn default_port(&self) -> i32 {
        POSTGRES_PORT
    }

    fn default_username(&self) -> &'static str {
        "postgres"
    }

    fn validate(&self, db: &Database) -> Result<()> {
        if db.spec.version.trim().is_empty() {
            return Err(Error::validation("version is required for PostgreSQL"));
        }
        if db.spec.topology.mode == TopologyMode::Sharded {
            return Err(Error::validation(
                "PostgreSQL does not support sharded topology",
            ));
        }
        if db.spec.topology.replicas < 1 {
            return Err(Error::validation("replicas must be at least 1"));
        }
        Ok(())
    }

    async fn ensure_storage(&self, client: &PlatformClient, db: &Database) -> Result<Applied> {
        let namespace = db.namespace_or_default();
        client
            .create_or_update::<PersistentVolumeClaim, _>(&namespace, &db.data_claim_name(), |pvc| {
                own(&mut pvc.metadata, db);
                // Claim specs are immutable once bound
                if pvc.spec.is_none() {
                    pvc.spec = Some(resources::claim_spec(
                        &db.spec.storage.size,
                        db.spec.storage.storage_class_name.clone(),
                        db.spec.storage.volume_mode.clone(),
                    ));
                }
                Ok(())
            })
            .await
    }

    async fn ensure_config(&self, client: &PlatformClient, db: &Database) -> Result<Applied> {
        let namespace = db.namespace_or_default();
        let rendered = Self::render_config(db);
        client
            .create_or_update::<ConfigMap, _>(&namespace, &db.config_map_name(), |cm| {
                own(&mut cm.metadata, db);
                cm.data
                    .get_or_insert_with(BTreeMap::new)
                    .insert(CONFIG_FILE.to_string(), rendered);
                Ok(())
            })
            .await
    }

    async fn ensure_service(&self, client: &PlatformClient, db: &Database) -> Result<Applied> {
        let namespace = db.namespace_or_default();
        let port = db.spec.networking.port.unwrap_or(POSTGRES_PORT);
        client
            .create_or_update::<Service, _>(&namespace, &db.name_any(), |svc| {
                own(&mut svc.metadata, db);
                if let Some(hostname) = &db.spec.networking.external_dns {
                    svc.metadata
                        .annotations
                        .get_or_insert_with(BTreeMap::new)
                        .insert(EXTERNAL_DNS_ANNOTATION.to_string(), hostname.clone());
                }
                let spec = svc.spec.get_or_insert_with(Default::default);
                spec.selector = Some(db.instance_labels());
                spec.type_ = Some(db.spec.networking.service_type.as_str().to_string());
                // Converge the port in place; a server-assigned nodePort stays
                let ports = spec.ports.get_or_insert_with(Vec::new);
                ports.retain(|p| p.name.as_deref() == Some(CONTAINER_NAME));
                if ports.is_empty() {
                    ports.push(ServicePort {
                        name: Some(CONTAINER_NAME.to_string()),
                        ..Default::default()
                    });
                }
                let service_port = &mut ports[0];
                service_port.port = port;
                service_port.target_port = Some(IntOrString::Int(POSTGRES_PORT));
                service_port.protocol = Some("TCP".to_string());
                if db.spec.networking.service_type == ServiceType::ClusterIP {
                    service_port.node_port = None;
                }
                Ok(())
            })
            .await
    }

    async fn ensure_workload(
        &self,
        client: &PlatformClient,
        db: &Database,
        version: &str,
    ) -> Result<Applied> {
        let namespace = db.namespace_or_default();
        client
            .create_or_update::<StatefulSet, _>(&namespace, &db.name_any(), |sts| {
                own(&mut sts.metadata, db);
                let spec = sts.spec.get_or_insert_with(Default::default);
                if spec.replicas.is_none() {
                    spec.replicas = Some(db.desired_replicas());
                }
                spec.selector = resources::instance_selector(db);
                spec.service_name = db.name_any().into();

                let template = &mut spec.template;
                template
                    .metadata
                    .get_or_insert_with(Default::default)
                    .labels = Some(db.instance_labels());
                let pod = template.spec.get_or_insert_with(Default::default);
                Self::converge_container(pod, db, version);
                Self::converge_volumes(pod, db);
                pod.affinity = db
                    .spec
                    .topology
                    .anti_affinity
                    .then(|| resources::spread_affinity(db));
                Ok(())
            })
            .await
    }

    async fn scale(&self, client: &PlatformClient, db: &Database) -> Result<()> {
        let replicas = db.desired_replicas();
        info!(name = %db.name_any(), replicas, "Scaling PostgreSQL workload");
        self.update_workload(client, db, |sts| {
            if let Some(spec) = sts.spec.as_mut() {
                spec.replicas = Some(replicas);
            }
        })
        .await
    }

    async fn upgrade(&self, client: &PlatformClient, db: &Database) -> Result<()> {
        let image = Self::image(&db.spec.version);
        info!(name = %db.name_any(), version = %db.spec.version, "Upgrading PostgreSQL workload");
        self.update_workload(client, db, |sts| {
            let containers = sts
                .spec
                .as_mut()
                .and_then(|s| s.template.spec.as_mut())
                .map(|p| p.containers.iter_mut());
            for container in containers.into_iter().flatten() {
                if container.name == CONTAINER_NAME {
                    container.image = Some(image.clone());
                }
            }
        })
        .await
    }
}
