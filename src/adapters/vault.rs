//! External secret store (Consul KV compatible HTTP API)

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use super::secrets::{get_secret, get_secret_string};
use crate::crd::Database;
use crate::error::{Error, Result};
use crate::platform::PlatformClient;

const TOKEN_HEADER: &str = "X-Consul-Token";

/// Where and how to reach the external store for one Database
#[derive(Clone)]
pub struct VaultTarget {
    pub address: String,
    pub path: String,
    pub token: Option<String>,
}

impl std::fmt::Debug for VaultTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultTarget")
            .field("address", &self.address)
            .field("path", &self.path)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl VaultTarget {
    /// Same target, one path segment deeper
    pub fn child(&self, segment: &str) -> Self {
        Self {
            address: self.address.clone(),
            path: format!("{}/{}", self.path.trim_end_matches('/'), segment),
            token: self.token.clone(),
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/v1/kv/{}",
            self.address.trim_end_matches('/'),
            self.path.trim_matches('/')
        )
    }
}

/// Key/value store for credential material outside the cluster
#[async_trait]
pub trait ExternalSecretStore: Send + Sync {
    /// Write the whole key/value map at the target path
    async fn put(&self, target: &VaultTarget, values: &BTreeMap<String, String>) -> Result<()>;

    /// Read the map at the target path, `None` when nothing is stored
    async fn get(&self, target: &VaultTarget) -> Result<Option<BTreeMap<String, String>>>;
}

/// Consul KV backed store; the map is stored as one JSON document per path
#[derive(Clone, Default)]
pub struct ConsulKvStore {
    http: reqwest::Client,
}

impl ConsulKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn request(&self, method: reqwest::Method, target: &VaultTarget) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, target.url());
        match &target.token {
            Some(token) => builder.header(TOKEN_HEADER, token),
            None => builder,
        }
    }
}

#[async_trait]
impl ExternalSecretStore for ConsulKvStore {
    async fn put(&self, target: &VaultTarget, values: &BTreeMap<String, String>) -> Result<()> {
        let response = self
            .request(reqwest::Method::PUT, target)
            .json(values)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::vault(format!(
                "PUT {} returned {}",
                target.path,
                response.status()
            )));
        }
        debug!(path = %target.path, "Stored credentials in external vault");
        Ok(())
    }

    async fn get(&self, target: &VaultTarget) -> Result<Option<BTreeMap<String, String>>> {
        let response = self
            .request(reqwest::Method::GET, target)
            .query(&[("raw", "true")])
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let values = response
                    .json::<BTreeMap<String, String>>()
                    .await
                    .map_err(|e| Error::vault(format!("Malformed value at {}: {}", target.path, e)))?;
                Ok(Some(values))
            }
            status => Err(Error::vault(format!("GET {} returned {}", target.path, status))),
        }
    }
}

/// Resolve the vault target for a Database, `None` when integration is off
pub async fn resolve_target(client: &PlatformClient, db: &Database) -> Result<Option<VaultTarget>> {
    let Some(vault) = db.vault() else {
        return Ok(None);
    };

    let token = match &vault.token_secret_ref {
        Some(reference) => {
            let secret = get_secret(client, &reference.name, &db.namespace_or_default()).await?;
            Some(get_secret_string(&secret, &reference.key)?)
        }
        None => None,
    };

    Ok(Some(VaultTarget {
        address: vault.address.clone(),
        path: vault.path.clone(),
        token,
    }))
}
