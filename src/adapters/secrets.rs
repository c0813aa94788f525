//! Secret fetching utilities for Kubernetes secrets

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;

use crate::error::{Error, Result};
use crate::platform::PlatformClient;

/// Username/password pair held in a credentials secret
///
/// `Debug` redacts the password so credentials can be traced safely.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Secret data map holding these credentials
    pub fn to_secret_data(&self) -> BTreeMap<String, ByteString> {
        BTreeMap::from([
            (
                "username".to_string(),
                ByteString(self.username.clone().into_bytes()),
            ),
            (
                "password".to_string(),
                ByteString(self.password.clone().into_bytes()),
            ),
        ])
    }

    /// Plain string map, used for the external vault
    pub fn to_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("username".to_string(), self.username.clone()),
            ("password".to_string(), self.password.clone()),
        ])
    }

    /// Read credentials back from a plain string map
    pub fn from_map(map: &BTreeMap<String, String>) -> Option<Self> {
        Some(Self {
            username: map.get("username")?.clone(),
            password: map.get("password")?.clone(),
        })
    }
}

/// Fetch a secret
pub async fn get_secret(client: &PlatformClient, name: &str, namespace: &str) -> Result<Secret> {
    client
        .get::<Secret>(namespace, name)
        .await?
        .ok_or_else(|| Error::SecretNotFound(format!("{}/{}", namespace, name)))
}

/// Get a string value from a secret
pub fn get_secret_string(secret: &Secret, key: &str) -> Result<String> {
    let missing = || Error::SecretKeyNotFound {
        secret: secret.metadata.name.clone().unwrap_or_default(),
        key: key.to_string(),
    };

    let bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|b| b.0.clone())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|d| d.get(key))
                .map(|s| s.clone().into_bytes())
        })
        .ok_or_else(missing)?;

    String::from_utf8(bytes)
        .map_err(|e| Error::Config(format!("Invalid UTF-8 in secret key '{}': {}", key, e)))
}

/// Read username/password from a credentials secret
pub fn credentials_from_secret(secret: &Secret) -> Result<Credentials> {
    Ok(Credentials {
        username: get_secret_string(secret, "username")?,
        password: get_secret_string(secret, "password")?,
    })
}

/// Fetch a credentials secret and decode it
pub async fn get_credentials(
    client: &PlatformClient,
    namespace: &str,
    secret_name: &str,
) -> Result<Credentials> {
    let secret = get_secret(client, secret_name, namespace).await?;
    credentials_from_secret(&secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret_with(data: &[(&str, &str)]) -> Secret {
        let mut secret = Secret::default();
        secret.metadata.name = Some("db-credentials".to_string());
        secret.data = Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        );
        secret
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials {
            username: "postgres".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("postgres"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_missing_key_reports_secret_and_key() {
        let secret = secret_with(&[("username", "postgres")]);
        let err = credentials_from_secret(&secret).unwrap_err();
        assert!(matches!(
            err,
            Error::SecretKeyNotFound { ref secret, ref key } if secret == "db-credentials" && key == "password"
        ));
    }

    #[test]
    fn test_round_trip_through_secret_data() {
        let creds = Credentials {
            username: "app".to_string(),
            password: "s3cret".to_string(),
        };
        let mut secret = Secret::default();
        secret.data = Some(creds.to_secret_data());
        assert_eq!(credentials_from_secret(&secret).unwrap(), creds);
    }
}
