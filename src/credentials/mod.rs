//! Database credentials held in Secrets
//!
//! Each Database has exactly one "current" credentials secret. A rotation
//! additionally creates a transient "new" secret (the credential being
//! introduced) and an "old" secret (the credential being retired).

pub mod rotation;

pub use rotation::{CredentialRotationManager, ROTATION_POLL_INTERVAL};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use k8s_openapi::api::core::v1::Secret;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use tracing::{debug, info};

use crate::adapters::{resolve_target, Credentials, ExternalSecretStore};
use crate::crd::{Database, ROTATION_LABEL};
use crate::engines::resources::{own, owned_by};
use crate::engines::Engine;
use crate::error::Result;
use crate::platform::{Applied, PlatformClient};

/// Length of generated passwords
pub const PASSWORD_LENGTH: usize = 32;

const USERNAME_SUFFIX_LENGTH: usize = 6;

/// Role a credentials secret plays
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecretSlot {
    Current,
    New,
    Old,
}

impl SecretSlot {
    pub fn label(&self) -> &'static str {
        match self {
            SecretSlot::Current => "current",
            SecretSlot::New => "new",
            SecretSlot::Old => "old",
        }
    }

    /// Secret name for this slot
    pub fn secret_name(&self, db: &Database) -> String {
        match self {
            SecretSlot::Current => db.credentials_secret_name(),
            SecretSlot::New => db.new_credentials_secret_name(),
            SecretSlot::Old => db.old_credentials_secret_name(),
        }
    }
}

/// Random password from the OS source, URL-safe alphabet
pub fn generate_password() -> String {
    let mut bytes = [0u8; PASSWORD_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    let mut password = URL_SAFE_NO_PAD.encode(bytes);
    password.truncate(PASSWORD_LENGTH);
    password
}

/// Fresh role name derived from `base`, e.g. `postgres_k3x9qa`
pub fn generate_username(base: &str) -> String {
    let suffix: String = OsRng
        .sample_iter(&Alphanumeric)
        .take(USERNAME_SUFFIX_LENGTH)
        .map(char::from)
        .collect();
    format!("{}_{}", base, suffix.to_ascii_lowercase())
}

/// Write `credentials` into the slot's secret, creating it when needed
///
/// Only secrets this controller created are labelled and owned; a secret
/// supplied by the user keeps its metadata and other keys; only the
/// credential keys are written.
pub async fn write_slot(
    client: &PlatformClient,
    db: &Database,
    slot: SecretSlot,
    credentials: &Credentials,
) -> Result<Applied> {
    let namespace = db.namespace_or_default();
    let data = credentials.to_secret_data();
    client
        .create_or_update::<Secret, _>(&namespace, &slot.secret_name(db), |secret| {
            if secret.metadata.uid.is_none() || owned_by(&secret.metadata, db) {
                own(&mut secret.metadata, db);
                secret
                    .metadata
                    .labels
                    .get_or_insert_with(Default::default)
                    .insert(ROTATION_LABEL.to_string(), slot.label().to_string());
                secret.type_ = Some("Opaque".to_string());
            }
            secret.string_data = None;
            secret.data.get_or_insert_with(Default::default).extend(data);
            Ok(())
        })
        .await
}

/// Make sure the current credentials secret exists
///
/// An existing secret's data is never overwritten here, and a secret the
/// controller did not create is left exactly as it is. A missing one is
/// seeded from the external vault when it holds credentials, otherwise
/// generated and mirrored to the vault.
pub async fn ensure_current_credentials(
    client: &PlatformClient,
    store: &dyn ExternalSecretStore,
    db: &Database,
    engine: &dyn Engine,
) -> Result<Applied> {
    let namespace = db.namespace_or_default();
    let name = db.credentials_secret_name();

    if let Some(existing) = client.get::<Secret>(&namespace, &name).await? {
        if !owned_by(&existing.metadata, db) {
            debug!(secret = %name, "Using credentials secret provided by the user");
            return Ok(Applied::Unchanged);
        }
        return client
            .create_or_update::<Secret, _>(&namespace, &name, |secret| {
                own(&mut secret.metadata, db);
                secret
                    .metadata
                    .labels
                    .get_or_insert_with(Default::default)
                    .insert(
                        ROTATION_LABEL.to_string(),
                        SecretSlot::Current.label().to_string(),
                    );
                Ok(())
            })
            .await;
    }

    let target = resolve_target(client, db).await?;
    let seeded = match &target {
        Some(target) => store
            .get(target)
            .await?
            .as_ref()
            .and_then(Credentials::from_map),
        None => None,
    };

    let credentials = match seeded {
        Some(credentials) => {
            info!(secret = %name, "Seeding credentials from external vault");
            credentials
        }
        None => {
            let credentials = Credentials {
                username: engine.default_username().to_string(),
                password: generate_password(),
            };
            if let Some(target) = &target {
                store.put(target, &credentials.to_map()).await?;
            }
            info!(secret = %name, "Generated initial credentials");
            credentials
        }
    };

    write_slot(client, db, SecretSlot::Current, &credentials).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_shape() {
        let password = generate_password();
        assert_eq!(password.len(), PASSWORD_LENGTH);
        assert!(password
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_passwords_differ() {
        assert_ne!(generate_password(), generate_password());
    }

    #[test]
    fn test_username_suffix() {
        let username = generate_username("postgres");
        let (base, suffix) = username.split_once('_').unwrap();
        assert_eq!(base, "postgres");
        assert_eq!(suffix.len(), USERNAME_SUFFIX_LENGTH);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
