//! Credential Validator (C1).
//!
//! Resolves a bearer token to an organization and permission set. Grounded
//! on the manager-struct shape of `aerolithdb_saas::auth::SaaSAuthManager`,
//! but the credential model itself is the spec's hashed API key rather
//! than the teacher's JWT session — see DESIGN.md for why `jsonwebtoken`
//! was dropped.

use meterline_core::errors::CredentialError;
use meterline_core::types::{ApiKey, Permission};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::store::Store;

pub const KEY_PREFIX: &str = "mtl_";

/// The outcome of a successful `Validate` call.
#[derive(Debug, Clone)]
pub struct Credential {
    pub api_key_id: Uuid,
    pub organization_id: Uuid,
    pub permissions: Vec<Permission>,
}

impl Credential {
    pub fn has(&self, required: Permission) -> bool {
        self.permissions.contains(&required)
    }
}

pub struct CredentialValidator {
    store: Store,
}

impl CredentialValidator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn validate(&self, bearer: &str) -> Result<Credential, CredentialError> {
        if !bearer.starts_with(KEY_PREFIX) {
            return Err(CredentialError::Invalid);
        }

        let hash = hash_key(bearer);
        let key: ApiKey = self
            .store
            .get_api_key_by_hash(&hash)
            .await
            .map_err(|_| CredentialError::Invalid)?
            .ok_or(CredentialError::Invalid)?;

        if key.revoked_at.is_some() {
            return Err(CredentialError::Revoked);
        }
        if let Some(expires_at) = key.expires_at {
            if expires_at < chrono::Utc::now() {
                return Err(CredentialError::Expired);
            }
        }

        let store = self.store.clone();
        let key_id = key.id;
        tokio::spawn(async move {
            if let Err(err) = store.touch_api_key_last_used(key_id, chrono::Utc::now()).await {
                debug!(%key_id, error = %err, "failed to record api key last-used timestamp");
            }
        });

        Ok(Credential {
            api_key_id: key.id,
            organization_id: key.organization_id,
            permissions: key.permissions,
        })
    }

    pub fn require(credential: &Credential, permission: Permission) -> Result<(), CredentialError> {
        if credential.has(permission) {
            Ok(())
        } else {
            Err(CredentialError::Forbidden { permission: permission.as_str().to_string() })
        }
    }
}

pub fn hash_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generates a new raw key and its prefix for display, paired with the
/// hash that gets persisted. The raw value is returned exactly once.
pub fn generate_key() -> (String, String) {
    let suffix = Uuid::new_v4().simple().to_string();
    let raw = format!("{KEY_PREFIX}{suffix}");
    let prefix = format!("{}...{}", &raw[..8], &raw[raw.len() - 4..]);
    (raw, prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_membership_is_case_sensitive() {
        let cred = Credential {
            api_key_id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            permissions: vec![Permission::EventsWrite],
        };
        assert!(cred.has(Permission::EventsWrite));
        assert!(!cred.has(Permission::UsageRead));
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash_key("mtl_abc"), hash_key("mtl_abc"));
        assert_ne!(hash_key("mtl_abc"), hash_key("mtl_abd"));
    }
}
