use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{AuthError, Credential, CREDENTIAL_SCHEME};

/// Persisted form of an issued credential.  Only the lookup prefix and an
/// Argon2 PHC hash of the full credential are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCredential {
    pub key_id: String,
    pub prefix: String,
    pub key_hash: String,
    pub org_id: String,
    #[serde(default)]
    pub team_id: Option<String>,
    pub user_id: String,
    pub environment: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Requests per quota window; 0 means "use the gateway default".
    #[serde(default)]
    pub rate_limit: u64,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked: bool,
}

/// Narrow read interface over wherever credentials live.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// All credentials sharing a lookup prefix (normally zero or one).
    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<StoredCredential>, AuthError>;
}

/// In-process credential table, seeded from the gateway config file.
#[derive(Default)]
pub struct MemoryCredentialStore {
    by_prefix: DashMap<String, Vec<StoredCredential>>,
    lookups: AtomicU64,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, cred: StoredCredential) {
        self.by_prefix
            .entry(cred.prefix.clone())
            .or_default()
            .push(cred);
    }

    /// Mark every credential with `key_id` as revoked.
    pub fn revoke(&self, key_id: &str) -> bool {
        let mut found = false;
        for mut entry in self.by_prefix.iter_mut() {
            for cred in entry.value_mut().iter_mut().filter(|c| c.key_id == key_id) {
                cred.revoked = true;
                found = true;
            }
        }
        found
    }

    /// Number of times the store was consulted.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<StoredCredential>, AuthError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .by_prefix
            .get(prefix)
            .map(|v| v.value().clone())
            .unwrap_or_default())
    }
}

/// Hash a raw credential into an Argon2id PHC string.
pub fn hash_credential(raw: &str, params: Params) -> Result<String, AuthError> {
    let salt_bytes: [u8; 16] = rand::random();
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| AuthError::Store(format!("salt encoding: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    argon2
        .hash_password(raw.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AuthError::Store(format!("argon2 hash: {e}")))
}

/// Constant-time check of a raw credential against a PHC hash.  Parameters
/// are read from the hash itself.
pub fn verify_credential(raw: &str, phc: &str) -> bool {
    match PasswordHash::new(phc) {
        Ok(parsed) => Argon2::default()
            .verify_password(raw.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "stored credential hash is not a valid PHC string");
            false
        }
    }
}

/// A freshly minted credential.  `raw` is shown once and never stored.
#[derive(Debug, Clone)]
pub struct GeneratedCredential {
    pub raw: String,
    pub stored: StoredCredential,
}

/// Mint `gwo_{environment}_{32 hex}` together with its storable record.
pub fn generate_credential(
    environment: &str,
    org_id: &str,
    user_id: &str,
    params: Params,
) -> Result<GeneratedCredential, AuthError> {
    let random: [u8; 16] = rand::random();
    let raw = format!("{}_{}_{}", CREDENTIAL_SCHEME, environment, hex::encode(random));
    let parsed = Credential::parse(&raw)?;
    let stored = StoredCredential {
        key_id: uuid::Uuid::new_v4().to_string(),
        prefix: parsed.lookup_prefix(),
        key_hash: hash_credential(&raw, params)?,
        org_id: org_id.to_string(),
        team_id: None,
        user_id: user_id.to_string(),
        environment: environment.to_string(),
        permissions: vec!["*".to_string()],
        rate_limit: 0,
        expires_at: None,
        revoked: false,
    };
    Ok(GeneratedCredential { raw, stored })
}
