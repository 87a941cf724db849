//! Credential parsing and identity resolution.
//!
//! A credential looks like `gwo_{environment}_{random}`.  Resolution first
//! consults the [`IdentityCache`] keyed by the SHA-256 of the raw credential;
//! on a miss the [`CredentialStore`] is queried by lookup prefix and the
//! candidate's Argon2 hash is verified before the identity is cached.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::error::GatewayError;

pub mod cache;
pub mod store;

pub use cache::IdentityCache;
pub use store::{
    generate_credential, hash_credential, verify_credential, CredentialStore, GeneratedCredential,
    MemoryCredentialStore, StoredCredential,
};

pub const CREDENTIAL_SCHEME: &str = "gwo";
const MIN_RANDOM_LEN: usize = 16;
const LOOKUP_RANDOM_CHARS: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid credential")]
    Invalid,
    #[error("credential expired")]
    Expired,
    #[error("credential revoked")]
    Revoked,
    #[error("credential store error: {0}")]
    Store(String),
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Invalid => GatewayError::InvalidCredential,
            AuthError::Expired => GatewayError::ExpiredCredential,
            AuthError::Revoked => GatewayError::RevokedCredential,
            AuthError::Store(msg) => GatewayError::InternalError(msg),
        }
    }
}

/// Borrowed view of a syntactically valid credential.
#[derive(Debug, Clone, Copy)]
pub struct Credential<'a> {
    raw: &'a str,
    environment: &'a str,
    random: &'a str,
}

impl<'a> Credential<'a> {
    pub fn parse(raw: &'a str) -> Result<Self, AuthError> {
        let mut parts = raw.splitn(3, '_');
        let (Some(scheme), Some(environment), Some(random)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Invalid);
        };
        if scheme != CREDENTIAL_SCHEME {
            return Err(AuthError::Invalid);
        }
        if environment.is_empty()
            || !environment
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        {
            return Err(AuthError::Invalid);
        }
        if random.len() < MIN_RANDOM_LEN || !random.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(AuthError::Invalid);
        }
        Ok(Self {
            raw,
            environment,
            random,
        })
    }

    pub fn environment(&self) -> &'a str {
        self.environment
    }

    /// `gwo_{env}_{first 8 random chars}`; safe to log and index on.
    pub fn lookup_prefix(&self) -> String {
        format!(
            "{}_{}_{}",
            CREDENTIAL_SCHEME,
            self.environment,
            &self.random[..LOOKUP_RANDOM_CHARS]
        )
    }

    /// Hex SHA-256 of the whole credential, used as the cache key.
    pub fn cache_key(&self) -> String {
        hex::encode(Sha256::digest(self.raw.as_bytes()))
    }

    pub fn raw(&self) -> &'a str {
        self.raw
    }
}

/// Resolved caller.  Immutable once built; shared behind an `Arc`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Identity {
    pub key_id: String,
    pub key_prefix: String,
    pub org_id: String,
    pub team_id: Option<String>,
    pub user_id: String,
    pub environment: String,
    pub permissions: Vec<String>,
    pub rate_limit: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Identity {
    /// Key used for quota windows.
    pub fn quota_key(&self) -> String {
        format!("{}:{}", self.org_id, self.key_id)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|t| t <= Utc::now()).unwrap_or(false)
    }

    /// Whether this identity may call tools on `server`.
    pub fn permits(&self, server: &str) -> bool {
        self.permissions.iter().any(|p| {
            p == "*" || p == "mcp:*" || p.strip_prefix("mcp:").map(|s| s == server).unwrap_or(false)
        })
    }
}

/// Resolves raw credentials to identities through the cache and the store.
pub struct AuthResolver {
    store: Arc<dyn CredentialStore>,
    cache: IdentityCache,
    default_rate_limit: u64,
}

impl AuthResolver {
    pub fn new(store: Arc<dyn CredentialStore>, cache_ttl: Duration, default_rate_limit: u64) -> Self {
        Self {
            store,
            cache: IdentityCache::new(cache_ttl),
            default_rate_limit,
        }
    }

    pub fn cache(&self) -> &IdentityCache {
        &self.cache
    }

    pub async fn resolve(&self, raw: &str) -> Result<Arc<Identity>, AuthError> {
        let credential = Credential::parse(raw)?;
        let cache_key = credential.cache_key();

        if let Some(identity) = self.cache.get(&cache_key) {
            if identity.is_expired() {
                self.cache.invalidate(&cache_key);
                return Err(AuthError::Expired);
            }
            tracing::trace!(key_prefix = %identity.key_prefix, "identity cache hit");
            return Ok(identity);
        }

        let prefix = credential.lookup_prefix();
        let candidates = self.store.find_by_prefix(&prefix).await?;
        if candidates.is_empty() {
            tracing::debug!(key_prefix = %prefix, "no credential for prefix");
            return Err(AuthError::Invalid);
        }

        let stored = verify_candidates(raw.to_string(), candidates).await?;
        if stored.revoked {
            tracing::info!(key_prefix = %prefix, key_id = %stored.key_id, "revoked credential presented");
            return Err(AuthError::Revoked);
        }
        if stored.expires_at.map(|t| t <= Utc::now()).unwrap_or(false) {
            tracing::info!(key_prefix = %prefix, key_id = %stored.key_id, "expired credential presented");
            return Err(AuthError::Expired);
        }

        let rate_limit = if stored.rate_limit == 0 {
            self.default_rate_limit
        } else {
            stored.rate_limit
        };
        let identity = Arc::new(Identity {
            key_id: stored.key_id,
            key_prefix: prefix,
            org_id: stored.org_id,
            team_id: stored.team_id,
            user_id: stored.user_id,
            environment: stored.environment,
            permissions: stored.permissions,
            rate_limit,
            expires_at: stored.expires_at,
        });
        self.cache.insert(cache_key, identity.clone());
        Ok(identity)
    }
}

/// Argon2 verification is CPU bound; run it off the async workers.
async fn verify_candidates(
    raw: String,
    candidates: Vec<StoredCredential>,
) -> Result<StoredCredential, AuthError> {
    tokio::task::spawn_blocking(move || {
        candidates
            .into_iter()
            .find(|c| verify_credential(&raw, &c.key_hash))
            .ok_or(AuthError::Invalid)
    })
    .await
    .map_err(|e| AuthError::Store(format!("verification task failed: {e}")))?
}
