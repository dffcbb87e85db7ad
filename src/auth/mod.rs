//! Credential preloading for agent workers.
//!
//! The cache sits between the scheduler and an external resolver: workers
//! get credentials that were (usually) resolved ahead of time, profiles in
//! cooldown are skipped, and a 401 from a provider invalidates the cached
//! entry so the next call re-resolves.

mod cache;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::AuthError;

pub use cache::{AuthCache, AuthCacheStats, AuthEntryInfo, PreloadRequest};

/// Output of a resolver call: the credential plus where it came from
/// (keychain, env, oauth refresh, …).
pub struct ResolvedCredential {
    pub secret: SecretString,
    pub source: String,
}

impl ResolvedCredential {
    pub fn new(secret: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            secret: SecretString::from(secret.into()),
            source: source.into(),
        }
    }
}

/// A credential held by the cache and handed to workers.
#[derive(Debug, Clone)]
pub struct ResolvedAuth {
    /// Normalized provider name.
    pub provider: String,
    pub profile_id: Option<String>,
    /// Resolution source tag, for diagnostics.
    pub source: String,
    pub credential: SecretString,
}

/// Resolves credentials for a provider, optionally scoped to a profile.
#[async_trait]
pub trait AuthResolver: Send + Sync {
    async fn resolve(
        &self,
        provider: &str,
        profile_id: Option<&str>,
    ) -> Result<ResolvedCredential, AuthError>;
}

/// Knows the configured profiles for each provider and which of them are
/// temporarily unusable.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Profile ids in resolution order.
    async fn profile_order(&self, provider: &str) -> Vec<String>;

    /// Whether the profile is rate-limited or otherwise cooling down.
    async fn in_cooldown(&self, provider: &str, profile_id: &str) -> bool;
}

/// Profile store for setups without per-provider profiles.
pub struct NoProfiles;

#[async_trait]
impl ProfileStore for NoProfiles {
    async fn profile_order(&self, _provider: &str) -> Vec<String> {
        Vec::new()
    }

    async fn in_cooldown(&self, _provider: &str, _profile_id: &str) -> bool {
        false
    }
}
