//! LRU + TTL cache of resolved credentials with background refresh.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::auth::{AuthResolver, ProfileStore, ResolvedAuth};
use crate::error::AuthError;
use crate::settings::{AuthCacheSettings, Settings};

/// Entries older than TTL minus this get refreshed in the background on
/// the next hit, so callers rarely pay resolution latency.
const REFRESH_AHEAD: Duration = Duration::from_secs(60);

/// Parameters for a single preload.
#[derive(Debug, Clone)]
pub struct PreloadRequest {
    pub provider: String,
    pub profile_id: Option<String>,
    pub force: bool,
}

impl PreloadRequest {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            profile_id: None,
            force: false,
        }
    }

    pub fn with_profile(mut self, profile_id: impl Into<String>) -> Self {
        self.profile_id = Some(profile_id.into());
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    fn cache_key(&self) -> String {
        cache_key(&self.provider, self.profile_id.as_deref())
    }
}

struct CacheEntry {
    auth: ResolvedAuth,
    resolved_at: Instant,
    expires_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Access order, oldest first.
    access_order: Vec<String>,
    /// Keys with a background refresh in flight.
    refreshing: HashSet<String>,
}

impl CacheState {
    fn touch(&mut self, key: &str) {
        self.access_order.retain(|k| k != key);
        self.access_order.push(key.to_string());
    }

    fn store(&mut self, key: String, auth: ResolvedAuth, ttl: Duration, max_size: usize) {
        if !self.entries.contains_key(&key) {
            while self.entries.len() >= max_size && !self.access_order.is_empty() {
                let oldest = self.access_order.remove(0);
                self.entries.remove(&oldest);
                tracing::debug!(key = %oldest, "evicted oldest auth cache entry");
            }
        }
        let now = Instant::now();
        self.entries.insert(
            key.clone(),
            CacheEntry {
                auth,
                resolved_at: now,
                expires_at: now + ttl,
            },
        );
        self.touch(&key);
    }

    fn remove(&mut self, key: &str) -> bool {
        self.access_order.retain(|k| k != key);
        self.entries.remove(key).is_some()
    }
}

struct CacheInner {
    resolver: Arc<dyn AuthResolver>,
    profiles: Arc<dyn ProfileStore>,
    ttl: Duration,
    max_size: usize,
    refresh_ahead: Duration,
    state: Mutex<CacheState>,
}

/// Preload cache over an external resolver. Cheap to clone.
#[derive(Clone)]
pub struct AuthCache {
    inner: Arc<CacheInner>,
}

/// Per-entry diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct AuthEntryInfo {
    pub key: String,
    pub source: String,
    pub age_ms: u64,
    pub expires_in_ms: u64,
}

/// Snapshot returned by `AuthCache::stats`.
#[derive(Debug, Clone, Serialize)]
pub struct AuthCacheStats {
    pub size: usize,
    pub max_size: usize,
    pub refreshing: usize,
    pub entries: Vec<AuthEntryInfo>,
}

impl AuthCache {
    pub fn new(
        resolver: Arc<dyn AuthResolver>,
        profiles: Arc<dyn ProfileStore>,
        settings: AuthCacheSettings,
    ) -> Self {
        Self::with_refresh_ahead(resolver, profiles, settings, REFRESH_AHEAD)
    }

    fn with_refresh_ahead(
        resolver: Arc<dyn AuthResolver>,
        profiles: Arc<dyn ProfileStore>,
        settings: AuthCacheSettings,
        refresh_ahead: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                resolver,
                profiles,
                ttl: Duration::from_millis(settings.ttl_ms),
                max_size: settings.max_size.max(1),
                refresh_ahead,
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    /// Resolve (or fetch cached) auth for a provider/profile pair.
    ///
    /// A fresh entry is returned as-is; when it is inside the refresh-ahead
    /// window, at most one background resolution per key is started to
    /// replace it. A missing, expired, or forced entry resolves
    /// synchronously. Concurrent cold-key callers may each resolve; the
    /// last write wins.
    pub async fn preload(&self, req: PreloadRequest) -> Result<ResolvedAuth, AuthError> {
        let key = req.cache_key();
        if !req.force {
            let mut state = self.inner.state.lock().await;
            if let Some(entry) = state.entries.get(&key) {
                if Instant::now() < entry.expires_at {
                    let auth = entry.auth.clone();
                    let refresh_after = self.inner.ttl.saturating_sub(self.inner.refresh_ahead);
                    let wants_refresh = refresh_after > Duration::ZERO
                        && entry.resolved_at.elapsed() >= refresh_after;
                    state.touch(&key);
                    if wants_refresh && state.refreshing.insert(key.clone()) {
                        drop(state);
                        self.spawn_refresh(key, req);
                    }
                    return Ok(auth);
                }
            }
        }

        let auth = self.resolve(&req).await?;
        let mut state = self.inner.state.lock().await;
        state.store(key, auth.clone(), self.inner.ttl, self.inner.max_size);
        Ok(auth)
    }

    /// Preload several keys in parallel; per-key failures land in the map.
    pub async fn preload_batch(
        &self,
        requests: Vec<PreloadRequest>,
    ) -> HashMap<String, Result<ResolvedAuth, AuthError>> {
        let futures = requests.into_iter().map(|req| {
            let cache = self.clone();
            let key = req.cache_key();
            async move { (key, cache.preload(req).await) }
        });
        join_all(futures).await.into_iter().collect()
    }

    /// Batch-preload every configured provider and profile. Failures are
    /// logged and swallowed.
    pub async fn warm_cache(&self, settings: &Settings) {
        let mut requests = Vec::new();
        for (provider, provider_settings) in &settings.providers {
            requests.push(PreloadRequest::new(provider.clone()));
            for profile in &provider_settings.profiles {
                requests.push(PreloadRequest::new(provider.clone()).with_profile(profile.clone()));
            }
        }
        if requests.is_empty() {
            return;
        }
        let total = requests.len();
        let results = self.preload_batch(requests).await;
        let failed = results.values().filter(|r| r.is_err()).count();
        tracing::info!(total, failed, "auth cache warmed");
    }

    /// Walk the profile order (preferred first), skip cooldowns, and return
    /// the first credential that resolves; falls back to the profile-less
    /// default. None when everything failed.
    pub async fn find_available(
        &self,
        provider: &str,
        preferred_profile: Option<&str>,
    ) -> Option<ResolvedAuth> {
        let mut order: Vec<String> = Vec::new();
        if let Some(preferred) = preferred_profile {
            order.push(preferred.to_string());
        }
        for profile in self.inner.profiles.profile_order(provider).await {
            if !order.contains(&profile) {
                order.push(profile);
            }
        }

        for profile in &order {
            if self.inner.profiles.in_cooldown(provider, profile).await {
                tracing::debug!(provider, profile = %profile, "profile in cooldown, skipping");
                continue;
            }
            match self
                .preload(PreloadRequest::new(provider).with_profile(profile.clone()))
                .await
            {
                Ok(auth) => return Some(auth),
                Err(err) => {
                    tracing::warn!(provider, profile = %profile, error = %err, "profile failed, trying next");
                }
            }
        }

        match self.preload(PreloadRequest::new(provider)).await {
            Ok(auth) => Some(auth),
            Err(err) => {
                tracing::warn!(provider, error = %err, "all auth profiles exhausted");
                None
            }
        }
    }

    /// Drop a cached entry so the next call re-resolves. Called on 401.
    pub async fn invalidate(&self, provider: &str, profile_id: Option<&str>) -> bool {
        let key = cache_key(provider, profile_id);
        let removed = { self.inner.state.lock().await.remove(&key) };
        if removed {
            tracing::info!(key = %key, "invalidated cached auth");
        }
        removed
    }

    /// Drop everything; returns the number of entries removed.
    pub async fn clear(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        let count = state.entries.len();
        state.entries.clear();
        state.access_order.clear();
        count
    }

    pub async fn stats(&self) -> AuthCacheStats {
        let state = self.inner.state.lock().await;
        let now = Instant::now();
        let entries = state
            .entries
            .iter()
            .map(|(key, entry)| AuthEntryInfo {
                key: key.clone(),
                source: entry.auth.source.clone(),
                age_ms: entry.resolved_at.elapsed().as_millis() as u64,
                expires_in_ms: entry
                    .expires_at
                    .saturating_duration_since(now)
                    .as_millis() as u64,
            })
            .collect();
        AuthCacheStats {
            size: state.entries.len(),
            max_size: self.inner.max_size,
            refreshing: state.refreshing.len(),
            entries,
        }
    }

    async fn resolve(&self, req: &PreloadRequest) -> Result<ResolvedAuth, AuthError> {
        let credential = self
            .inner
            .resolver
            .resolve(&req.provider, req.profile_id.as_deref())
            .await?;
        Ok(ResolvedAuth {
            provider: normalize(&req.provider),
            profile_id: req.profile_id.clone(),
            source: credential.source,
            credential: credential.secret,
        })
    }

    fn spawn_refresh(&self, key: String, req: PreloadRequest) {
        let cache = self.clone();
        tokio::spawn(async move {
            let result = cache.resolve(&req).await;
            let mut state = cache.inner.state.lock().await;
            state.refreshing.remove(&key);
            match result {
                Ok(auth) => {
                    state.store(key, auth, cache.inner.ttl, cache.inner.max_size);
                }
                Err(err) => {
                    // Keep the still-valid entry; it serves until expiry.
                    tracing::warn!(key = %key, error = %err, "background auth refresh failed");
                }
            }
        });
    }
}

fn normalize(provider: &str) -> String {
    provider.trim().to_ascii_lowercase()
}

fn cache_key(provider: &str, profile_id: Option<&str>) -> String {
    match profile_id {
        Some(profile) => format!("{}:{}", normalize(provider), profile),
        None => normalize(provider),
    }
}
