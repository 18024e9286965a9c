//! TURN/STUN credential management.
//!
//! Credentials are short-lived and service-issued. The provider fetches them
//! lazily, caches them for their TTL, and substitutes the statically
//! configured fallback STUN host when the service has none to offer. A stale
//! or missing credential set is never merged with the fallback.

use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("credential request failed: {0}")]
    Request(String),
}

/// A credential set issued by the home service.
///
/// Replaced wholesale on refresh; never partially mutated.
#[derive(Debug, Clone)]
pub struct TurnCredentials {
    /// Server URIs in preference order.
    pub urls: Vec<String>,
    pub username: String,
    pub password: String,
    /// Validity duration granted by the service.
    pub ttl: Duration,
    /// When this set was fetched.
    pub fetched_at: Instant,
}

impl TurnCredentials {
    pub fn is_expired(&self) -> bool {
        self.fetched_at.elapsed() > self.ttl
    }
}

/// Connectivity bootstrap handed to the media stack when creating a session.
#[derive(Debug, Clone)]
pub enum TurnConfig {
    /// A valid, service-issued TURN credential set.
    Managed(TurnCredentials),
    /// No managed servers available; use the configured STUN host only.
    FallbackStun(String),
}

/// Home-service endpoint yielding TURN credentials.
///
/// `Ok(None)` means the service does not provide managed TURN servers,
/// which is not an error.
#[async_trait]
pub trait TurnCredentialSource: Send + Sync {
    async fn fetch(&self) -> Result<Option<TurnCredentials>, TurnError>;
}

/// Fetches and caches TURN credentials, falling back to a static STUN host.
pub struct TurnCredentialProvider {
    source: Arc<dyn TurnCredentialSource>,
    cached: RwLock<Option<TurnCredentials>>,
    fallback_stun_host: String,
}

impl TurnCredentialProvider {
    pub fn new(source: Arc<dyn TurnCredentialSource>, fallback_stun_host: impl Into<String>) -> Self {
        Self {
            source,
            cached: RwLock::new(None),
            fallback_stun_host: fallback_stun_host.into(),
        }
    }

    /// The last successfully fetched credential set, if still held.
    pub async fn cached(&self) -> Option<TurnCredentials> {
        self.cached.read().await.clone()
    }

    pub fn fallback_stun_host(&self) -> &str {
        &self.fallback_stun_host
    }

    /// Resolve the connectivity config for a new media session.
    ///
    /// Refreshes lazily when the cache is absent or expired. Fetch failure is
    /// non-fatal: the previous set is reused while valid, otherwise the
    /// fallback STUN host is substituted.
    pub async fn config(&self) -> TurnConfig {
        {
            let guard = self.cached.read().await;
            if let Some(creds) = &*guard
                && !creds.is_expired()
            {
                return TurnConfig::Managed(creds.clone());
            }
        }

        match self.source.fetch().await {
            Ok(Some(creds)) => {
                debug!(
                    "Fetched TURN credentials ({} urls, ttl {:?})",
                    creds.urls.len(),
                    creds.ttl
                );
                let mut guard = self.cached.write().await;
                *guard = Some(creds.clone());
                TurnConfig::Managed(creds)
            }
            Ok(None) => {
                debug!(
                    "Home service provides no TURN servers, using fallback STUN {}",
                    self.fallback_stun_host
                );
                TurnConfig::FallbackStun(self.fallback_stun_host.clone())
            }
            Err(e) => {
                warn!("TURN credential fetch failed: {}, falling back", e);
                // An expired set is treated as absent, not retried here.
                let guard = self.cached.read().await;
                match &*guard {
                    Some(creds) if !creds.is_expired() => TurnConfig::Managed(creds.clone()),
                    _ => TurnConfig::FallbackStun(self.fallback_stun_host.clone()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeSource {
        fetches: AtomicUsize,
        fail: AtomicBool,
        provide: Option<TurnCredentials>,
    }

    impl FakeSource {
        fn new(provide: Option<TurnCredentials>) -> Self {
            Self {
                fetches: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                provide,
            }
        }
    }

    #[async_trait]
    impl TurnCredentialSource for FakeSource {
        async fn fetch(&self) -> Result<Option<TurnCredentials>, TurnError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(TurnError::Request("network down".into()));
            }
            Ok(self.provide.clone())
        }
    }

    fn creds(ttl: Duration) -> TurnCredentials {
        TurnCredentials {
            urls: vec!["turn:turn.example.com:3478".into()],
            username: "user".into(),
            password: "secret".into(),
            ttl,
            fetched_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_fetch_caches_until_expiry() {
        let source = Arc::new(FakeSource::new(Some(creds(Duration::from_secs(3600)))));
        let provider = TurnCredentialProvider::new(source.clone(), "stun.example.com");

        assert!(matches!(provider.config().await, TurnConfig::Managed(_)));
        assert!(matches!(provider.config().await, TurnConfig::Managed(_)));
        // Second call served from cache.
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_credentials_refetched() {
        let source = Arc::new(FakeSource::new(Some(creds(Duration::ZERO))));
        let provider = TurnCredentialProvider::new(source.clone(), "stun.example.com");

        provider.config().await;
        provider.config().await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_managed_servers_falls_back_to_stun() {
        let source = Arc::new(FakeSource::new(None));
        let provider = TurnCredentialProvider::new(source, "stun.example.com");

        match provider.config().await {
            TurnConfig::FallbackStun(host) => assert_eq!(host, "stun.example.com"),
            other => panic!("expected fallback, got {:?}", other),
        }
        assert!(provider.cached().await.is_none());
    }

    #[tokio::test]
    async fn test_fetch_failure_reuses_valid_cache() {
        let source = Arc::new(FakeSource::new(Some(creds(Duration::from_secs(3600)))));
        let provider = TurnCredentialProvider::new(source.clone(), "stun.example.com");

        assert!(matches!(provider.config().await, TurnConfig::Managed(_)));

        // The cached set is still valid, so a failing source never degrades
        // an in-flight call placement.
        source.fail.store(true, Ordering::SeqCst);
        assert!(matches!(provider.config().await, TurnConfig::Managed(_)));
    }

    #[tokio::test]
    async fn test_fetch_failure_without_cache_falls_back() {
        let source = Arc::new(FakeSource::new(Some(creds(Duration::from_secs(3600)))));
        source.fail.store(true, Ordering::SeqCst);
        let provider = TurnCredentialProvider::new(source, "stun.example.com");

        match provider.config().await {
            TurnConfig::FallbackStun(host) => assert_eq!(host, "stun.example.com"),
            other => panic!("expected fallback, got {:?}", other),
        }
    }
}
