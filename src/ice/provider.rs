//! ICE Configuration Provider
//!
//! Löst die STUN/TURN Liste für neue Peer Connections auf und cached sie
//! prozessweit. Dynamische TURN-Credentials gelten 24h, der Cache läuft nach
//! 20h ab. Schlägt der Abruf fehl, wird der statische Fallback für 5 Minuten
//! gecached. `get_ice_servers` schlägt nie fehl.

use super::credentials::CredentialSource;
use super::servers::{
    fallback_ice_servers, merge_servers, IceServer, IceServerSet, IceTransportPolicy,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// SETTINGS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceSettings {
    /// Angefragte Gültigkeit der Credentials
    pub credential_ttl: Duration,
    pub dynamic_cache_ttl: Duration,
    pub fallback_cache_ttl: Duration,
    pub fetch_timeout: Duration,
    pub pool_size: u8,
}

impl Default for IceSettings {
    fn default() -> Self {
        Self {
            credential_ttl: Duration::from_secs(24 * 60 * 60),
            dynamic_cache_ttl: Duration::from_secs(20 * 60 * 60),
            fallback_cache_ttl: Duration::from_secs(5 * 60),
            fetch_timeout: Duration::from_secs(5),
            pool_size: 10,
        }
    }
}

/// Herkunft des gecachten Sets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceOrigin {
    /// Dynamische Credentials + statischer Fallback
    Dynamic,
    /// Nur statischer Fallback
    Fallback,
}

struct CachedServers {
    servers: Vec<IceServer>,
    origin: IceOrigin,
    expires_at: Instant,
}

// ============================================================================
// PROVIDER
// ============================================================================

pub struct IceConfigProvider {
    source: Option<Arc<dyn CredentialSource>>,
    fallback: Vec<IceServer>,
    settings: IceSettings,
    cache: RwLock<Option<CachedServers>>,
}

impl IceConfigProvider {
    /// Ohne `source` wird immer der statische Fallback verwendet
    pub fn new(source: Option<Arc<dyn CredentialSource>>, settings: IceSettings) -> Self {
        Self {
            source,
            fallback: fallback_ice_servers(),
            settings,
            cache: RwLock::new(None),
        }
    }

    /// Ersetzt die statische Fallback-Liste
    ///
    /// Enthält sie keinen STUN-Eintrag, wird der Standard-STUN ergänzt.
    pub fn with_fallback(mut self, fallback: Vec<IceServer>) -> Self {
        let mut fallback: Vec<IceServer> =
            fallback.into_iter().filter(IceServer::is_usable).collect();
        if !fallback.iter().any(IceServer::is_stun) {
            let stun = fallback_ice_servers()
                .into_iter()
                .filter(IceServer::is_stun)
                .collect::<Vec<_>>();
            fallback = merge_servers(stun, &fallback);
        }
        self.fallback = fallback;
        self
    }

    /// Liefert das aktuelle Server-Set (gecached oder frisch aufgelöst)
    pub async fn get_ice_servers(&self, force_relay: bool) -> IceServerSet {
        let servers = match self.cached() {
            Some(servers) => servers,
            None => self.refresh().await,
        };

        IceServerSet {
            servers,
            pool_size: self.settings.pool_size,
            policy: if force_relay {
                IceTransportPolicy::Relay
            } else {
                IceTransportPolicy::All
            },
        }
    }

    /// Erzwingt einen neuen Abruf beim nächsten `get_ice_servers`
    pub fn clear_cache(&self) {
        if self.cache.write().take().is_some() {
            tracing::info!("ICE server cache cleared");
        }
    }

    /// Herkunft des gültigen Cache-Eintrags
    pub fn cached_origin(&self) -> Option<IceOrigin> {
        self.cache
            .read()
            .as_ref()
            .filter(|c| Instant::now() < c.expires_at)
            .map(|c| c.origin)
    }

    fn cached(&self) -> Option<Vec<IceServer>> {
        self.cache
            .read()
            .as_ref()
            .filter(|c| Instant::now() < c.expires_at)
            .map(|c| c.servers.clone())
    }

    async fn refresh(&self) -> Vec<IceServer> {
        let dynamic = match &self.source {
            Some(source) => {
                match tokio::time::timeout(
                    self.settings.fetch_timeout,
                    source.fetch(self.settings.credential_ttl),
                )
                .await
                {
                    Ok(Ok(servers)) => Some(
                        servers
                            .into_iter()
                            .filter(IceServer::is_usable)
                            .collect::<Vec<_>>(),
                    ),
                    Ok(Err(e)) => {
                        tracing::warn!("TURN credential fetch failed: {}", e);
                        None
                    }
                    Err(_) => {
                        tracing::warn!("TURN credential fetch timed out");
                        None
                    }
                }
            }
            None => None,
        };

        let (servers, origin, ttl) = match dynamic {
            Some(servers) if !servers.is_empty() => {
                tracing::info!("Using {} dynamic ICE server entries", servers.len());
                (
                    merge_servers(servers, &self.fallback),
                    IceOrigin::Dynamic,
                    self.settings.dynamic_cache_ttl,
                )
            }
            Some(_) => {
                tracing::warn!("Credential endpoint returned no usable ICE servers");
                (
                    self.fallback.clone(),
                    IceOrigin::Fallback,
                    self.settings.fallback_cache_ttl,
                )
            }
            None => (
                self.fallback.clone(),
                IceOrigin::Fallback,
                self.settings.fallback_cache_ttl,
            ),
        };

        *self.cache.write() = Some(CachedServers {
            servers: servers.clone(),
            origin,
            expires_at: Instant::now() + ttl,
        });
        servers
    }
}

impl std::fmt::Debug for IceConfigProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IceConfigProvider")
            .field("dynamic", &self.source.is_some())
            .field("cached", &self.cached_origin())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ice::IceError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSource {
        calls: AtomicUsize,
        response: Result<Vec<IceServer>, IceError>,
    }

    impl FakeSource {
        fn new(response: Result<Vec<IceServer>, IceError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                response,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CredentialSource for FakeSource {
        async fn fetch(&self, _ttl: Duration) -> Result<Vec<IceServer>, IceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.response.clone()
        }
    }

    fn turn() -> IceServer {
        IceServer::turn(&["turn:turn.example.org:3478"], "user", "pass")
    }

    #[tokio::test(start_paused = true)]
    async fn test_dynamic_set_is_merged_and_cached() {
        let source = FakeSource::new(Ok(vec![turn()]));
        let provider = IceConfigProvider::new(Some(source.clone()), IceSettings::default());

        let set = provider.get_ice_servers(false).await;
        assert_eq!(set.servers[0], turn());
        assert!(set.has_stun());
        assert_eq!(set.policy, IceTransportPolicy::All);
        assert_eq!(provider.cached_origin(), Some(IceOrigin::Dynamic));

        tokio::time::advance(Duration::from_secs(19 * 60 * 60)).await;
        provider.get_ice_servers(true).await;
        assert_eq!(source.calls(), 1);

        tokio::time::advance(Duration::from_secs(60 * 60 + 1)).await;
        provider.get_ice_servers(false).await;
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_caches_fallback_briefly() {
        let source = FakeSource::new(Err(IceError::Status(500)));
        let provider = IceConfigProvider::new(Some(source.clone()), IceSettings::default());

        let set = provider.get_ice_servers(false).await;
        assert!(!set.servers.is_empty());
        assert!(set.has_stun());
        assert_eq!(provider.cached_origin(), Some(IceOrigin::Fallback));

        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        provider.get_ice_servers(false).await;
        assert_eq!(source.calls(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        provider.get_ice_servers(false).await;
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_empty_or_invalid_payload_falls_back() {
        let unusable = IceServer {
            urls: vec!["turn:no-credentials.example.org".into()],
            username: None,
            credential: None,
        };
        for response in [Ok(vec![]), Ok(vec![unusable])] {
            let provider =
                IceConfigProvider::new(Some(FakeSource::new(response)), IceSettings::default());
            let set = provider.get_ice_servers(false).await;
            assert_eq!(set.servers, fallback_ice_servers());
            assert_eq!(provider.cached_origin(), Some(IceOrigin::Fallback));
        }
    }

    #[tokio::test]
    async fn test_clear_cache_forces_refetch() {
        let source = FakeSource::new(Ok(vec![turn()]));
        let provider = IceConfigProvider::new(Some(source.clone()), IceSettings::default());

        provider.get_ice_servers(false).await;
        provider.clear_cache();
        assert!(provider.cached_origin().is_none());
        provider.get_ice_servers(false).await;
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_force_relay_sets_policy() {
        let provider = IceConfigProvider::new(None, IceSettings::default());
        let set = provider.get_ice_servers(true).await;
        assert_eq!(set.policy, IceTransportPolicy::Relay);
        assert!(set.has_turn());
        assert_eq!(set.pool_size, 10);
    }

    #[tokio::test]
    async fn test_custom_fallback_always_gets_stun() {
        let provider = IceConfigProvider::new(None, IceSettings::default())
            .with_fallback(vec![turn()]);
        let set = provider.get_ice_servers(false).await;
        assert!(set.has_stun());
        assert!(set.servers.contains(&turn()));
    }
}
