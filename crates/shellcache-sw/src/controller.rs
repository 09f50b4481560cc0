//! The cache controller: install, activate, fetch, and message handlers.
//!
//! Handlers never touch lifecycle state themselves. Each returns a report
//! carrying the signal the runtime should act on (skip waiting after
//! install, claim clients after activate).

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use serde::Deserialize;
use shellcache_common::{retry_if, with_timeout};
use shellcache_net::{Fetcher, NetError, Request, RequestKey, Response};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::config::CacheConfig;
use crate::ServiceWorkerError;

/// Where a fetch answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
}

/// Response handed back to the page.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub response: Response,
    pub source: ResponseSource,
}

impl FetchResponse {
    pub fn from_cache(response: Response) -> Self {
        Self {
            response,
            source: ResponseSource::Cache,
        }
    }

    pub fn from_network(response: Response) -> Self {
        Self {
            response,
            source: ResponseSource::Network,
        }
    }

    pub fn is_from_cache(&self) -> bool {
        self.source == ResponseSource::Cache
    }
}

/// An asset that could not be stored during install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetFailure {
    pub url: Url,
    pub reason: String,
}

/// Outcome of the install handler.
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub cache_name: String,
    pub cached: Vec<Url>,
    pub failed: Vec<AssetFailure>,
    /// Activate without waiting for older clients to close.
    pub skip_waiting: bool,
}

impl InstallReport {
    /// Every asset landed in the bucket.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of the activate handler.
#[derive(Debug, Clone)]
pub struct ActivateReport {
    pub kept: String,
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Take control of already open clients.
    pub claim_clients: bool,
}

/// What a control message asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageAction {
    SkipWaiting,
    Ignored,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ControlMessage {
    #[serde(rename = "SKIP_WAITING")]
    SkipWaiting,
}

/// Owns the caching policy for one controller version.
pub struct CacheController {
    config: CacheConfig,
    cache_name: String,
    assets: Vec<Url>,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    /// Fetch-side cache writes. Dropping the controller aborts whatever is
    /// still queued here, so the runtime joins these before it retires a
    /// version.
    background: Mutex<JoinSet<()>>,
}

impl fmt::Debug for CacheController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheController")
            .field("cache_name", &self.cache_name)
            .field("assets", &self.assets.len())
            .finish_non_exhaustive()
    }
}

impl CacheController {
    /// Create a controller. Fails if the config is invalid or an asset URL
    /// does not resolve.
    pub fn new(
        config: CacheConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceWorkerError> {
        config.validate()?;
        let assets = config.resolved_assets()?;
        let cache_name = config.cache_name();

        Ok(Self {
            config,
            cache_name,
            assets,
            storage,
            fetcher,
            background: Mutex::new(JoinSet::new()),
        })
    }

    /// Name of the bucket this controller owns.
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Resolved asset list.
    pub fn assets(&self) -> &[Url] {
        &self.assets
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    // ==================== Install ====================

    /// Open the bucket and populate it from the asset list.
    ///
    /// Never fails: each asset is fetched independently and a failure is
    /// logged and reported, not propagated.
    pub async fn install(&self) -> InstallReport {
        info!(cache = %self.cache_name, assets = self.assets.len(), "Opened cache and caching assets");

        if let Err(e) = self.storage.open(&self.cache_name).await {
            warn!(cache = %self.cache_name, error = %e, "Failed to open cache");
            let reason = e.to_string();
            return InstallReport {
                cache_name: self.cache_name.clone(),
                cached: Vec::new(),
                failed: self
                    .assets
                    .iter()
                    .map(|url| AssetFailure {
                        url: url.clone(),
                        reason: reason.clone(),
                    })
                    .collect(),
                skip_waiting: self.config.skip_waiting_on_install,
            };
        }

        let outcomes = join_all(self.assets.iter().map(|url| async move {
            let result = self.cache_asset(url).await;
            (url.clone(), result)
        }))
        .await;

        let mut cached = Vec::new();
        let mut failed = Vec::new();
        for (url, result) in outcomes {
            match result {
                Ok(()) => cached.push(url),
                Err(e) => {
                    warn!(url = %url, error = %e, "Failed to cache asset");
                    failed.push(AssetFailure {
                        url,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            cache = %self.cache_name,
            cached = cached.len(),
            failed = failed.len(),
            "Install finished"
        );

        InstallReport {
            cache_name: self.cache_name.clone(),
            cached,
            failed,
            skip_waiting: self.config.skip_waiting_on_install,
        }
    }

    async fn cache_asset(&self, url: &Url) -> Result<(), ServiceWorkerError> {
        let request = Request::get(url.clone());
        let response = retry_if(
            &self.config.install_retry,
            || self.fetcher.fetch(&request),
            NetError::is_retryable,
        )
        .await?;

        if !response.ok() {
            return Err(ServiceWorkerError::BadStatus {
                url: url.to_string(),
                status: response.status,
            });
        }

        self.storage
            .put(&self.cache_name, request.key(), response)
            .await
    }

    // ==================== Activate ====================

    /// Delete every bucket except the current one.
    pub async fn activate(&self) -> ActivateReport {
        let names = match self.storage.keys().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Failed to enumerate caches");
                Vec::new()
            }
        };

        let stale = names.into_iter().filter(|name| *name != self.cache_name);
        let results = join_all(stale.map(|name| async move {
            info!(cache = %name, "Deleting old cache");
            let result = self.storage.delete(&name).await;
            (name, result)
        }))
        .await;

        let mut deleted = Vec::new();
        let mut failed = Vec::new();
        for (name, result) in results {
            match result {
                Ok(_) => deleted.push(name),
                Err(e) => {
                    warn!(cache = %name, error = %e, "Failed to delete old cache");
                    failed.push((name, e.to_string()));
                }
            }
        }

        ActivateReport {
            kept: self.cache_name.clone(),
            deleted,
            failed,
            claim_clients: true,
        }
    }

    // ==================== Fetch ====================

    /// Answer an intercepted request.
    ///
    /// `Ok(None)` means no response is produced and the page sees a failed
    /// fetch. `Err` is only returned for a navigation that failed over the
    /// network with nothing cached.
    pub async fn handle_fetch(
        &self,
        request: &Request,
    ) -> Result<Option<FetchResponse>, ServiceWorkerError> {
        if request.is_navigation() {
            self.network_first(request).await.map(Some)
        } else {
            Ok(self.cache_first(request).await)
        }
    }

    async fn network_first(&self, request: &Request) -> Result<FetchResponse, ServiceWorkerError> {
        let network = match self.config.navigation_timeout() {
            Some(timeout) => match with_timeout(timeout, || self.fetcher.fetch(request)).await {
                Ok(result) => result,
                Err(_) => Err(NetError::Timeout(timeout)),
            },
            None => self.fetcher.fetch(request).await,
        };

        let error = match network {
            Ok(response) => {
                debug!(url = %request.url, status = response.status, "Navigation served from network");
                return Ok(FetchResponse::from_network(response));
            }
            Err(e) => e,
        };

        debug!(url = %request.url, error = %error, "Navigation failed, trying cache");
        match self.lookup(&request.key()).await {
            Some(response) => Ok(FetchResponse::from_cache(response)),
            None => Err(ServiceWorkerError::NetworkError(error)),
        }
    }

    async fn cache_first(&self, request: &Request) -> Option<FetchResponse> {
        if !request.is_get() {
            debug!(method = %request.method, url = %request.url, "Not a GET, bypassing cache");
            return match self.fetcher.fetch(request).await {
                Ok(response) => Some(FetchResponse::from_network(response)),
                Err(e) => {
                    debug!(url = %request.url, error = %e, "Network failed");
                    None
                }
            };
        }

        let key = request.key();
        if let Some(response) = self.lookup(&key).await {
            debug!(key = %key, "Cache hit");
            return Some(FetchResponse::from_cache(response));
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.is_cacheable() {
                    self.store_in_background(key, response.clone()).await;
                } else {
                    debug!(key = %key, status = response.status, kind = ?response.response_type, "Response not cacheable");
                }
                Some(FetchResponse::from_network(response))
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Network failed and nothing cached");
                None
            }
        }
    }

    async fn lookup(&self, key: &RequestKey) -> Option<Response> {
        match self.storage.match_in(&self.cache_name, key).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache lookup failed");
                None
            }
        }
    }

    async fn store_in_background(&self, key: RequestKey, response: Response) {
        let storage = Arc::clone(&self.storage);
        let cache_name = self.cache_name.clone();

        let mut background = self.background.lock().await;
        while background.try_join_next().is_some() {}
        // Never reopen the bucket: a newer version may already have deleted it.
        background.spawn(async move {
            if let Err(e) = storage.put(&cache_name, key.clone(), response).await {
                warn!(cache = %cache_name, key = %key, error = %e, "Background cache write failed");
            }
        });
    }

    /// Wait for every background cache write started so far.
    pub async fn wait_for_background_writes(&self) {
        let mut pending = std::mem::take(&mut *self.background.lock().await);
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Background cache write panicked");
            }
        }
    }

    // ==================== Message ====================

    /// Interpret a message posted by a page.
    pub fn handle_message(&self, data: &serde_json::Value) -> MessageAction {
        match ControlMessage::deserialize(data) {
            Ok(ControlMessage::SkipWaiting) => MessageAction::SkipWaiting,
            Err(_) => {
                debug!(message = %data, "Ignoring message");
                MessageAction::Ignored
            }
        }
    }
}
