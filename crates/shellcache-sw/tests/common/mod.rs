//! Shared fixtures for the integration scenarios.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use shellcache_common::{try_init_logging, LogConfig};
use shellcache_net::{Fetcher, NetError, Request, RequestKey, Response};
use shellcache_sw::{CacheConfig, CacheController, CacheStorage, MemoryCacheStorage, ServiceWorkerError};
use tokio::sync::Notify;
use url::Url;

pub const SCOPE: &str = "https://calc.example/";

pub fn init_logging() {
    let _ = try_init_logging(LogConfig::debug().with_filter("shellcache_sw=debug"));
}

pub fn scope() -> Url {
    Url::parse(SCOPE).unwrap()
}

pub fn url(relative: &str) -> Url {
    scope().join(relative).unwrap()
}

/// Network double with per-URL canned responses.
#[derive(Default)]
pub struct ScriptedNetwork {
    routes: Mutex<HashMap<Url, (u16, Vec<u8>)>>,
    offline: AtomicBool,
    calls: AtomicUsize,
    seen: Mutex<Vec<Url>>,
}

impl ScriptedNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve every default asset with a 200.
    pub fn serving_app_shell(config: &CacheConfig) -> Arc<Self> {
        let network = Self::new();
        for asset in config.resolved_assets().unwrap() {
            let body = format!("body of {asset}");
            network.respond(&asset, 200, body.as_bytes());
        }
        network
    }

    pub fn respond(&self, url: &Url, status: u16, body: &[u8]) {
        self.routes
            .lock()
            .unwrap()
            .insert(url.clone(), (status, body.to_vec()));
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_to(&self, url: &Url) -> usize {
        self.seen.lock().unwrap().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl Fetcher for ScriptedNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request.url.clone());

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline(request.url.to_string()));
        }

        let route = self.routes.lock().unwrap().get(&request.url).cloned();
        match route {
            Some((status, body)) => Ok(Response::new(request.url.clone(), status, body)),
            None => Err(NetError::RequestFailed(format!("DNS lookup failed for {}", request.url))),
        }
    }
}

/// Instrumented storage: deletes can fail per bucket, puts into a held
/// bucket wait for `release_puts`, and lookups and puts are counted.
pub struct FlakyStorage {
    inner: MemoryCacheStorage,
    failing_deletes: Mutex<HashSet<String>>,
    held_bucket: Mutex<Option<String>>,
    release: Notify,
    lookups: AtomicUsize,
    puts: Mutex<HashMap<String, usize>>,
}

impl FlakyStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryCacheStorage::new(),
            failing_deletes: Mutex::new(HashSet::new()),
            held_bucket: Mutex::new(None),
            release: Notify::new(),
            lookups: AtomicUsize::new(0),
            puts: Mutex::new(HashMap::new()),
        })
    }

    pub fn fail_delete_of(&self, name: &str) {
        self.failing_deletes.lock().unwrap().insert(name.to_string());
    }

    /// Park a put into `name` until [`release_puts`](Self::release_puts).
    pub fn hold_puts_to(&self, name: &str) {
        *self.held_bucket.lock().unwrap() = Some(name.to_string());
    }

    pub fn release_puts(&self) {
        self.held_bucket.lock().unwrap().take();
        self.release.notify_one();
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Put attempts into `name`, successful or not.
    pub fn puts_to(&self, name: &str) -> usize {
        self.puts.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl CacheStorage for FlakyStorage {
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError> {
        self.inner.open(name).await
    }

    async fn has(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        self.inner.has(name).await
    }

    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
        self.inner.keys().await
    }

    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        if self.failing_deletes.lock().unwrap().contains(name) {
            return Err(ServiceWorkerError::CacheError(format!("{name} is locked")));
        }
        self.inner.delete(name).await
    }

    async fn match_in(
        &self,
        name: &str,
        key: &RequestKey,
    ) -> Result<Option<Response>, ServiceWorkerError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.match_in(name, key).await
    }

    async fn put(
        &self,
        name: &str,
        key: RequestKey,
        response: Response,
    ) -> Result<(), ServiceWorkerError> {
        *self.puts.lock().unwrap().entry(name.to_string()).or_default() += 1;
        let held = self.held_bucket.lock().unwrap().as_deref() == Some(name);
        if held {
            self.release.notified().await;
        }
        self.inner.put(name, key, response).await
    }
}

pub fn app_config(version: &str) -> CacheConfig {
    CacheConfig::for_scope(scope()).with_version(version)
}

pub fn controller(
    config: CacheConfig,
    storage: Arc<dyn CacheStorage>,
    network: Arc<ScriptedNetwork>,
) -> Arc<CacheController> {
    Arc::new(CacheController::new(config, storage, network).unwrap())
}

/// Fill `bucket` with `count` placeholder entries.
pub async fn seed_bucket(storage: &dyn CacheStorage, bucket: &str, count: usize) {
    storage.open(bucket).await.unwrap();
    for i in 0..count {
        let u = url(&format!("old/asset-{i}.js"));
        storage
            .put(bucket, RequestKey::get(&u), Response::new(u.clone(), 200, "old"))
            .await
            .unwrap();
    }
}
