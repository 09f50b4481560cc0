//! # ShellCache Service Worker
//!
//! Offline cache controller for a single-page app shell.
//!
//! ## Features
//!
//! - **Install**: populate a versioned bucket from the asset list, best-effort
//! - **Activate**: delete every bucket but the current one, claim open pages
//! - **Fetch**: network-first for navigations, cache-first for everything else
//! - **Message**: `{"type": "SKIP_WAITING"}` forces a waiting version live
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerRuntime ── dispatch(WorkerEvent) ──→ CacheController
//!                                                     ├── CacheStorage (buckets)
//!                                                     └── Fetcher (network)
//! ```

use shellcache_common::ShellCacheError;
use shellcache_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod config;
pub mod controller;
pub mod runtime;

#[cfg(test)]
mod test_support;

pub use cache::{Cache, CacheEntry, CacheStorage, MemoryCacheStorage};
pub use config::CacheConfig;
pub use controller::{
    ActivateReport, AssetFailure, CacheController, FetchResponse, InstallReport, MessageAction,
    ResponseSource,
};
pub use runtime::{
    ClientId, EventKind, EventOutcome, RuntimeCommand, RuntimeNotification, ServiceWorker,
    ServiceWorkerId, ServiceWorkerRuntime, ServiceWorkerState, WorkerEvent,
};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Network error: {0}")]
    NetworkError(#[from] NetError),

    #[error("Bad status {status} for {url}")]
    BadStatus { url: String, status: u16 },

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Common(#[from] ShellCacheError),
}
