//! Static cache configuration: bucket versioning and the asset list.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use shellcache_common::{RetryConfig, ShellCacheError};
use url::Url;

/// Prefix shared by every bucket this app creates.
pub const DEFAULT_CACHE_PREFIX: &str = "ai-calculator-cache-";

/// Bump to invalidate every previously created bucket.
pub const DEFAULT_VERSION: &str = "v11";

/// App shell files and the third-party endpoints the app needs offline.
///
/// Only the font stylesheet is listed; the font binaries it references
/// are left to the browser's own HTTP cache.
pub const DEFAULT_ASSETS: &[&str] = &[
    "./",
    "./index.html",
    "./manifest.json",
    "./icon.svg",
    "https://cdn.tailwindcss.com",
    "https://aistudiocdn.com/react@^19.2.0",
    "https://aistudiocdn.com/react-dom@^19.2.0/client",
    "https://esm.run/@google/genai",
    "https://fonts.googleapis.com/css2?family=Tajawal:wght@400;500;700&family=Cairo:wght@400;700&family=Almarai:wght@400;700&display=swap",
];

/// Cache controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Bucket name prefix.
    pub cache_prefix: String,
    /// Version suffix; the bucket name is `cache_prefix + version`.
    pub version: String,
    /// Base URL relative asset entries resolve against.
    pub scope: Url,
    /// Asset list, in declaration order.
    pub assets: Vec<String>,
    /// Navigation network timeout in milliseconds before falling back to
    /// the cache. `None` waits for the network indefinitely.
    pub navigation_timeout_ms: Option<u64>,
    /// Activate right after install instead of waiting for pages held by
    /// the previous version to close.
    pub skip_waiting_on_install: bool,
    /// Retry policy for each asset fetched during install.
    #[serde(skip, default = "RetryConfig::none")]
    pub install_retry: RetryConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_prefix: DEFAULT_CACHE_PREFIX.to_string(),
            version: DEFAULT_VERSION.to_string(),
            scope: default_scope(),
            assets: DEFAULT_ASSETS.iter().map(|s| s.to_string()).collect(),
            navigation_timeout_ms: None,
            skip_waiting_on_install: true,
            install_retry: RetryConfig::none(),
        }
    }
}

fn default_scope() -> Url {
    Url::parse("http://localhost/").expect("static scope URL is valid")
}

impl CacheConfig {
    /// Config with the default assets served from `scope`.
    pub fn for_scope(scope: Url) -> Self {
        Self {
            scope,
            ..Default::default()
        }
    }

    /// Parse a JSON config document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ShellCacheError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ShellCacheError::config_with_source("invalid cache config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Replace the asset list.
    pub fn with_assets<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.assets = assets.into_iter().map(Into::into).collect();
        self
    }

    /// Set the install retry policy.
    pub fn with_install_retry(mut self, retry: RetryConfig) -> Self {
        self.install_retry = retry;
        self
    }

    /// Set whether install requests immediate activation.
    pub fn with_skip_waiting_on_install(mut self, skip: bool) -> Self {
        self.skip_waiting_on_install = skip;
        self
    }

    /// Set the navigation network timeout.
    pub fn with_navigation_timeout(mut self, timeout: Duration) -> Self {
        self.navigation_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Navigation network timeout, if any.
    pub fn navigation_timeout(&self) -> Option<Duration> {
        self.navigation_timeout_ms.map(Duration::from_millis)
    }

    /// Name of the current bucket.
    pub fn cache_name(&self) -> String {
        format!("{}{}", self.cache_prefix, self.version)
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ShellCacheError> {
        if self.version.trim().is_empty() {
            return Err(ShellCacheError::config("cache version must not be empty"));
        }
        if self.scope.cannot_be_a_base() {
            return Err(ShellCacheError::config(format!(
                "scope {} cannot resolve relative assets",
                self.scope
            )));
        }
        Ok(())
    }

    /// Asset list resolved to absolute URLs against `scope`.
    pub fn resolved_assets(&self) -> Result<Vec<Url>, ShellCacheError> {
        self.assets
            .iter()
            .map(|asset| {
                self.scope.join(asset).map_err(|e| {
                    ShellCacheError::config_with_source(format!("invalid asset URL {asset:?}"), e)
                })
            })
            .collect()
    }
}
