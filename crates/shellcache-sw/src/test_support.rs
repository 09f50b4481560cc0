//! Scripted network for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use shellcache_net::{Fetcher, NetError, Request, Response};
use url::Url;

#[derive(Default)]
pub(crate) struct ScriptedFetcher {
    routes: Mutex<HashMap<Url, (u16, &'static str)>>,
    offline: AtomicBool,
    fail_next: AtomicUsize,
    calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedFetcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn respond(&self, url: &Url, status: u16, body: &'static str) {
        self.routes.lock().unwrap().insert(url.clone(), (status, body));
    }

    pub(crate) fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub(crate) fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline(request.url.to_string()));
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(NetError::Offline(request.url.to_string()));
        }

        let route = self.routes.lock().unwrap().get(&request.url).copied();
        match route {
            Some((status, body)) => Ok(Response::new(request.url.clone(), status, body)),
            None => Err(NetError::RequestFailed(format!("no route to {}", request.url))),
        }
    }
}
