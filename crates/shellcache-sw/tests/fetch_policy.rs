//! Request routing once the app shell is installed.

mod common;

use std::sync::Arc;

use common::*;
use shellcache_net::{Method, Request, RequestKey, Response, ResponseType};
use shellcache_sw::{
    CacheController, CacheStorage, MemoryCacheStorage, ResponseSource, ServiceWorkerError,
    ServiceWorkerRuntime,
};
use url::Url;

async fn installed(
    network: &Arc<ScriptedNetwork>,
) -> (Arc<CacheController>, Arc<MemoryCacheStorage>) {
    let storage = Arc::new(MemoryCacheStorage::new());
    let controller = controller(app_config("v11"), storage.clone(), network.clone());
    let report = controller.install().await;
    assert!(report.is_complete(), "install failed: {:?}", report.failed);
    (controller, storage)
}

#[tokio::test]
async fn offline_icon_served_from_cache() {
    init_logging();
    let network = ScriptedNetwork::serving_app_shell(&app_config("v11"));
    let (controller, _storage) = installed(&network).await;
    network.set_offline(true);

    let answer = controller
        .handle_fetch(&Request::get(url("./icon.svg")))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(answer.source, ResponseSource::Cache);
    assert_eq!(answer.response.status, 200);
}

#[tokio::test]
async fn offline_navigation_falls_back_to_cached_shell() {
    init_logging();
    let network = ScriptedNetwork::serving_app_shell(&app_config("v11"));
    let (controller, _storage) = installed(&network).await;
    network.set_offline(true);

    let answer = controller
        .handle_fetch(&Request::navigate(url("index.html")))
        .await
        .unwrap()
        .unwrap();

    assert!(answer.is_from_cache());
    assert_eq!(
        answer.response.text().unwrap(),
        format!("body of {}", url("index.html"))
    );
}

#[tokio::test]
async fn online_navigation_bypasses_cache() {
    init_logging();
    let config = app_config("v11");
    let network = ScriptedNetwork::serving_app_shell(&config);
    let storage = FlakyStorage::new();
    let controller = controller(config, storage.clone(), network.clone());
    assert!(controller.install().await.is_complete());
    network.respond(&url(""), 200, b"new shell");
    let lookups_before = storage.lookups();

    let answer = controller
        .handle_fetch(&Request::navigate(url("")))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(answer.source, ResponseSource::Network);
    assert_eq!(&answer.response.body[..], b"new shell");
    assert_eq!(storage.lookups(), lookups_before);
}

#[tokio::test]
async fn post_requests_always_reach_network() {
    init_logging();
    let network = ScriptedNetwork::serving_app_shell(&app_config("v11"));
    let (controller, storage) = installed(&network).await;
    let api = url("api/solve");
    let entries_before = storage.len_of(controller.cache_name()).await;
    let post = || Request::get(api.clone()).method(Method::POST);

    network.respond(&api, 200, b"answer to first question");
    let first = controller.handle_fetch(&post()).await.unwrap().unwrap();
    controller.wait_for_background_writes().await;
    network.respond(&api, 200, b"answer to second question");
    let second = controller.handle_fetch(&post()).await.unwrap().unwrap();
    controller.wait_for_background_writes().await;

    assert_eq!(&first.response.body[..], b"answer to first question");
    assert_eq!(&second.response.body[..], b"answer to second question");
    assert!(!second.is_from_cache());
    assert_eq!(network.calls_to(&api), 2);
    assert_eq!(storage.len_of(controller.cache_name()).await, entries_before);
}

#[tokio::test]
async fn offline_navigation_to_unknown_page_fails() {
    init_logging();
    let network = ScriptedNetwork::serving_app_shell(&app_config("v11"));
    let (controller, _storage) = installed(&network).await;
    network.set_offline(true);

    let result = controller
        .handle_fetch(&Request::navigate(url("history")))
        .await;

    assert!(matches!(result, Err(ServiceWorkerError::NetworkError(_))));
}

#[tokio::test]
async fn third_party_script_cached_after_first_load() {
    init_logging();
    let network = ScriptedNetwork::serving_app_shell(&app_config("v11"));
    let (controller, storage) = installed(&network).await;
    let script = Url::parse("https://cdn.example.net/chart.js").unwrap();
    network.respond(&script, 200, b"chart");

    let first = controller
        .handle_fetch(&Request::get(script.clone()))
        .await
        .unwrap()
        .unwrap();
    controller.wait_for_background_writes().await;
    let second = controller
        .handle_fetch(&Request::get(script.clone()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(first.source, ResponseSource::Network);
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(network.calls_to(&script), 1);
    assert!(storage
        .match_in(controller.cache_name(), &RequestKey::get(&script))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn error_statuses_are_not_cached() {
    init_logging();
    let network = ScriptedNetwork::serving_app_shell(&app_config("v11"));
    let (controller, storage) = installed(&network).await;
    let before = storage.len_of(controller.cache_name()).await;

    for (path, status) in [("missing.png", 404), ("api/fail", 500), ("moved", 301)] {
        let target = url(path);
        network.respond(&target, status, b"");
        let answer = controller
            .handle_fetch(&Request::get(target))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer.response.status, status);
    }
    controller.wait_for_background_writes().await;

    assert_eq!(storage.len_of(controller.cache_name()).await, before);
}

#[test]
fn opaque_and_error_responses_are_not_cacheable() {
    let font = Url::parse("https://fonts.gstatic.com/s/tajawal/v9/a.woff2").unwrap();

    assert!(!Response::opaque(font.clone()).is_cacheable());
    assert!(!Response::error(font.clone()).is_cacheable());
    assert!(Response::new(font, 200, "woff")
        .with_type(ResponseType::Cors)
        .is_cacheable());
}

#[tokio::test]
async fn fragment_does_not_change_cache_key() {
    init_logging();
    let network = ScriptedNetwork::serving_app_shell(&app_config("v11"));
    let (controller, _storage) = installed(&network).await;
    network.set_offline(true);

    let answer = controller
        .handle_fetch(&Request::get(url("icon.svg#badge")))
        .await
        .unwrap();

    assert!(answer.is_some_and(|a| a.is_from_cache()));
}

#[tokio::test]
async fn uncontrolled_page_goes_to_network() {
    init_logging();
    let config = app_config("v11");
    let network = ScriptedNetwork::serving_app_shell(&config);
    let storage = Arc::new(MemoryCacheStorage::new());
    let (runtime, _events) = ServiceWorkerRuntime::new(scope(), network.clone());
    runtime
        .register(controller(config, storage, network.clone()))
        .await
        .unwrap();
    let outside = runtime
        .open_client(Url::parse("https://other.example/").unwrap())
        .await;
    let before = network.calls_to(&url("icon.svg"));

    let answer = runtime
        .fetch(Some(outside), Request::get(url("icon.svg")))
        .await
        .unwrap()
        .unwrap();

    assert!(!answer.is_from_cache());
    assert_eq!(network.calls_to(&url("icon.svg")), before + 1);
}
