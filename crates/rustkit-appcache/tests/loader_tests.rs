//! Updates over real HTTP against a local mock server.

use std::sync::Arc;

use rustkit_appcache::{
    AppCacheService, FailureReason, MemoryStorage, UpdateConfig, UpdateOutcome,
};
use rustkit_net::{LoaderConfig, ResourceLoader};
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount(server: &MockServer, p: &str, template: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path(p))
        .respond_with(template)
        .mount(server)
        .await;
}

fn service() -> AppCacheService {
    let loader = ResourceLoader::new(LoaderConfig::default()).unwrap();
    AppCacheService::new(
        Arc::new(MemoryStorage::new()),
        Arc::new(loader),
        UpdateConfig::default(),
    )
}

#[tokio::test]
async fn test_install_over_http() {
    let server = MockServer::start().await;
    mount(
        &server,
        "/app.manifest",
        ResponseTemplate::new(200).set_body_raw(
            "CACHE MANIFEST\nscript.js\n\nFALLBACK:\n/ offline.html\n",
            "text/cache-manifest",
        ),
    )
    .await;
    mount(&server, "/script.js", ResponseTemplate::new(200).set_body_string("js")).await;
    mount(
        &server,
        "/offline.html",
        ResponseTemplate::new(200).set_body_string("offline"),
    )
    .await;

    let service = service();
    let (host, _rx) = service.register_host().await;
    let manifest_url = Url::parse(&format!("{}/app.manifest", server.uri())).unwrap();

    let handle = service.start_update(host, &manifest_url, None).await.unwrap();
    assert_eq!(handle.wait().await, UpdateOutcome::Cached);

    let cache = service.newest_cache(&manifest_url).await.unwrap().unwrap();
    assert_eq!(cache.entry_count(), 2);
    let page = manifest_url.join("/missing/page.html").unwrap();
    let fallback = cache.find_fallback(&page).unwrap();
    assert_eq!(
        fallback.target_url.as_ref().map(|u| u.path()),
        Some("/offline.html")
    );
}

#[tokio::test]
async fn test_redirect_is_not_followed() {
    let server = MockServer::start().await;
    mount(
        &server,
        "/app.manifest",
        ResponseTemplate::new(200).set_body_string("CACHE MANIFEST\n/moved.js\n"),
    )
    .await;
    mount(
        &server,
        "/moved.js",
        ResponseTemplate::new(301).insert_header("location", "/script.js"),
    )
    .await;

    let service = service();
    let (host, _rx) = service.register_host().await;
    let manifest_url = Url::parse(&format!("{}/app.manifest", server.uri())).unwrap();

    let handle = service.start_update(host, &manifest_url, None).await.unwrap();
    match handle.wait().await {
        UpdateOutcome::Failed(failure) => {
            assert_eq!(failure.reason, FailureReason::Resource);
            assert!(failure.message.contains("not allowed"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
}
