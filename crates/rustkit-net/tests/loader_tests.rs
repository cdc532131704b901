//! ResourceLoader tests against a local mock server.

use http::{header, HeaderValue, StatusCode};
use rustkit_net::{LoaderConfig, RedirectPolicy, Request, ResourceLoader};
use url::Url;
use wiremock::matchers::{header as match_header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn loader(redirect: RedirectPolicy) -> ResourceLoader {
    ResourceLoader::new(LoaderConfig {
        redirect,
        ..Default::default()
    })
    .unwrap()
}

fn at(server: &MockServer, p: &str) -> Url {
    Url::parse(&format!("{}{}", server.uri(), p)).unwrap()
}

#[tokio::test]
async fn test_body_is_streamed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/app.manifest"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("CACHE MANIFEST\n/a.js\n", "text/cache-manifest"),
        )
        .mount(&server)
        .await;

    let response = loader(RedirectPolicy::None)
        .fetch(Request::get(at(&server, "/app.manifest")))
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(
        response.content_type.as_ref().map(|m| m.essence_str().to_string()),
        Some("text/cache-manifest".to_string())
    );
    let body = response.bytes().await.unwrap();
    assert_eq!(&body[..], b"CACHE MANIFEST\n/a.js\n");
}

#[tokio::test]
async fn test_conditional_headers_are_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.js"))
        .and(match_header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;

    let request = Request::get(at(&server, "/a.js"))
        .header(header::IF_NONE_MATCH, HeaderValue::from_static("\"v1\""));
    let response = loader(RedirectPolicy::None).fetch(request).await.unwrap();

    assert_eq!(response.status, StatusCode::NOT_MODIFIED);
    assert!(!response.is_redirect());
}

#[tokio::test]
async fn test_redirect_surfaced_without_policy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old.js"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/new.js"))
        .mount(&server)
        .await;

    let response = loader(RedirectPolicy::None)
        .fetch(Request::get(at(&server, "/old.js")))
        .await
        .unwrap();

    assert!(response.is_redirect());
    assert_eq!(response.location(), Some(at(&server, "/new.js")));
}

#[tokio::test]
async fn test_same_origin_redirect_followed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old.js"))
        .respond_with(ResponseTemplate::new(301).insert_header("location", "/new.js"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new.js"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let response = loader(RedirectPolicy::SameOrigin)
        .fetch(Request::get(at(&server, "/old.js")))
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.url, at(&server, "/new.js"));
}

#[tokio::test]
async fn test_cross_origin_redirect_stops() {
    let server = MockServer::start().await;
    let port = server.address().port();
    Mock::given(method("GET"))
        .and(path("/old.js"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("location", format!("http://localhost:{}/new.js", port).as_str()),
        )
        .mount(&server)
        .await;

    let response = loader(RedirectPolicy::SameOrigin)
        .fetch(Request::get(at(&server, "/old.js")))
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::FOUND);
    assert!(response.is_redirect());
}
