mod common;

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
};
use common::{Harness, config_for};
use http_body_util::BodyExt;
use hoard::{
    application::engine::BasicEngine,
    infra::{
        http::{ProxyState, build_router},
        store::{Batch, Store},
    },
};
use serde_json::Value;
use tower::ServiceExt;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

struct Reply {
    status: StatusCode,
    x_cache: Option<String>,
    via: Option<String>,
    request_id: Option<String>,
    body: bytes::Bytes,
}

fn router(harness: &Harness) -> Router {
    build_router(ProxyState {
        orchestrator: Arc::clone(&harness.orchestrator),
        engine: Arc::new(BasicEngine),
        local_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
        max_request_body_bytes: 1024,
    })
}

async fn send(router: &Router, method: Method, uri: &str) -> Reply {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("host", "example.com")
        .body(Body::empty())
        .expect("request");
    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let (x_cache, via, request_id) = (header("x-cache"), header("via"), header("x-request-id"));
    let body = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    Reply {
        status,
        x_cache,
        via,
        request_id,
        body,
    }
}

async fn origin() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cache-control", "max-age=300")
                .set_body_string("cached page"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/private"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cache-control", "private")
                .set_body_string("for you only"),
        )
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn second_request_is_served_from_cache() {
    let server = origin().await;
    let harness = Harness::new(config_for(*server.address()));
    let router = router(&harness);

    let first = send(&router, Method::GET, "/page").await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.x_cache.as_deref(), Some("MISS from hoard"));
    assert_eq!(&first.body[..], b"cached page");
    assert!(first.request_id.is_some());

    let second = send(&router, Method::GET, "/page").await;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.x_cache.as_deref(), Some("HIT from hoard"));
    assert_eq!(second.body, first.body);
    assert!(second.via.expect("via").starts_with("1.1 hoard (hoard/"));

    let received = server.received_requests().await.expect("recording");
    assert_eq!(received.len(), 1);
}

#[tokio::test]
async fn unreadable_metadata_is_a_server_error() {
    let server = origin().await;
    let harness = Harness::new(config_for(*server.address()));
    let router = router(&harness);
    assert_eq!(send(&router, Method::GET, "/page").await.status, StatusCode::OK);

    let main = harness
        .store
        .keys()
        .into_iter()
        .find(|key| key.ends_with("::main"))
        .expect("main key");
    let mut batch = Batch::new();
    batch
        .del([main.as_str()])
        .rpush(&main, bytes::Bytes::from_static(b"not a hash"));
    harness.store.execute(batch).await.expect("execute");

    let reply = send(&router, Method::GET, "/page").await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(server.received_requests().await.expect("recording").len(), 1);
}

#[tokio::test]
async fn purge_removes_the_entry() {
    let server = origin().await;
    let harness = Harness::new(config_for(*server.address()));
    let router = router(&harness);

    send(&router, Method::GET, "/page").await;
    let purge = Method::from_bytes(b"PURGE").expect("method");

    let purged = send(&router, purge.clone(), "/page").await;
    assert_eq!(purged.status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&purged.body).expect("json");
    assert_eq!(json["purge_mode"], "delete");
    assert_eq!(json["result"], "purged");
    assert!(purged.x_cache.is_none());

    let again = send(&router, purge, "/page").await;
    assert_eq!(again.status, StatusCode::NOT_FOUND);

    let refetched = send(&router, Method::GET, "/page").await;
    assert_eq!(refetched.x_cache.as_deref(), Some("MISS from hoard"));
    assert_eq!(server.received_requests().await.expect("recording").len(), 2);
}

#[tokio::test]
async fn private_responses_are_relayed_without_storing() {
    let server = origin().await;
    let harness = Harness::new(config_for(*server.address()));
    let router = router(&harness);

    let first = send(&router, Method::GET, "/private").await;
    assert_eq!(&first.body[..], b"for you only");
    assert!(first.x_cache.is_none());

    send(&router, Method::GET, "/private").await;
    assert_eq!(server.received_requests().await.expect("recording").len(), 2);
    assert!(harness.store.keys().is_empty());
}

#[tokio::test]
async fn unknown_path_falls_through_with_origin_status() {
    let server = origin().await;
    let harness = Harness::new(config_for(*server.address()));
    let router = router(&harness);

    let reply = send(&router, Method::GET, "/missing").await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}
