mod common;

use std::time::Duration;

use axum::http::{Method, StatusCode, header};
use common::{Harness, MAX_SIZE, RecordingSink, config_for, context, drain, wait_until};
use hoard::{
    application::{
        engine::cacheable_ttl,
        orchestrator::{SaveOutcome, SaveResult},
    },
    cache::{CacheConfig, EventBus},
    infra::upstream::UpstreamOptions,
    util::http_date,
};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header as header_eq, method, path},
};

fn origin_config(server: &MockServer) -> CacheConfig {
    config_for(*server.address())
}

#[tokio::test]
async fn fetched_response_is_saved_served_and_read_back() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/article"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cache-control", "max-age=60")
                .insert_header("x-origin", "yes")
                .set_body_string("fresh from origin"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new(origin_config(&server));
    let mut ctx = context("http://example.com/article");
    let mut res = harness.orchestrator.fetch(&mut ctx).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.length, Some(17));
    assert_eq!(res.uri.as_deref(), Some("http://example.com/article"));
    assert!(res.generated_ts.is_some());

    res.ttl = cacheable_ttl(&res).expect("cacheable");
    let SaveOutcome::Streaming(receipt) = harness
        .orchestrator
        .save(&mut ctx, &mut res)
        .await
        .expect("save")
    else {
        panic!("expected a streaming save");
    };
    ctx.response = Some(res);

    let mut sink = RecordingSink::default();
    harness.orchestrator.serve(&mut ctx, &mut sink).await;
    assert_eq!(&sink.body[..], b"fresh from origin");
    assert_eq!(sink.header("x-cache"), Some("MISS from hoard"));
    assert_eq!(sink.header("x-origin"), Some("yes"));
    assert_eq!(receipt.wait().await, Some(SaveResult::Committed { bytes: 17 }));

    let mut ctx = context("http://example.com/article");
    let mut cached = harness
        .orchestrator
        .read(&mut ctx)
        .await
        .expect("read")
        .expect("hit");
    assert_eq!(cached.header_str(&header::CACHE_CONTROL), Some("max-age=60"));
    assert_eq!(drain(&mut cached).await, "fresh from origin");
}

#[tokio::test]
async fn advertised_length_over_the_maximum_is_not_saved() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cache-control", "max-age=60")
                .set_body_bytes(vec![b'x'; MAX_SIZE as usize * 2]),
        )
        .mount(&server)
        .await;

    let harness = Harness::new(origin_config(&server));
    let mut ctx = context("http://example.com/big");
    let mut res = harness.orchestrator.fetch(&mut ctx).await;
    assert_eq!(res.length, Some(MAX_SIZE * 2));

    res.ttl = 60;
    let outcome = harness
        .orchestrator
        .save(&mut ctx, &mut res)
        .await
        .expect("save");
    assert!(matches!(outcome, SaveOutcome::Skipped));
    assert_eq!(drain(&mut res).await.len(), MAX_SIZE as usize * 2);
}

#[tokio::test]
async fn refused_connection_maps_to_service_unavailable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let harness = Harness::new(config_for(addr));
    let mut ctx = context("http://example.com/");
    let res = harness.orchestrator.fetch(&mut ctx).await;
    assert_eq!(res.status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(!res.has_body_reader());
}

#[tokio::test]
async fn unsupported_methods_are_not_implemented() {
    let harness = Harness::new(CacheConfig::default());
    let mut ctx = context("http://example.com/dav");
    ctx.request.method = Method::from_bytes(b"PROPFIND").expect("method");
    let res = harness.orchestrator.fetch(&mut ctx).await;
    assert_eq!(res.status, StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn slow_origin_maps_to_timeout_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let options = UpstreamOptions {
        send_timeout: Duration::from_millis(50),
        read_timeout: Duration::from_millis(100),
        ..UpstreamOptions::default()
    };
    let harness = Harness::with_events(origin_config(&server), EventBus::new(), options);
    let mut ctx = context("http://example.com/slow");
    let res = harness.orchestrator.fetch(&mut ctx).await;
    assert_eq!(res.status.as_u16(), 524);
}

#[tokio::test]
async fn hop_by_hop_headers_stay_on_the_origin_hop() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("proxy-authenticate", "Basic")
                .insert_header("x-origin", "kept")
                .set_body_string("ok"),
        )
        .mount(&server)
        .await;

    let harness = Harness::new(origin_config(&server));
    let mut ctx = context("http://example.com/");
    let res = harness.orchestrator.fetch(&mut ctx).await;
    assert!(res.headers.get("proxy-authenticate").is_none());
    assert!(res.headers.get(header::CONTENT_LENGTH).is_none());
    assert_eq!(res.header_str(&header::HeaderName::from_static("x-origin")), Some("kept"));
}

#[tokio::test]
async fn unparseable_date_is_replaced() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("date", "not a date")
                .set_body_string("ok"),
        )
        .mount(&server)
        .await;

    let harness = Harness::new(origin_config(&server));
    let mut ctx = context("http://example.com/");
    let res = harness.orchestrator.fetch(&mut ctx).await;
    let date = res.header_str(&header::DATE).expect("date");
    let parsed = http_date::parse(date).expect("synthesized date parses");
    assert_eq!(res.generated_ts, Some(parsed.unix_timestamp()));
}

#[tokio::test]
async fn markup_processing_advertises_capability_and_flags_chunks() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header_eq("surrogate-capability", "hoard=\"ESI/1.0\""))
        .respond_with(ResponseTemplate::new(200).set_body_string("<p><esi:include src=\"/x\"/></p>"))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new(CacheConfig {
        esi_enabled: true,
        ..origin_config(&server)
    });
    let mut ctx = context("http://example.com/esi");
    let mut res = harness.orchestrator.fetch(&mut ctx).await;
    assert_eq!(res.status, StatusCode::OK);

    let mut reader = res.take_body_reader().expect("body");
    let mut flagged = false;
    while let Some(chunk) = reader.next_chunk().await.expect("chunk") {
        flagged |= chunk.has_markup;
    }
    assert!(flagged);
}

#[tokio::test]
async fn saved_markup_is_flagged_on_the_cached_entry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cache-control", "max-age=60")
                .set_body_string("<p><esi:include src=\"/x\"/></p>"),
        )
        .mount(&server)
        .await;

    let harness = Harness::new(CacheConfig {
        esi_enabled: true,
        ..origin_config(&server)
    });
    let mut ctx = context("http://example.com/esi");
    let mut res = harness.orchestrator.fetch(&mut ctx).await;
    res.ttl = 60;
    let SaveOutcome::Streaming(receipt) = harness
        .orchestrator
        .save(&mut ctx, &mut res)
        .await
        .expect("save")
    else {
        panic!("expected a streaming save");
    };
    drain(&mut res).await;
    assert!(matches!(receipt.wait().await, Some(SaveResult::Committed { .. })));

    let mut ctx = context("http://example.com/esi");
    let cached = harness
        .orchestrator
        .read(&mut ctx)
        .await
        .expect("read")
        .expect("hit");
    assert!(cached.has_markup);
}

#[tokio::test]
async fn background_fetch_replays_the_request_against_this_node() {
    let node = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/later"))
        .and(header_eq("cache-control", "max-stale=0"))
        .and(header_eq("cookie", "session=1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("refreshed"))
        .expect(1)
        .mount(&node)
        .await;

    let harness = Harness::new(CacheConfig::default());
    let mut ctx = context(&format!("http://127.0.0.1:{}/later", node.address().port()));
    ctx.request
        .headers
        .insert(header::COOKIE, "session=1".parse().expect("value"));
    let job_id = harness
        .orchestrator
        .fetch_in_background(&mut ctx)
        .await
        .expect("job id");

    let _workers = harness.start_workers();
    wait_until(|| harness.jobs.get(&job_id).is_none()).await;
}

#[tokio::test]
async fn revalidation_without_stored_data_is_retried() {
    let harness = Harness::new(CacheConfig::default());
    let mut ctx = context("http://example.com/gone");
    let mut res = common::response(&["body"], 60);
    res.uri = Some("http://example.com/gone".into());
    let _ = harness.orchestrator.save(&mut ctx, &mut res).await.expect("save");
    drain(&mut res).await;

    let mut ctx = context("http://example.com/gone");
    let job_id = harness
        .orchestrator
        .revalidate_in_background(&mut ctx, false)
        .await
        .expect("job id");
    assert!(harness.orchestrator.delete(&mut ctx).await.expect("delete"));

    let workers = harness.start_workers();
    wait_until(|| {
        harness
            .jobs
            .get(&job_id)
            .is_some_and(|job| job.last_error.is_some())
    })
    .await;
    drop(workers);
    let job = harness.jobs.get(&job_id).expect("job kept for retry");
    assert!(
        job.last_error
            .as_deref()
            .is_some_and(|error| error.contains("presumed evicted"))
    );
}
