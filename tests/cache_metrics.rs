mod common;

use std::collections::HashSet;

use common::{Harness, MAX_SIZE, config_for, context, drain, response};
use hoard::{
    application::orchestrator::{SaveOutcome, SaveResult},
    cache::CacheConfig,
};
use metrics_util::debugging::DebuggingRecorder;

const URL: &str = "http://example.com/metrics";

async fn store_body(harness: &Harness, body: &'static str) -> SaveResult {
    let mut ctx = context(URL);
    let mut res = response(&[body], 60);
    let SaveOutcome::Streaming(receipt) = harness
        .orchestrator
        .save(&mut ctx, &mut res)
        .await
        .expect("save should start")
    else {
        panic!("expected a streaming save");
    };
    drain(&mut res).await;
    receipt.wait().await.expect("save should report")
}

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let harness = Harness::new(CacheConfig::default());

    // Miss, then committed saves; the second one retires the first entity.
    let mut ctx = context(URL);
    assert!(harness.orchestrator.read(&mut ctx).await.expect("read").is_none());
    assert!(matches!(store_body(&harness, "first").await, SaveResult::Committed { .. }));
    let first = {
        let mut ctx = context(URL);
        let res = harness.orchestrator.read(&mut ctx).await.expect("read").expect("hit");
        res.entity_id.expect("entity")
    };
    assert!(matches!(store_body(&harness, "second").await, SaveResult::Committed { .. }));
    assert!(harness.jobs.get(&format!("collect:{first}")).is_some());

    // Eviction behind the metadata's back.
    let mut ctx = context(URL);
    let current = harness
        .orchestrator
        .read(&mut ctx)
        .await
        .expect("read")
        .expect("hit")
        .entity_id
        .expect("entity");
    harness.storage.delete(&current).await.expect("delete");
    let mut ctx = context(URL);
    assert!(harness.orchestrator.read(&mut ctx).await.expect("read").is_none());

    // Oversize by advertised length.
    let mut ctx = context(URL);
    let mut res = response(&["x"], 60);
    res.length = Some(MAX_SIZE + 1);
    let outcome = harness.orchestrator.save(&mut ctx, &mut res).await.expect("save");
    assert!(matches!(outcome, SaveOutcome::Skipped));

    // Unreachable origin.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let unreachable = Harness::new(config_for(addr));
    let mut ctx = context(URL);
    unreachable.orchestrator.fetch(&mut ctx).await;

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "hoard_cache_hit_total",
        "hoard_cache_miss_total",
        "hoard_cache_evicted_entity_total",
        "hoard_save_committed_total",
        "hoard_save_skipped_total",
        "hoard_entity_gc_scheduled_total",
        "hoard_jobs_enqueued_total",
        "hoard_upstream_error_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
