//! End-to-end write-pipeline behavior against an in-memory cache and a fake
//! upstream: optimistic creates, id reconciliation, rollback, ordering.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::FakeUpstream;
use traffic_sync::cache::keys::entity_key;
use traffic_sync::cache::CacheStore;
use traffic_sync::domain::EntityKind;
use traffic_sync::metrics::MetricsRegistry;
use traffic_sync::sync::{SyncEvent, SyncEvents, SyncQueue, SyncWorker};
use traffic_sync::upstream::client::UpstreamApi;
use traffic_sync::upstream::UpstreamError;

struct Pipeline {
    cache: Arc<CacheStore>,
    queue: Arc<SyncQueue>,
    upstream: Arc<FakeUpstream>,
    metrics: Arc<MetricsRegistry>,
    worker: tokio::task::JoinHandle<()>,
}

fn pipeline() -> Pipeline {
    let cache = Arc::new(CacheStore::memory());
    let events = Arc::new(SyncEvents::new());
    let metrics = Arc::new(MetricsRegistry::new());
    let upstream = FakeUpstream::new();
    let queue = Arc::new(SyncQueue::new(
        Arc::clone(&cache),
        events,
        Arc::clone(&metrics),
    ));
    let worker = SyncWorker::new(
        Arc::clone(&queue),
        Arc::clone(&upstream) as Arc<dyn UpstreamApi>,
        Arc::clone(&cache),
        Arc::clone(&metrics),
    )
    .spawn();
    Pipeline {
        cache,
        queue,
        upstream,
        metrics,
        worker,
    }
}

impl Pipeline {
    async fn shutdown(self) {
        self.queue.stop();
        self.worker.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn async_create_happy_path() {
    let pipeline = pipeline();
    let mut events = pipeline.queue.events().subscribe();

    // The caller gets a synthetic id and an optimistic record immediately.
    let temp_id = pipeline
        .queue
        .enqueue_create(
            EntityKind::Task,
            json!({
                "title": "A",
                "workPeriod": { "startDate": "2025-01-10T00:00:00Z", "endDate": "2025-01-11T00:00:00Z" },
                "assignedMembers": ["m1"],
            }),
        )
        .await
        .unwrap();
    assert!(temp_id.starts_with("temp_"));

    let optimistic = pipeline
        .cache
        .get(&entity_key(EntityKind::Task, &temp_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(optimistic["_temporary"], json!(true));
    assert_eq!(optimistic["_pendingSync"], json!(true));

    // The worker confirms within the deadline and reconciles the id.
    let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
        .await
        .expect("create should confirm within 5s")
        .unwrap();
    let (temp, real) = match event {
        SyncEvent::Created {
            temp_id, real_id, ..
        } => (temp_id, real_id),
        other => panic!("unexpected event {:?}", other),
    };
    assert_eq!(temp, temp_id);
    assert_ne!(real, temp_id);

    assert!(pipeline
        .cache
        .get(&entity_key(EntityKind::Task, &temp_id))
        .await
        .unwrap()
        .is_none());
    let confirmed = pipeline
        .cache
        .get(&entity_key(EntityKind::Task, &real))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(confirmed["title"], "A");
    assert_eq!(confirmed["assignedMembers"], json!(["m1"]));

    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn burst_of_creates_completes_each_exactly_once() {
    let pipeline = pipeline();
    let mut events = pipeline.queue.events().subscribe();

    for i in 0..30 {
        pipeline
            .queue
            .enqueue_create(EntityKind::Task, json!({ "title": format!("task {}", i) }))
            .await
            .unwrap();
    }

    let mut created = 0;
    while created < 30 {
        match tokio::time::timeout(std::time::Duration::from_secs(30), events.recv())
            .await
            .expect("burst should drain")
            .unwrap()
        {
            SyncEvent::Created { .. } => created += 1,
            SyncEvent::ItemFailed { error, .. } => panic!("unexpected failure: {}", error),
            _ => {}
        }
    }

    // Exactly one upstream call per intent, no retries.
    assert_eq!(
        pipeline
            .upstream
            .create_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        30
    );
    let stats = pipeline.metrics.queue.snapshot();
    assert_eq!(stats.processed, 30);
    assert_eq!(stats.retries, 0);
    assert!(pipeline.queue.is_empty());

    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn updates_to_one_id_apply_in_order() {
    let pipeline = pipeline();
    pipeline.upstream.seed_task(common::blank_task("T", "v0"));
    let mut events = pipeline.queue.events().subscribe();

    for i in 1..=5 {
        pipeline
            .queue
            .enqueue_update(EntityKind::Task, "T", json!({ "title": format!("v{}", i) }))
            .await
            .unwrap();
    }

    let mut updated = 0;
    while updated < 5 {
        if let SyncEvent::Updated { .. } =
            tokio::time::timeout(std::time::Duration::from_secs(10), events.recv())
                .await
                .unwrap()
                .unwrap()
        {
            updated += 1;
        }
    }

    // Final state reflects every patch applied in enqueue order.
    assert_eq!(pipeline.upstream.tasks.lock().get("T").unwrap().title, "v5");
    let cached = pipeline.cache.get("task:T").await.unwrap().unwrap();
    assert_eq!(cached["title"], "v5");
    assert!(cached.get("_pendingSync").is_none());

    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn terminal_update_failure_flags_and_preserves_overlay() {
    let pipeline = pipeline();
    pipeline
        .upstream
        .always_fail(|| UpstreamError::Upstream5xx {
            status: 500,
            message: "upstream broken".into(),
        });
    let mut events = pipeline.queue.events().subscribe();

    pipeline
        .queue
        .enqueue_update(EntityKind::Task, "T2", json!({ "title": "X" }))
        .await
        .unwrap();

    // Three attempts (1s + 2s backoff) then terminal failure.
    let failed = tokio::time::timeout(std::time::Duration::from_secs(15), async {
        loop {
            if let SyncEvent::ItemFailed { entity_id, .. } = events.recv().await.unwrap() {
                break entity_id;
            }
        }
    })
    .await
    .expect("failure should surface");
    assert_eq!(failed, "T2");

    let cached = pipeline.cache.get("task:T2").await.unwrap().unwrap();
    assert_eq!(cached["_syncError"], json!(true));
    assert!(cached["_syncErrorMsg"].as_str().unwrap().contains("500"));
    assert_eq!(cached["title"], "X");

    let stats = pipeline.metrics.queue.snapshot();
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.failed, 1);

    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_after_transient_failures() {
    let pipeline = pipeline();
    pipeline
        .upstream
        .always_fail(|| UpstreamError::RateLimited("burst".into()));
    let mut events = pipeline.queue.events().subscribe();

    pipeline
        .queue
        .enqueue_create(EntityKind::Task, json!({ "title": "flaky" }))
        .await
        .unwrap();

    // Heal the upstream before the retry budget runs out.
    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
    pipeline.upstream.heal();

    let event = tokio::time::timeout(std::time::Duration::from_secs(10), events.recv())
        .await
        .expect("create should eventually confirm")
        .unwrap();
    assert!(matches!(event, SyncEvent::Created { .. }));
    assert!(pipeline.metrics.queue.snapshot().retries >= 1);

    pipeline.shutdown().await;
}
