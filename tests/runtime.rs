//! Worker and page runtime wired together

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use progload::cache::{CacheError, CacheStorage, DiskStorage, WorkerConfig};
use progload::domain::{
    Codec, ErrorKind, PerformanceSignal, ResourceRequest, ResponseSource, Variant,
};
use progload::page::{
    CapabilityFlags, DeferredElement, ElementMeta, ElementState, PageConfig, VisibilityEvent,
    VisibilityTrigger,
};
use progload::{Runtime, RuntimeBuilder};

use common::{init_tracing, FixedCodecs, FixedViewport, Img, ScriptedNetwork, VIEWPORT};

fn webp_only() -> Arc<FixedCodecs> {
    Arc::new(FixedCodecs(CapabilityFlags {
        avif: false,
        webp: true,
    }))
}

async fn runtime(network: Arc<ScriptedNetwork>, worker: WorkerConfig) -> Runtime {
    init_tracing();
    RuntimeBuilder::new()
        .worker_config(worker)
        .fetcher(network)
        .codec_probe(webp_only())
        .build()
        .await
        .unwrap()
}

fn seen(img: &Arc<Img>, id: progload::page::ElementId) -> VisibilityEvent {
    VisibilityEvent {
        id,
        rect: img.bounding_rect(),
        viewport: VIEWPORT,
    }
}

#[tokio::test]
async fn precaches_then_loads_visible_elements_through_worker() {
    let network = ScriptedNetwork::new();
    network.answer(
        "/css/app.css",
        progload::cache::NetworkResponse::new(200, b"body{}".to_vec())
            .with_header("content-type", "text/css"),
    );
    network.image("/img/hero.webp", b"webp bytes");

    let mut worker = WorkerConfig::default();
    worker.precache.assets = vec!["/css/app.css".to_string()];
    let runtime = runtime(network.clone(), worker).await;

    let report = runtime.start().await.unwrap();
    assert_eq!(report.namespace, "static-v1");
    assert_eq!(report.precached, vec!["GET /css/app.css".to_string()]);

    let hero = Img::lazy("/img/hero.jpg", 0.0);
    let below = Img::lazy("/img/below.jpg", 4000.0);
    let mut scheduler = runtime.scheduler();
    let hero_node: Arc<dyn DeferredElement> = hero.clone();
    let below_node: Arc<dyn DeferredElement> = below.clone();
    let hero_id = scheduler
        .observe(
            &hero_node,
            ElementMeta::critical(),
            vec![
                Variant::new(Codec::Avif, "/img/hero.avif"),
                Variant::new(Codec::WebP, "/img/hero.webp"),
                Variant::new(Codec::Jpeg, "/img/hero.jpg"),
            ],
        )
        .unwrap();
    let below_id = scheduler
        .observe(&below_node, ElementMeta::default(), Vec::new())
        .unwrap();

    let events = futures::stream::iter(vec![seen(&hero, hero_id), seen(&below, below_id)]).boxed();
    scheduler.run(VisibilityTrigger::Observer(events)).await;

    assert_eq!(scheduler.state(hero_id), Some(ElementState::Loaded));
    assert_eq!(scheduler.state(below_id), Some(ElementState::Pending));
    assert_eq!(hero.attr("src").as_deref(), Some("/img/hero.webp"));
    assert_eq!(hero.attr("fetchpriority").as_deref(), Some("high"));
    assert_eq!(below.attr("fetchpriority").as_deref(), Some("low"));
    assert_eq!(hero.committed().len(), 1);

    // The precached stylesheet and the hero are both served from cache now
    let css = runtime
        .worker()
        .fetch(ResourceRequest::get("/css/app.css").unwrap())
        .await
        .unwrap();
    assert_eq!(css.source, ResponseSource::Cache);
    let again = runtime
        .worker()
        .fetch(ResourceRequest::get("/img/hero.webp").unwrap())
        .await
        .unwrap();
    assert_eq!(again.source, ResponseSource::Cache);
    assert_eq!(network.requested(), vec!["/css/app.css", "/img/hero.webp"]);

    runtime.teardown().await.unwrap();
}

#[tokio::test]
async fn fetches_before_start_are_not_cached() {
    let network = ScriptedNetwork::new();
    network.image("/img/a.jpg", b"a");
    let runtime = runtime(network.clone(), WorkerConfig::default()).await;

    let request = ResourceRequest::get("/img/a.jpg").unwrap();
    let first = runtime.worker().fetch(request.clone()).await.unwrap();
    assert_eq!(first.source, ResponseSource::Passthrough);

    runtime.start().await.unwrap();
    let second = runtime.worker().fetch(request).await.unwrap();
    assert_eq!(second.source, ResponseSource::Network);
    assert_eq!(network.calls(), 2);

    runtime.teardown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn offline_images_end_in_error_with_fallback() {
    let network = ScriptedNetwork::new();
    network.set_offline(true);
    let runtime = runtime(network.clone(), WorkerConfig::default()).await;
    runtime.start().await.unwrap();

    let img = Img::lazy("/img/gone.jpg", 0.0);
    let mut scheduler = runtime.scheduler();
    let node: Arc<dyn DeferredElement> = img.clone();
    let id = scheduler
        .observe(&node, ElementMeta::default(), Vec::new())
        .unwrap();

    let events = futures::stream::iter(vec![seen(&img, id)]).boxed();
    scheduler.run(VisibilityTrigger::Observer(events)).await;

    assert_eq!(scheduler.state(id), Some(ElementState::Error));
    assert_eq!(img.attr("src").as_deref(), Some("/images/fallback.svg"));
    // First attempt plus three retries, each missing the cache
    assert_eq!(network.calls(), 4);

    let snapshot = runtime.teardown().await.unwrap();
    assert!(snapshot.error_count(ErrorKind::Network) >= 1);
}

#[tokio::test]
async fn polling_fallback_is_reported() {
    let network = ScriptedNetwork::new();
    network.image("/img/a.jpg", b"a");
    let runtime = runtime(network, WorkerConfig::default()).await;
    runtime.start().await.unwrap();

    let img = Img::lazy("/img/a.jpg", 100.0);
    let mut scheduler = runtime.scheduler();
    let node: Arc<dyn DeferredElement> = img.clone();
    let id = scheduler
        .observe(&node, ElementMeta::default(), Vec::new())
        .unwrap();

    let trigger = runtime.visibility_trigger(None, Arc::new(FixedViewport));
    assert!(trigger.is_polling());
    scheduler.run(trigger).await;
    assert_eq!(scheduler.state(id), Some(ElementState::Loaded));

    let snapshot = runtime.teardown().await.unwrap();
    assert_eq!(snapshot.error_count(ErrorKind::UnsupportedFeature), 1);
}

#[tokio::test]
async fn long_tasks_shrink_the_scheduler_margin() {
    let runtime = runtime(ScriptedNetwork::new(), WorkerConfig::default()).await;
    let scheduler = runtime.scheduler();
    assert_eq!(scheduler.root_margin(), 200.0);

    let reporter = runtime.reporter();
    for _ in 0..3 {
        reporter.report(PerformanceSignal::LongTask { duration_ms: 90.0 });
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while scheduler.root_margin() != 100.0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(runtime.root_margin(), 100.0);
    assert_eq!(runtime.snapshot().long_tasks, 3);

    runtime.teardown().await.unwrap();
}

#[tokio::test]
async fn teardown_clears_persisted_namespaces() {
    let dir = tempfile::tempdir().unwrap();
    let network = ScriptedNetwork::new();
    network.image("/img/a.jpg", b"a");
    let worker_config = WorkerConfig {
        storage_root: Some(dir.path().to_path_buf()),
        ..WorkerConfig::default()
    };
    let runtime = runtime(network, worker_config).await;
    runtime.start().await.unwrap();

    runtime
        .worker()
        .fetch(ResourceRequest::get("/img/a.jpg").unwrap())
        .await
        .unwrap();
    let images = DiskStorage::new(dir.path().join("images-v1"));
    assert_eq!(images.len().await.unwrap(), 1);

    let worker = runtime.worker().clone();
    runtime.teardown().await.unwrap();

    assert_eq!(images.len().await.unwrap(), 0);
    assert!(!worker.is_running());
    assert!(matches!(
        worker.fetch(ResourceRequest::get("/img/a.jpg").unwrap()).await,
        Err(CacheError::WorkerGone)
    ));
}

#[tokio::test]
async fn builder_reads_yaml_files() {
    let dir = tempfile::tempdir().unwrap();
    let page_path = dir.path().join("page.yaml");
    std::fs::write(&page_path, "root_margin_px: 400\nmax_retries: 1\n").unwrap();

    let builder = RuntimeBuilder::from_files(&dir.path().join("missing.yaml"), &page_path).unwrap();
    let runtime = builder
        .fetcher(ScriptedNetwork::new())
        .codec_probe(webp_only())
        .build()
        .await
        .unwrap();
    assert_eq!(runtime.page_config().max_retries, 1);
    assert_eq!(runtime.root_margin(), 400.0);
    assert_eq!(runtime.page_config().fallback_src, PageConfig::default().fallback_src);
    runtime.teardown().await.unwrap();

    std::fs::write(&page_path, "root_margin: 400\n").unwrap();
    assert!(RuntimeBuilder::from_files(&dir.path().join("missing.yaml"), &page_path).is_err());
}
