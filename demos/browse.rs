//! Expands a site tree the way a viewer would: every building asks for its scenes on its own, and the managers turn
//! the scattered reads into a handful of batch requests.
//!
//! Run with `RUST_LOG=rb_cache=debug cargo run --example browse --features test,tracing`.

use std::sync::Arc;
use std::time::Duration;

use rb_cache::prelude::*;
use rb_cache::test::MockTransport;
use rb_cache::test::RecordingObserver;
use serde_json::json;
use tokio::task::JoinSet;
use tracing::info;

const BUILDINGS: usize = 40;
const SCENES_PER_BUILDING: usize = 25;

fn setup_tracing() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

fn store() -> MockTransport {
    let buildings = (0..BUILDINGS).map(|b| {
        let scenes = (0..SCENES_PER_BUILDING).map(|s| format!("s-{b}-{s}")).collect::<Vec<_>>();
        (format!("b-{b}"), json!({ "site": "site-1", "scenes": scenes }))
    });
    let scenes = (0..BUILDINGS).flat_map(|b| {
        (0..SCENES_PER_BUILDING).map(move |s| (format!("s-{b}-{s}"), json!({ "building": format!("b-{b}") })))
    });

    MockTransport::new()
        .with_latency(Duration::from_millis(30))
        .with_entities(buildings)
        .with_entities(scenes)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    setup_tracing()?;

    let transport = Arc::new(store());
    let buildings = EntityManager::new(transport.clone(), ManagerConfig::new("/api/buildings"))?;
    let scenes = EntityManager::new(
        transport.clone(),
        ManagerConfig::new("/api/scenes")
            .with_bunch_size(200)
            .with_aggregation_window(Duration::from_millis(50)),
    )?;
    let observer = Arc::new(RecordingObserver::new());
    let as_dyn: Arc<dyn Observer> = observer.clone();
    scenes.set_observer(as_dyn);

    let mut expansions = JoinSet::new();
    for b in 0..BUILDINGS {
        let buildings = buildings.clone();
        let scenes = scenes.clone();
        expansions.spawn(async move {
            let Some(building) = buildings.read_one(format!("b-{b}")).await?
            else {
                return Ok(0);
            };
            let ids = building["scenes"]
                .as_array()
                .map(|ids| ids.iter().filter_map(|id| id.as_str().map(str::to_string)).collect::<Vec<_>>())
                .unwrap_or_default();
            Ok::<_, FetchError>(scenes.read_many(ids).await?.len())
        });
    }

    let mut loaded = 0;
    while let Some(result) = expansions.join_next().await {
        loaded += result??;
    }

    // The second pass is answered from the cache.
    let again = scenes.read_many((0..SCENES_PER_BUILDING).map(|s| format!("s-0-{s}"))).await?;

    let downloads = Coalescer::new(transport.clone(), CoalescerConfig::default())?;
    let (a, b) = tokio::join!(
        downloads.request(TransportRequest::new(Verb::Read, "/api/buildings/b-0")),
        downloads.request(TransportRequest::new(Verb::Read, "/api/buildings/b-0")),
    );
    assert_eq!(a?, b?);

    info!(
        scenes = loaded,
        cached = again.len(),
        requests = transport.request_count(),
        batches = transport.batches().len(),
        peak = transport.peak_concurrency(),
        "tree expanded"
    );
    println!(
        "{loaded} scenes of {BUILDINGS} buildings loaded with {} requests ({} batch reads, at most {} at once); {} \
         notices",
        transport.request_count(),
        transport.batches().len(),
        transport.peak_concurrency(),
        observer.debug_messages().len() + observer.warnings().len(),
    );

    Ok(())
}
