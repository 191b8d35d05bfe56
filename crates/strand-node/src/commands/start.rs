//! Run command - starts a development node.
//!
//! The node hosts every stream in its store. The registry lives in memory and
//! is seeded from storage at startup, and a local timer stands in for chain
//! blocks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use strand_config::StrandConfig;
use strand_events::{
    InMemoryRegistry, MiniblockInfo, StreamCache, StreamParams, StreamRecord,
};
use strand_storage::{StreamStorage, Superseded};
use strand_types::Address;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub async fn run(config: StrandConfig) -> Result<()> {
    let local_node = config.node_address()?;
    info!(
        project = %config.project.name,
        node = %local_node,
        data_dir = %config.storage.data_dir.display(),
        "starting strand node"
    );

    let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<Superseded>();
    let storage: Arc<dyn StreamStorage> = Arc::new(super::open_store(&config, Some(exit_tx)).await?);

    let registry = Arc::new(InMemoryRegistry::new());
    let seeded = seed_registry(storage.as_ref(), &registry, local_node).await?;
    info!(streams = seeded, "registry seeded from storage");

    let entitlements = config
        .entitlements
        .backend
        .build(config.entitlements.paused, config.denied_writers()?);
    let params = StreamParams {
        storage: Arc::clone(&storage),
        config: config.stream_config(),
        entitlements,
        local_node,
    };
    let cache = StreamCache::new(params, registry.clone(), config.cache_config())
        .context("Failed to create stream cache")?;

    let cancel = CancellationToken::new();
    let (tick_tx, tick_rx) = mpsc::unbounded_channel();
    let mut tasks = cache
        .start(0, tick_rx, cancel.clone())
        .await
        .context("Failed to start stream cache")?;
    match config.dev_tick_interval() {
        Some(interval) => tasks.push(spawn_dev_ticks(
            interval,
            Arc::clone(&registry),
            tick_tx,
            cancel.clone(),
        )),
        None => warn!("development tick source disabled; no blocks will be produced"),
    }

    println!();
    println!("Strand node is running. Press Ctrl+C to stop.");
    println!();

    let superseded = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            info!("shutdown requested");
            false
        }
        Some(notice) = exit_rx.recv() => {
            error!(%notice, "store taken over by another process, shutting down");
            true
        }
    };

    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }
    cache.wait_idle().await;
    cache.force_flush_all().await;
    if let Ok(metrics) = cache.metrics().render() {
        debug!(%metrics, "final cache metrics");
    }

    // A superseded store belongs to the new owner.
    if !superseded {
        storage
            .cleanup_storage()
            .await
            .context("Failed to release stream store")?;
    }
    storage.close().await;

    println!("Strand node stopped.");
    Ok(())
}

/// Registers every stored stream with this node as its only host.
async fn seed_registry(
    storage: &dyn StreamStorage,
    registry: &InMemoryRegistry,
    local_node: Address,
) -> Result<usize> {
    let streams = storage.get_streams().await.context("Failed to list streams")?;
    for stream_id in &streams {
        let genesis = storage
            .read_miniblocks(stream_id, 0, 1)
            .await
            .with_context(|| format!("Failed to read genesis of {stream_id}"))?
            .into_iter()
            .next()
            .with_context(|| format!("Stream {stream_id} has no genesis miniblock"))?;

        let last_num = storage.get_last_miniblock_number(stream_id).await?;
        let last_raw = storage
            .read_miniblocks(stream_id, last_num, last_num + 1)
            .await?
            .into_iter()
            .next()
            .with_context(|| format!("Stream {stream_id} is missing block {last_num}"))?;
        let last = MiniblockInfo::from_bytes(*stream_id, &last_raw, Some(last_num))
            .with_context(|| format!("Stream {stream_id} has a corrupt block {last_num}"))?;

        registry.allocate_stream(
            StreamRecord {
                stream_id: *stream_id,
                nodes: vec![local_node],
                last_miniblock_num: last_num,
                last_miniblock_hash: last.hash(),
            },
            genesis,
        )?;
    }
    Ok(streams.len())
}

/// Emits a tick per `interval`, advancing the registry's block first.
fn spawn_dev_ticks(
    interval: Duration,
    registry: Arc<InMemoryRegistry>,
    ticks: mpsc::UnboundedSender<u64>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut block = 0u64;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = timer.tick() => {
                    block += 1;
                    if let Err(e) = registry.set_block(block) {
                        error!(error = %e, "failed to advance registry block");
                        break;
                    }
                    if ticks.send(block).is_err() {
                        debug!("tick listener gone");
                        break;
                    }
                }
            }
        }
    })
}
