//! Streams known to this node.
//!
//! The cache maps stream ids to [`Stream`] handles. Entries are created
//! unloaded at startup (or on first lookup from the registry) and load their
//! views lazily. Two background tasks run until cancelled:
//!
//! - the cleanup loop evicts idle views on a timer;
//! - the tick listener starts a production sweep for every chain tick.
//!
//! Production is single-flight: a tick that finds a sweep running is
//! dropped, since the next tick covers the same streams.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use strand_types::StreamId;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{StreamError, StreamResult},
    metrics::CacheMetrics,
    registry::{StreamRecord, StreamRegistry},
    stream::{Stream, StreamParams},
    view::StreamView,
};

/// First delay while waiting for a registry record to appear.
const REGISTRY_WAIT_INITIAL_DELAY: Duration = Duration::from_millis(20);

// ============================================================================
// Configuration and results
// ============================================================================

/// Timers of the stream cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Period of the eviction sweep; zero disables eviction.
    pub cleanup_interval: Duration,
    /// Idle time after which a view may be evicted.
    pub expiration: Duration,
    /// How long `get_stream` waits for a registry record when asked to.
    pub registry_wait_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(60),
            expiration: Duration::from_secs(300),
            registry_wait_timeout: Duration::from_secs(10),
        }
    }
}

/// Counters from one eviction sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCleanupResult {
    /// Local streams in the cache.
    pub total_streams: usize,
    /// Local streams without a view after the sweep.
    pub unloaded_streams: usize,
    pub remote_streams: usize,
}

/// Outcome of one production sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProductionReport {
    /// Streams eligible when the sweep started.
    pub candidates: usize,
    pub produced: usize,
    /// Streams whose minipool was drained before their turn.
    pub skipped: usize,
    pub failed: usize,
    /// The sweep stopped early on cancellation.
    pub cancelled: bool,
}

// ============================================================================
// Cache
// ============================================================================

#[derive(Debug)]
pub(crate) struct CacheInner {
    streams: DashMap<StreamId, Arc<Stream>>,
    params: Arc<StreamParams>,
    registry: Arc<dyn StreamRegistry>,
    config: CacheConfig,
    /// Held for the duration of a production sweep.
    pub(crate) production: Arc<Mutex<()>>,
    metrics: CacheMetrics,
}

/// Shared handle to the stream cache.
#[derive(Debug, Clone)]
pub struct StreamCache {
    pub(crate) inner: Arc<CacheInner>,
}

impl StreamCache {
    pub fn new(
        params: StreamParams,
        registry: Arc<dyn StreamRegistry>,
        config: CacheConfig,
    ) -> StreamResult<Self> {
        Ok(Self {
            inner: Arc::new(CacheInner {
                streams: DashMap::new(),
                params: Arc::new(params),
                registry,
                config,
                production: Arc::new(Mutex::new(())),
                metrics: CacheMetrics::new()?,
            }),
        })
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.inner.metrics
    }

    /// Number of cached entries, local and remote.
    pub fn len(&self) -> usize {
        self.inner.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.streams.is_empty()
    }

    fn streams(&self) -> Vec<Arc<Stream>> {
        self.inner
            .streams
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn cached(&self, stream_id: &StreamId) -> Option<Arc<Stream>> {
        self.inner
            .streams
            .get(stream_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    // ------------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------------

    /// Fills the cache from the registry and spawns the background tasks.
    ///
    /// Only streams that list this node are inserted; their views stay
    /// unloaded. Both tasks stop when `cancel` fires.
    pub async fn start(
        &self,
        applied_block: u64,
        ticks: mpsc::UnboundedReceiver<u64>,
        cancel: CancellationToken,
    ) -> StreamResult<Vec<JoinHandle<()>>> {
        let local_node = self.inner.params.local_node;
        let records = self.inner.registry.get_all_streams(applied_block).await?;
        let mut local = 0usize;
        for record in records.into_iter().filter(|r| r.is_local(&local_node)) {
            self.inner
                .streams
                .entry(record.stream_id)
                .or_insert_with(|| {
                    Arc::new(Stream::new(
                        record.stream_id,
                        record.nodes,
                        Arc::clone(&self.inner.params),
                    ))
                });
            local += 1;
        }
        info!(applied_block, streams = local, "stream cache started");

        let mut tasks = Vec::with_capacity(2);
        let interval = self.inner.config.cleanup_interval;
        if interval.is_zero() {
            self.cache_cleanup(false, self.inner.config.expiration, &cancel);
        } else {
            tasks.push(tokio::spawn(
                self.clone().run_cache_cleanup(interval, cancel.clone()),
            ));
        }
        tasks.push(tokio::spawn(self.clone().run_tick_listener(ticks, cancel)));
        Ok(tasks)
    }

    async fn run_cache_cleanup(self, interval: Duration, cancel: CancellationToken) {
        let mut timer = tokio::time::interval_at(Instant::now() + interval, interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("stream cache cleanup shutdown");
                    break;
                }
                _ = timer.tick() => {
                    self.cache_cleanup(true, self.inner.config.expiration, &cancel);
                }
            }
        }
    }

    async fn run_tick_listener(
        self,
        mut ticks: mpsc::UnboundedReceiver<u64>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("tick listener shutdown");
                    break;
                }
                tick = ticks.recv() => match tick {
                    Some(block) => {
                        self.on_new_block(block, &cancel);
                    }
                    None => {
                        debug!("tick source closed");
                        break;
                    }
                },
            }
        }
    }

    // ------------------------------------------------------------------------
    // Lookup and creation
    // ------------------------------------------------------------------------

    /// Returns the stream, reading its record from the registry on a miss.
    ///
    /// With `wait_for_local`, a record that the registry does not show yet
    /// is polled for with exponential backoff up to the configured timeout.
    pub async fn get_stream(
        &self,
        stream_id: &StreamId,
        wait_for_local: bool,
    ) -> StreamResult<Arc<Stream>> {
        if let Some(stream) = self.cached(stream_id) {
            return Ok(stream);
        }
        self.load_stream_record(stream_id, wait_for_local).await
    }

    /// Returns a local stream together with its loaded view.
    pub async fn create_stream(
        &self,
        stream_id: &StreamId,
    ) -> StreamResult<(Arc<Stream>, Arc<StreamView>)> {
        let stream = self.get_stream(stream_id, true).await?;
        let view = stream.get_view().await?;
        Ok((stream, view))
    }

    async fn load_stream_record(
        &self,
        stream_id: &StreamId,
        wait_for_local: bool,
    ) -> StreamResult<Arc<Stream>> {
        let found = self.inner.registry.get_stream_with_genesis(stream_id).await?;
        let (record, genesis) = match found {
            Some(found) => found,
            None if !wait_for_local => {
                return Err(StreamError::Registry(format!(
                    "stream {stream_id} is not allocated"
                )));
            }
            None => match self.wait_for_record(stream_id).await? {
                WaitOutcome::Cached(stream) => return Ok(stream),
                WaitOutcome::Record(record, genesis) => (record, genesis),
            },
        };

        let stream = Arc::new(Stream::new(
            *stream_id,
            record.nodes.clone(),
            Arc::clone(&self.inner.params),
        ));

        if !stream.is_local() {
            let entry = self.inner.streams.entry(*stream_id).or_insert(stream);
            return Ok(Arc::clone(entry.value()));
        }

        if record.last_miniblock_num > 0 {
            // Reconciling from peers is not supported.
            return Err(StreamError::StreamPastGenesis {
                stream_id: *stream_id,
                last_miniblock_num: record.last_miniblock_num,
            });
        }

        self.create_stream_storage(stream, genesis).await
    }

    async fn wait_for_record(&self, stream_id: &StreamId) -> StreamResult<WaitOutcome> {
        tokio::time::timeout(
            self.inner.config.registry_wait_timeout,
            self.poll_registry(stream_id),
        )
        .await
        .map_err(|_| {
            StreamError::Registry(format!(
                "timed out waiting for stream {stream_id} to be allocated"
            ))
        })?
    }

    async fn poll_registry(&self, stream_id: &StreamId) -> StreamResult<WaitOutcome> {
        let mut delay = REGISTRY_WAIT_INITIAL_DELAY;
        loop {
            tokio::time::sleep(delay).await;
            if let Some(stream) = self.cached(stream_id) {
                return Ok(WaitOutcome::Cached(stream));
            }
            if let Some((record, genesis)) =
                self.inner.registry.get_stream_with_genesis(stream_id).await?
            {
                return Ok(WaitOutcome::Record(record, genesis));
            }
            delay *= 2;
        }
    }

    /// Publishes `stream` and writes its genesis block.
    ///
    /// The new entry is locked before it becomes visible, so concurrent
    /// callers that find it wait for creation to finish. A caller that finds
    /// an existing entry attaches to it instead.
    async fn create_stream_storage(
        &self,
        stream: Arc<Stream>,
        genesis: Bytes,
    ) -> StreamResult<Arc<Stream>> {
        let mut state = stream.lock_state().await;
        match self.inner.streams.entry(stream.stream_id()) {
            Entry::Occupied(existing) => return Ok(Arc::clone(existing.get())),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&stream));
            }
        }

        if let Err(e) = stream.create_storage_locked(&mut state, genesis).await {
            drop(state);
            self.inner
                .streams
                .remove_if(&stream.stream_id(), |_, cached| Arc::ptr_eq(cached, &stream));
            return Err(e);
        }
        drop(state);
        Ok(stream)
    }

    // ------------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------------

    /// Evicts idle views and refreshes the cache gauges.
    ///
    /// With `enabled` false only the counters are computed. The sweep stops
    /// between streams once `cancel` fires.
    pub fn cache_cleanup(
        &self,
        enabled: bool,
        expiration: Duration,
        cancel: &CancellationToken,
    ) -> CacheCleanupResult {
        let mut result = CacheCleanupResult::default();
        for entry in &self.inner.streams {
            if cancel.is_cancelled() {
                break;
            }
            let stream = entry.value();
            if !stream.is_local() {
                result.remote_streams += 1;
                continue;
            }
            result.total_streams += 1;
            if enabled && stream.try_cleanup(expiration) {
                result.unloaded_streams += 1;
            }
        }

        let metrics = &self.inner.metrics;
        metrics.streams.set(result.total_streams as i64);
        metrics.unloaded.set(if enabled {
            result.unloaded_streams as i64
        } else {
            -1
        });
        metrics.remote.set(result.remote_streams as i64);
        debug!(
            total = result.total_streams,
            unloaded = result.unloaded_streams,
            remote = result.remote_streams,
            "stream cache cleanup"
        );
        result
    }

    // ------------------------------------------------------------------------
    // Production
    // ------------------------------------------------------------------------

    /// Starts a production sweep for chain block `block` unless one is running.
    ///
    /// Returns false when the tick was dropped.
    pub fn on_new_block(&self, block: u64, cancel: &CancellationToken) -> bool {
        let Ok(guard) = Arc::clone(&self.inner.production).try_lock_owned() else {
            debug!(block, "production sweep in progress, tick dropped");
            return false;
        };
        let cache = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let report = cache.produce_blocks_locked(&cancel).await;
            drop(guard);
            if report.produced > 0 || report.failed > 0 {
                info!(
                    block,
                    produced = report.produced,
                    failed = report.failed,
                    "production sweep finished"
                );
            }
        });
        true
    }

    /// Runs a production sweep now, or returns `None` if one is running.
    pub async fn try_produce_blocks(&self, cancel: &CancellationToken) -> Option<ProductionReport> {
        let _guard = self.inner.production.try_lock().ok()?;
        Some(self.produce_blocks_locked(cancel).await)
    }

    /// Waits until no production sweep is running.
    ///
    /// A cancelled sweep still finishes the stream it is working on, so
    /// shutdown calls this after cancelling and before flushing.
    pub async fn wait_idle(&self) {
        drop(self.inner.production.lock().await);
    }

    async fn produce_blocks_locked(&self, cancel: &CancellationToken) -> ProductionReport {
        let candidates = self.get_mb_candidate_streams().await;
        let mut report = ProductionReport {
            candidates: candidates.len(),
            ..ProductionReport::default()
        };
        for stream in candidates {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match stream.make_miniblock(false).await {
                Ok(Some(_)) => report.produced += 1,
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(stream_id = %stream.stream_id(), error = %e, "failed to make miniblock");
                }
            }
        }
        report
    }

    // ------------------------------------------------------------------------
    // Bulk access
    // ------------------------------------------------------------------------

    /// Unloads every view and disconnects every subscriber.
    pub async fn force_flush_all(&self) {
        for stream in self.streams() {
            stream.force_flush().await;
        }
    }

    /// Views currently in memory.
    pub async fn get_loaded_views(&self) -> Vec<Arc<StreamView>> {
        let mut views = Vec::new();
        for stream in self.streams() {
            if let Some(view) = stream.loaded_view().await {
                views.push(view);
            }
        }
        views
    }

    /// Streams this node should produce a block for right now.
    pub async fn get_mb_candidate_streams(&self) -> Vec<Arc<Stream>> {
        let mut candidates = Vec::new();
        for stream in self.streams() {
            if stream.can_create_miniblock().await {
                candidates.push(stream);
            }
        }
        candidates
    }
}

enum WaitOutcome {
    Cached(Arc<Stream>),
    Record(StreamRecord, Bytes),
}
