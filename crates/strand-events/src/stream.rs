//! Runtime state of one stream.
//!
//! A [`Stream`] is either unloaded or holds an `Arc<StreamView>`. All
//! mutations take the per-stream lock, write through to storage and only
//! then swap in the new view, so a failed write never changes memory.
//!
//! ```text
//!   Unloaded --load--> Loaded --add_event / apply_miniblock--> Loaded
//!      ^                  |
//!      +----evict/flush---+
//! ```

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use strand_storage::{ErrorKind, ReadStreamResult, StreamStorage};
use strand_types::{Address, MiniblockRef, StreamId};
use tokio::{
    sync::{Mutex, MutexGuard, broadcast},
    time::Instant,
};
use tracing::{debug, info};

use crate::{
    entitlements::{Entitlements, Permission},
    error::{StreamError, StreamResult},
    event::ParsedEvent,
    miniblock::MiniblockInfo,
    view::{EventDisposition, MiniblockProposal, StreamConfig, StreamView},
};

/// Buffered updates per subscriber before it starts lagging.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Collaborators shared by every stream of a node.
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub storage: Arc<dyn StreamStorage>,
    pub config: StreamConfig,
    pub entitlements: Arc<dyn Entitlements>,
    pub local_node: Address,
}

/// Notification delivered to subscribers.
#[derive(Debug, Clone)]
pub enum StreamUpdate {
    /// An event entered the minipool.
    Event(Arc<ParsedEvent>),
    /// A block was applied; the minipool is now `generation`.
    Miniblock {
        reference: MiniblockRef,
        generation: u64,
    },
    /// The view was dropped; receivers must resubscribe.
    Unloaded,
}

#[derive(Debug)]
pub(crate) struct StreamState {
    view: Option<Arc<StreamView>>,
    last_accessed: Instant,
    updates: broadcast::Sender<StreamUpdate>,
}

impl StreamState {
    fn new(view: Option<Arc<StreamView>>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            view,
            last_accessed: Instant::now(),
            updates,
        }
    }

    fn publish(&mut self, update: StreamUpdate) {
        if self.updates.receiver_count() > 0 {
            self.last_accessed = Instant::now();
            // Only fails when every receiver is gone.
            let _ = self.updates.send(update);
        }
    }
}

/// One stream known to this node.
#[derive(Debug)]
pub struct Stream {
    stream_id: StreamId,
    nodes: Vec<Address>,
    params: Arc<StreamParams>,
    state: Mutex<StreamState>,
}

impl Stream {
    /// An unloaded stream; the view is read from storage on first access.
    pub fn new(stream_id: StreamId, nodes: Vec<Address>, params: Arc<StreamParams>) -> Self {
        Self {
            stream_id,
            nodes,
            params,
            state: Mutex::new(StreamState::new(None)),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn nodes(&self) -> &[Address] {
        &self.nodes
    }

    /// Whether this node hosts the stream.
    pub fn is_local(&self) -> bool {
        self.nodes.contains(&self.params.local_node)
    }

    /// Whether this node is responsible for producing the stream's blocks.
    pub fn is_producer(&self) -> bool {
        self.nodes.first() == Some(&self.params.local_node)
    }

    fn ensure_local(&self) -> StreamResult<()> {
        if self.is_local() {
            Ok(())
        } else {
            Err(StreamError::NotLocal(self.stream_id))
        }
    }

    async fn load_locked(&self, state: &mut StreamState) -> StreamResult<Arc<StreamView>> {
        if let Some(view) = &state.view {
            return Ok(Arc::clone(view));
        }
        let stored = self
            .params
            .storage
            .read_stream_from_last_snapshot(&self.stream_id, self.params.config.recency_generations)
            .await?;
        let view = Arc::new(StreamView::from_stored(self.stream_id, &stored)?);
        debug!(
            stream_id = %self.stream_id,
            first = stored.start_miniblock_num,
            last = view.last_block().num(),
            minipool = view.minipool_len(),
            "loaded stream view"
        );
        state.view = Some(Arc::clone(&view));
        Ok(view)
    }

    pub(crate) async fn lock_state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().await
    }

    /// Writes the genesis block of a new stream and installs its view.
    ///
    /// Losing the creation race to another writer is not an error: the
    /// winner's data is loaded instead.
    pub(crate) async fn create_storage_locked(
        &self,
        state: &mut StreamState,
        genesis: Bytes,
    ) -> StreamResult<Arc<StreamView>> {
        match self
            .params
            .storage
            .create_stream_storage(&self.stream_id, genesis.clone())
            .await
        {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(stream_id = %self.stream_id, "stream storage already exists, loading");
                return self.load_locked(state).await;
            }
            Err(e) => return Err(e.into()),
        }

        let stored = ReadStreamResult {
            start_miniblock_num: 0,
            snapshot_miniblock_num: 0,
            miniblocks: vec![genesis],
            minipool: Vec::new(),
        };
        let view = Arc::new(StreamView::from_stored(self.stream_id, &stored)?);
        info!(stream_id = %self.stream_id, "created stream storage");
        state.view = Some(Arc::clone(&view));
        Ok(view)
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Returns the current view, loading it first if needed.
    pub async fn get_view(&self) -> StreamResult<Arc<StreamView>> {
        self.ensure_local()?;
        let mut state = self.state.lock().await;
        let view = self.load_locked(&mut state).await?;
        state.last_accessed = Instant::now();
        Ok(view)
    }

    /// The view if it is in memory, without loading or touching it.
    pub async fn loaded_view(&self) -> Option<Arc<StreamView>> {
        self.state.lock().await.view.clone()
    }

    pub async fn is_loaded(&self) -> bool {
        self.state.lock().await.view.is_some()
    }

    /// Reads blocks `[from, to)` straight from storage, bypassing the view.
    pub async fn get_miniblocks(&self, from: u64, to: u64) -> StreamResult<Vec<MiniblockInfo>> {
        self.ensure_local()?;
        let raw = self
            .params
            .storage
            .read_miniblocks(&self.stream_id, from, to)
            .await?;
        raw.iter()
            .zip(from..)
            .map(|(bytes, num)| MiniblockInfo::from_bytes(self.stream_id, bytes, Some(num)))
            .collect()
    }

    /// Subscribes to updates, returning the view the updates follow.
    pub async fn subscribe(
        &self,
    ) -> StreamResult<(Arc<StreamView>, broadcast::Receiver<StreamUpdate>)> {
        self.ensure_local()?;
        let mut state = self.state.lock().await;
        let view = self.load_locked(&mut state).await?;
        state.last_accessed = Instant::now();
        Ok((view, state.updates.subscribe()))
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Appends `event` to the minipool.
    ///
    /// Entitlements are checked before the stream lock is taken. Adding an
    /// event that is already in the view returns the current view unchanged.
    pub async fn add_event(&self, event: ParsedEvent) -> StreamResult<Arc<StreamView>> {
        self.ensure_local()?;
        self.check_entitlements(&event).await?;

        let mut state = self.state.lock().await;
        let view = self.load_locked(&mut state).await?;
        if view.validate_next_event(&event)? == EventDisposition::Duplicate {
            debug!(stream_id = %self.stream_id, hash = ?event.hash(), "duplicate event ignored");
            return Ok(view);
        }

        let generation = view.generation();
        let slot = view.minipool_len() as u64;
        let raw = event.raw().clone();
        let update = Arc::new(event.clone());
        let next = Arc::new(view.with_event(event)?);

        self.params
            .storage
            .write_event(&self.stream_id, generation, slot, raw)
            .await?;

        state.view = Some(Arc::clone(&next));
        state.last_accessed = Instant::now();
        state.publish(StreamUpdate::Event(update));
        Ok(next)
    }

    async fn check_entitlements(&self, event: &ParsedEvent) -> StreamResult<()> {
        let entitlements = &self.params.entitlements;
        if entitlements.is_disabled().await {
            return Err(StreamError::PermissionDenied {
                stream_id: self.stream_id,
                reason: "writes are paused".into(),
            });
        }
        if let Some(creator) = &event.event.creator
            && !entitlements
                .is_entitled(&self.stream_id, creator, Permission::Write)
                .await
        {
            return Err(StreamError::PermissionDenied {
                stream_id: self.stream_id,
                reason: format!("{creator} may not write"),
            });
        }
        Ok(())
    }

    /// Cuts a proposal from the current minipool.
    ///
    /// Returns `None` when the minipool is empty unless `force_empty` is set.
    pub async fn propose_next_miniblock(
        &self,
        force_empty: bool,
        force_snapshot: bool,
    ) -> StreamResult<Option<MiniblockProposal>> {
        let view = self.get_view().await?;
        if view.minipool_len() == 0 && !force_empty {
            return Ok(None);
        }
        let now_ms = chrono::Utc::now().timestamp_millis();
        Ok(Some(view.propose_next_miniblock(
            &self.params.config,
            force_snapshot,
            now_ms,
        )))
    }

    /// Builds the block described by `proposal` against the current view.
    pub async fn make_miniblock_header(
        &self,
        proposal: &MiniblockProposal,
    ) -> StreamResult<MiniblockInfo> {
        self.get_view().await?.make_miniblock_header(proposal)
    }

    /// Stores `candidate` as a block proposal.
    ///
    /// A candidate at or below the last applied block is ignored.
    pub async fn save_miniblock_candidate(&self, candidate: &MiniblockInfo) -> StreamResult<()> {
        let view = self.get_view().await?;
        let last = view.last_block().num();
        if candidate.num() <= last {
            debug!(
                stream_id = %self.stream_id,
                candidate = candidate.num(),
                last,
                "candidate already behind the stream"
            );
            return Ok(());
        }
        self.params
            .storage
            .write_block_proposal(
                &self.stream_id,
                candidate.hash(),
                candidate.num(),
                candidate.to_bytes()?,
            )
            .await?;
        Ok(())
    }

    /// Promotes a saved candidate and extends the view with it.
    ///
    /// Minipool events that are not in the block, including those added
    /// after the proposal was cut, are carried into the next generation.
    pub async fn apply_miniblock(&self, block: MiniblockInfo) -> StreamResult<Arc<StreamView>> {
        self.ensure_local()?;
        let mut state = self.state.lock().await;
        let view = self.load_locked(&mut state).await?;

        let last = view.last_block().num();
        if block.num() <= last {
            return Ok(view);
        }
        if block.num() > last + 1 {
            return Err(StreamError::bad_block(
                self.stream_id,
                format!("block {} skips ahead of last block {last}", block.num()),
            ));
        }

        let num = block.num();
        let hash = block.hash();
        let is_snapshot = block.snapshot().is_some();
        let next = Arc::new(view.with_block(Arc::new(block), &self.params.config)?);

        self.params
            .storage
            .promote_block(
                &self.stream_id,
                num,
                hash,
                is_snapshot,
                next.minipool_envelopes(),
            )
            .await?;

        info!(
            stream_id = %self.stream_id,
            generation = num,
            events = next.last_block().events.len(),
            carried_over = next.minipool_len(),
            snapshot = is_snapshot,
            "applied miniblock"
        );
        state.view = Some(Arc::clone(&next));
        state.last_accessed = Instant::now();
        state.publish(StreamUpdate::Miniblock {
            reference: next.last_miniblock_ref(),
            generation: next.generation(),
        });
        Ok(next)
    }

    /// Proposes, builds, saves and applies the next block.
    ///
    /// The stream lock is released between steps, so events may arrive
    /// while the block is being made; they stay in the minipool.
    pub async fn make_miniblock(&self, force_snapshot: bool) -> StreamResult<Option<MiniblockRef>> {
        let Some(proposal) = self.propose_next_miniblock(false, force_snapshot).await? else {
            return Ok(None);
        };
        let block = self.make_miniblock_header(&proposal).await?;
        self.save_miniblock_candidate(&block).await?;
        let view = self.apply_miniblock(block).await?;
        Ok(Some(view.last_miniblock_ref()))
    }

    // ------------------------------------------------------------------------
    // Cache management
    // ------------------------------------------------------------------------

    /// Whether the periodic producer should make a block for this stream now.
    pub async fn can_create_miniblock(&self) -> bool {
        if !self.is_local() || !self.is_producer() {
            return false;
        }
        let state = self.state.lock().await;
        state.view.as_ref().is_some_and(|view| {
            view.minipool_len() > 0
                && !view
                    .snapshot()
                    .inception
                    .settings
                    .disable_miniblock_creation
        })
    }

    /// Drops the view if it has been idle for `expiration`.
    ///
    /// Returns true when the stream is unloaded afterwards. A busy lock, a
    /// live subscriber or a non-empty minipool keeps the view.
    pub fn try_cleanup(&self, expiration: Duration) -> bool {
        if !self.is_local() {
            return false;
        }
        let Ok(mut state) = self.state.try_lock() else {
            return false;
        };
        let Some(view) = &state.view else {
            return true;
        };
        if state.updates.receiver_count() > 0
            || state.last_accessed.elapsed() < expiration
            || view.minipool_len() > 0
        {
            return false;
        }
        state.view = None;
        debug!(stream_id = %self.stream_id, "evicted stream view");
        true
    }

    /// Drops the view and disconnects every subscriber.
    pub async fn force_flush(&self) {
        if !self.is_local() {
            return;
        }
        let mut state = self.state.lock().await;
        state.view = None;
        let _ = state.updates.send(StreamUpdate::Unloaded);
        state.updates = broadcast::channel(UPDATE_CHANNEL_CAPACITY).0;
    }
}
