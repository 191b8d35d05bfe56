//! # strand-events: Streams, views and the stream cache
//!
//! This crate turns stored bytes into live streams:
//!
//! ```text
//!   StreamStorage ──read──► StreamView (immutable, Arc-shared)
//!         ▲                     │
//!         │ write_event         │ with_event / with_block
//!         │ promote_block       ▼
//!       Stream ◄──────────── StreamCache ◄── chain ticks
//!   (per-stream lock)        (DashMap, eviction, production)
//! ```
//!
//! - [`event`]: envelopes and their BLAKE3 hashes.
//! - [`miniblock`]: block headers, snapshots and genesis construction.
//! - [`view`]: the pure state of a stream and its transitions.
//! - [`stream`]: write-through state machine around one view.
//! - [`cache`]: the set of streams on a node and periodic block production.
//! - [`registry`] and [`entitlements`]: capabilities supplied by the node.
//!
//! Block production is deterministic: a [`MiniblockProposal`] fixes the
//! events and the timestamp, and every replica holding the same view builds
//! byte-identical headers from it.

mod error;

pub mod cache;
pub mod entitlements;
pub mod event;
pub mod metrics;
pub mod miniblock;
pub mod registry;
pub mod stream;
pub mod view;

pub use cache::{CacheCleanupResult, CacheConfig, ProductionReport, StreamCache};
pub use entitlements::{AllowAll, Entitlements, EntitlementsBackend, Permission, StaticEntitlements};
pub use error::{StreamError, StreamResult};
pub use event::{Envelope, EventPayload, MembershipOp, ParsedEvent, StreamEvent};
pub use metrics::CacheMetrics;
pub use miniblock::{MiniblockHeader, MiniblockInfo, Snapshot, StreamSettings, make_genesis};
pub use registry::{InMemoryRegistry, StreamRecord, StreamRegistry};
pub use stream::{Stream, StreamParams, StreamUpdate};
pub use view::{EventDisposition, MiniblockProposal, StreamConfig, StreamView, StreamViewStats};
