//! Unit tests for strand-storage
//!
//! Behavioral tests run against both backends through the trait object, so
//! the memory store stays an honest stand-in for SQLite.

use bytes::Bytes;
use proptest::prelude::*;
use sqlx::{ConnectOptions, sqlite::SqliteConnectOptions};
use strand_types::{Hash, StreamId, StreamKind};
use tempfile::TempDir;
use test_case::test_case;
use tokio::sync::mpsc;

use crate::{
    ErrorKind, MemoryStreamStore, PoolConfig, SqliteStreamStore, StreamStorage, table_suffix,
};

// ============================================================================
// Fixtures
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Backend {
    Memory,
    Sqlite,
}

struct Fixture {
    store: Box<dyn StreamStorage>,
    _dir: Option<TempDir>,
}

fn quiet_pool() -> PoolConfig {
    PoolConfig {
        pool_stats_interval_secs: 0,
        ..PoolConfig::default()
    }
}

async fn open(backend: Backend) -> Fixture {
    match backend {
        Backend::Memory => Fixture {
            store: Box::new(MemoryStreamStore::new()),
            _dir: None,
        },
        Backend::Sqlite => {
            let dir = tempfile::tempdir().unwrap();
            let store = SqliteStreamStore::open(dir.path().join("streams.db"), quiet_pool(), None)
                .await
                .unwrap();
            Fixture {
                store: Box::new(store),
                _dir: Some(dir),
            }
        }
    }
}

fn stream(n: u8) -> StreamId {
    StreamId::new(StreamKind::Channel, &[n; 31]).unwrap()
}

fn hash(n: u8) -> Hash {
    Hash::from_bytes([n; 32])
}

fn block(num: u64) -> Bytes {
    Bytes::from(format!("block-{num}"))
}

fn event(text: &str) -> Bytes {
    Bytes::from(text.to_string())
}

/// Proposes and promotes the block for `generation` with a candidate hash
/// derived from the generation number.
async fn promote_next(
    store: &dyn StreamStorage,
    id: &StreamId,
    generation: u64,
    is_snapshot: bool,
    carryover: Vec<Bytes>,
) {
    let candidate = hash(generation as u8);
    store
        .write_block_proposal(id, candidate, generation, block(generation))
        .await
        .unwrap();
    store
        .promote_block(id, generation, candidate, is_snapshot, carryover)
        .await
        .unwrap();
}

// ============================================================================
// Creation and reads
// ============================================================================

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn new_stream_holds_genesis_and_empty_minipool(backend: Backend) {
    let f = open(backend).await;
    let id = stream(1);
    f.store.create_stream_storage(&id, block(0)).await.unwrap();

    let read = f.store.read_stream_from_last_snapshot(&id, 0).await.unwrap();
    assert_eq!(read.start_miniblock_num, 0);
    assert_eq!(read.snapshot_miniblock_num, 0);
    assert_eq!(read.miniblocks, vec![block(0)]);
    assert!(read.minipool.is_empty());
    assert_eq!(read.last_miniblock_num(), 0);
    assert_eq!(f.store.get_last_miniblock_number(&id).await.unwrap(), 0);
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn creating_twice_reports_already_exists(backend: Backend) {
    let f = open(backend).await;
    let id = stream(1);
    f.store.create_stream_storage(&id, block(0)).await.unwrap();

    let err = f
        .store
        .create_stream_storage(&id, Bytes::from_static(b"other genesis"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    let read = f.store.read_miniblocks(&id, 0, 1).await.unwrap();
    assert_eq!(read, vec![block(0)]);
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn unknown_stream_is_not_found(backend: Backend) {
    let f = open(backend).await;
    let id = stream(9);

    let errs = [
        f.store.read_stream_from_last_snapshot(&id, 0).await.unwrap_err(),
        f.store.read_miniblocks(&id, 0, 1).await.unwrap_err(),
        f.store.write_event(&id, 1, 0, event("x")).await.unwrap_err(),
        f.store
            .write_block_proposal(&id, hash(1), 1, block(1))
            .await
            .unwrap_err(),
        f.store
            .promote_block(&id, 1, hash(1), false, vec![])
            .await
            .unwrap_err(),
        f.store.delete_stream(&id).await.unwrap_err(),
    ];
    for err in errs {
        assert_eq!(err.kind(), ErrorKind::NotFound, "{err}");
    }
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn promotions_keep_blocks_gapless(backend: Backend) {
    let f = open(backend).await;
    let id = stream(1);
    f.store.create_stream_storage(&id, block(0)).await.unwrap();

    for generation in 1..=5 {
        f.store
            .write_event(&id, generation, 0, event("e"))
            .await
            .unwrap();
        promote_next(f.store.as_ref(), &id, generation, false, vec![]).await;
    }

    let blocks = f.store.read_miniblocks(&id, 0, 6).await.unwrap();
    assert_eq!(blocks, (0..=5).map(block).collect::<Vec<_>>());
    assert_eq!(f.store.get_last_miniblock_number(&id).await.unwrap(), 5);

    let middle = f.store.read_miniblocks(&id, 2, 4).await.unwrap();
    assert_eq!(middle, vec![block(2), block(3)]);
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn open_ended_ranges_read_to_the_last_block(backend: Backend) {
    let f = open(backend).await;
    let id = stream(1);
    f.store.create_stream_storage(&id, block(0)).await.unwrap();
    promote_next(f.store.as_ref(), &id, 1, false, vec![]).await;

    let all = f.store.read_miniblocks(&id, 0, u64::MAX).await.unwrap();
    assert_eq!(all, vec![block(0), block(1)]);

    let tail = f.store.read_miniblocks(&id, 1, u64::MAX).await.unwrap();
    assert_eq!(tail, vec![block(1)]);

    let beyond = f.store.read_miniblocks(&id, u64::MAX, u64::MAX).await.unwrap();
    assert!(beyond.is_empty());
}

// ============================================================================
// Event writes
// ============================================================================

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn events_fill_slots_in_order(backend: Backend) {
    let f = open(backend).await;
    let id = stream(1);
    f.store.create_stream_storage(&id, block(0)).await.unwrap();

    f.store.write_event(&id, 1, 0, event("1")).await.unwrap();
    f.store.write_event(&id, 1, 1, event("2")).await.unwrap();

    let read = f.store.read_stream_from_last_snapshot(&id, 0).await.unwrap();
    assert_eq!(read.minipool, vec![event("1"), event("2")]);
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn mismatched_writes_fail_without_mutation(backend: Backend) {
    let f = open(backend).await;
    let id = stream(1);
    f.store.create_stream_storage(&id, block(0)).await.unwrap();
    f.store.write_event(&id, 1, 0, event("1")).await.unwrap();

    let stale_generation = f.store.write_event(&id, 0, 1, event("x")).await.unwrap_err();
    assert_eq!(stale_generation.kind(), ErrorKind::BadGeneration);

    let future_generation = f.store.write_event(&id, 2, 1, event("x")).await.unwrap_err();
    assert_eq!(future_generation.kind(), ErrorKind::BadGeneration);

    let reused_slot = f.store.write_event(&id, 1, 0, event("x")).await.unwrap_err();
    assert_eq!(reused_slot.kind(), ErrorKind::BadSlot);

    let skipped_slot = f.store.write_event(&id, 1, 2, event("x")).await.unwrap_err();
    assert_eq!(skipped_slot.kind(), ErrorKind::BadSlot);

    let read = f.store.read_stream_from_last_snapshot(&id, 0).await.unwrap();
    assert_eq!(read.minipool, vec![event("1")]);
}

// ============================================================================
// Candidates and promotion
// ============================================================================

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn unknown_candidate_is_not_found_and_changes_nothing(backend: Backend) {
    let f = open(backend).await;
    let id = stream(1);
    f.store.create_stream_storage(&id, block(0)).await.unwrap();
    f.store.write_event(&id, 1, 0, event("1")).await.unwrap();

    let err = f
        .store
        .promote_block(&id, 1, hash(42), false, vec![])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    assert_eq!(f.store.get_last_miniblock_number(&id).await.unwrap(), 0);
    let read = f.store.read_stream_from_last_snapshot(&id, 0).await.unwrap();
    assert_eq!(read.minipool, vec![event("1")]);
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn promoting_wrong_generation_is_rejected(backend: Backend) {
    let f = open(backend).await;
    let id = stream(1);
    f.store.create_stream_storage(&id, block(0)).await.unwrap();
    f.store
        .write_block_proposal(&id, hash(2), 2, block(2))
        .await
        .unwrap();

    let err = f
        .store
        .promote_block(&id, 2, hash(2), false, vec![])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadGeneration);
    assert_eq!(f.store.get_last_miniblock_number(&id).await.unwrap(), 0);
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn promotion_purges_only_this_streams_old_candidates(backend: Backend) {
    let f = open(backend).await;
    let (a, b) = (stream(1), stream(2));
    f.store.create_stream_storage(&a, block(0)).await.unwrap();
    f.store.create_stream_storage(&b, block(0)).await.unwrap();

    f.store.write_block_proposal(&a, hash(1), 1, block(1)).await.unwrap();
    f.store
        .write_block_proposal(&a, hash(11), 1, Bytes::from_static(b"rival"))
        .await
        .unwrap();
    f.store.write_block_proposal(&a, hash(2), 2, block(2)).await.unwrap();
    f.store.write_block_proposal(&b, hash(1), 1, block(1)).await.unwrap();

    f.store
        .promote_block(&a, 1, hash(1), false, vec![])
        .await
        .unwrap();

    let rival = f
        .store
        .read_miniblock_candidate(&a, hash(11), 1)
        .await
        .unwrap_err();
    assert_eq!(rival.kind(), ErrorKind::NotFound);
    assert_eq!(
        f.store.read_miniblock_candidate(&a, hash(2), 2).await.unwrap(),
        block(2)
    );
    assert_eq!(
        f.store.read_miniblock_candidate(&b, hash(1), 1).await.unwrap(),
        block(1)
    );
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn duplicate_candidate_is_a_no_op(backend: Backend) {
    let f = open(backend).await;
    let id = stream(1);
    f.store.create_stream_storage(&id, block(0)).await.unwrap();

    f.store.write_block_proposal(&id, hash(1), 1, block(1)).await.unwrap();
    f.store.write_block_proposal(&id, hash(1), 1, block(1)).await.unwrap();

    assert_eq!(
        f.store.read_miniblock_candidate(&id, hash(1), 1).await.unwrap(),
        block(1)
    );
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn stale_candidates_are_rejected_and_future_ones_accepted(backend: Backend) {
    let f = open(backend).await;
    let id = stream(1);
    f.store.create_stream_storage(&id, block(0)).await.unwrap();
    promote_next(f.store.as_ref(), &id, 1, false, vec![]).await;

    let stale = f
        .store
        .write_block_proposal(&id, hash(7), 1, block(1))
        .await
        .unwrap_err();
    assert_eq!(stale.kind(), ErrorKind::StaleBlock);

    let genesis = f
        .store
        .write_block_proposal(&id, hash(7), 0, block(0))
        .await
        .unwrap_err();
    assert_eq!(genesis.kind(), ErrorKind::StaleBlock);

    f.store.write_block_proposal(&id, hash(5), 5, block(5)).await.unwrap();
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn carryover_opens_next_generation(backend: Backend) {
    let f = open(backend).await;
    let id = stream(1);
    f.store.create_stream_storage(&id, block(0)).await.unwrap();
    f.store.write_event(&id, 1, 0, event("1")).await.unwrap();
    f.store.write_event(&id, 1, 1, event("late")).await.unwrap();

    promote_next(f.store.as_ref(), &id, 1, false, vec![event("late")]).await;

    let read = f.store.read_stream_from_last_snapshot(&id, 0).await.unwrap();
    assert_eq!(read.minipool, vec![event("late")]);
    assert_eq!(read.last_miniblock_num(), 1);

    let old_generation = f.store.write_event(&id, 1, 1, event("x")).await.unwrap_err();
    assert_eq!(old_generation.kind(), ErrorKind::BadGeneration);
    f.store.write_event(&id, 2, 1, event("next")).await.unwrap();

    let read = f.store.read_stream_from_last_snapshot(&id, 0).await.unwrap();
    assert_eq!(read.minipool, vec![event("late"), event("next")]);
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn snapshot_pointer_bounds_reads(backend: Backend) {
    let f = open(backend).await;
    let id = stream(1);
    f.store.create_stream_storage(&id, block(0)).await.unwrap();
    promote_next(f.store.as_ref(), &id, 1, false, vec![]).await;
    promote_next(f.store.as_ref(), &id, 2, true, vec![]).await;
    promote_next(f.store.as_ref(), &id, 3, false, vec![]).await;

    let read = f.store.read_stream_from_last_snapshot(&id, 0).await.unwrap();
    assert_eq!(read.snapshot_miniblock_num, 2);
    assert_eq!(read.start_miniblock_num, 2);
    assert_eq!(read.miniblocks, vec![block(2), block(3)]);

    let read = f.store.read_stream_from_last_snapshot(&id, 1).await.unwrap();
    assert_eq!(read.start_miniblock_num, 1);
    assert_eq!(read.miniblocks.len(), 3);

    let read = f.store.read_stream_from_last_snapshot(&id, 100).await.unwrap();
    assert_eq!(read.start_miniblock_num, 0);
    assert_eq!(read.miniblocks.len(), 4);
}

// ============================================================================
// Administration
// ============================================================================

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn streams_can_be_listed_and_deleted(backend: Backend) {
    let f = open(backend).await;
    let (a, b) = (stream(1), stream(2));
    f.store.create_stream_storage(&a, block(0)).await.unwrap();
    f.store.create_stream_storage(&b, block(0)).await.unwrap();

    assert_eq!(f.store.get_streams().await.unwrap(), vec![a, b]);
    assert_eq!(f.store.get_streams_number().await.unwrap(), 2);

    f.store.delete_stream(&a).await.unwrap();
    assert_eq!(f.store.get_streams().await.unwrap(), vec![b]);
    assert_eq!(f.store.get_streams_number().await.unwrap(), 1);

    // A deleted stream can be created again from scratch.
    f.store.create_stream_storage(&a, block(0)).await.unwrap();
    let read = f.store.read_stream_from_last_snapshot(&a, 0).await.unwrap();
    assert_eq!(read.miniblocks, vec![block(0)]);
}

// ============================================================================
// SQLite-specific behavior
// ============================================================================

#[tokio::test]
async fn sqlite_data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("streams.db");
    let id = stream(1);

    let store = SqliteStreamStore::open(&path, quiet_pool(), None).await.unwrap();
    store.create_stream_storage(&id, block(0)).await.unwrap();
    store.write_event(&id, 1, 0, event("1")).await.unwrap();
    store.close().await;

    let store = SqliteStreamStore::open(&path, quiet_pool(), None).await.unwrap();
    let read = store.read_stream_from_last_snapshot(&id, 0).await.unwrap();
    assert_eq!(read.miniblocks, vec![block(0)]);
    assert_eq!(read.minipool, vec![event("1")]);
}

#[tokio::test]
async fn sqlite_second_owner_supersedes_first() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("streams.db");
    let (tx, mut rx) = mpsc::unbounded_channel();

    let first = SqliteStreamStore::open(&path, quiet_pool(), Some(tx))
        .await
        .unwrap();
    first.create_stream_storage(&stream(1), block(0)).await.unwrap();

    let second = SqliteStreamStore::open(&path, quiet_pool(), None).await.unwrap();

    let err = first.get_streams().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

    let notice = rx.try_recv().unwrap();
    assert_eq!(notice.current, first.node_uuid());
    assert_eq!(notice.found, vec![second.node_uuid().to_string()]);

    assert_eq!(second.get_streams().await.unwrap(), vec![stream(1)]);
}

#[tokio::test]
async fn sqlite_cleanup_releases_ownership() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStreamStore::open(dir.path().join("streams.db"), quiet_pool(), None)
        .await
        .unwrap();

    store.cleanup_storage().await.unwrap();

    let err = store.get_streams_number().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
}

async fn owner_markers(path: &std::path::Path) -> Vec<String> {
    let mut conn = SqliteConnectOptions::new()
        .filename(path)
        .connect()
        .await
        .unwrap();
    sqlx::query_scalar("SELECT uuid FROM singlenodekey")
        .fetch_all(&mut conn)
        .await
        .unwrap()
}

#[tokio::test]
async fn sqlite_close_keeps_ownership_until_released() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("streams.db");

    let kept = SqliteStreamStore::open(&path, quiet_pool(), None).await.unwrap();
    let uuid = kept.node_uuid().to_string();
    kept.close().await;
    assert_eq!(owner_markers(&path).await, vec![uuid]);

    let released = SqliteStreamStore::open(&path, quiet_pool(), None).await.unwrap();
    released.cleanup_storage().await.unwrap();
    released.close().await;
    assert!(owner_markers(&path).await.is_empty());
}

#[tokio::test]
async fn sqlite_detects_miniblock_gap() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("streams.db");
    let id = stream(1);

    let store = SqliteStreamStore::open(&path, quiet_pool(), None).await.unwrap();
    store.create_stream_storage(&id, block(0)).await.unwrap();
    promote_next(&store, &id, 1, false, vec![]).await;
    promote_next(&store, &id, 2, false, vec![]).await;

    let mut conn = SqliteConnectOptions::new()
        .filename(&path)
        .connect()
        .await
        .unwrap();
    sqlx::query(&format!(
        "DELETE FROM miniblocks_{} WHERE seq_num = 1",
        table_suffix(&id)
    ))
    .execute(&mut conn)
    .await
    .unwrap();

    let err = store.read_miniblocks(&id, 0, 3).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MiniblocksStorageFailure);
    let err = store.read_stream_from_last_snapshot(&id, 5).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MiniblocksStorageFailure);
}

#[tokio::test]
async fn sqlite_detects_minipool_slot_gap() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("streams.db");
    let id = stream(1);

    let store = SqliteStreamStore::open(&path, quiet_pool(), None).await.unwrap();
    store.create_stream_storage(&id, block(0)).await.unwrap();
    store.write_event(&id, 1, 0, event("1")).await.unwrap();
    store.write_event(&id, 1, 1, event("2")).await.unwrap();

    let mut conn = SqliteConnectOptions::new()
        .filename(&path)
        .connect()
        .await
        .unwrap();
    sqlx::query(&format!(
        "DELETE FROM minipools_{} WHERE slot_num = 0",
        table_suffix(&id)
    ))
    .execute(&mut conn)
    .await
    .unwrap();

    let err = store.read_stream_from_last_snapshot(&id, 0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MiniblocksStorageFailure);
    let err = store.write_event(&id, 1, 2, event("3")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MiniblocksStorageFailure);
}

// ============================================================================
// Property-Based Tests
// ============================================================================

proptest! {
    /// Property: any sequence of promotions with carryover leaves a gapless
    /// chain and a minipool at the next generation
    #[test]
    fn prop_promotions_stay_gapless(carryovers in prop::collection::vec(0usize..4, 1..8)) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let store = MemoryStreamStore::new();
            let id = stream(1);
            store.create_stream_storage(&id, block(0)).await.unwrap();

            let mut pool_len = 0u64;
            for (i, carry) in carryovers.iter().enumerate() {
                let generation = i as u64 + 1;
                store.write_event(&id, generation, pool_len, event("e")).await.unwrap();
                let carryover: Vec<Bytes> = (0..*carry).map(|c| event(&format!("c{c}"))).collect();
                pool_len = carryover.len() as u64;
                promote_next(&store, &id, generation, false, carryover).await;
            }

            let n = carryovers.len() as u64;
            let blocks = store.read_miniblocks(&id, 0, n + 1).await.unwrap();
            prop_assert_eq!(blocks, (0..=n).map(block).collect::<Vec<_>>());

            let read = store.read_stream_from_last_snapshot(&id, 0).await.unwrap();
            prop_assert_eq!(read.minipool.len() as u64, pool_len);
            store.write_event(&id, n + 1, pool_len, event("tail")).await.unwrap();
            Ok(())
        })?;
    }
}
