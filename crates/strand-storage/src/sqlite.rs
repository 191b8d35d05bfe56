//! Persistent stream store on SQLite.
//!
//! Every operation runs as one transaction through [`SqliteStreamStore::run_tx`],
//! which retries on `SQLITE_BUSY`/`SQLITE_LOCKED` with capped exponential
//! backoff. Each transaction first compares the single-row ownership marker
//! in `singlenodekey` with the one this process wrote at open; a mismatch
//! means another process has taken over the database and is reported on the
//! exit signal channel.

use std::{future::Future, path::Path, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use sqlx::{Row, SqliteConnection};
use strand_types::{Hash, StreamId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    ReadStreamResult, StreamStorage,
    error::{StorageError, StorageResult, Superseded},
    partition::{Partition, table_suffix},
    pool::{PoolConfig, StoreDb},
};

/// Channel on which the store reports loss of ownership.
pub type ExitSignal = mpsc::UnboundedSender<Superseded>;

const BACKOFF_BASE: Duration = Duration::from_millis(10);
const BACKOFF_CAP: Duration = Duration::from_secs(1);

/// SQLite-backed [`StreamStorage`].
#[derive(Debug)]
pub struct SqliteStreamStore {
    db: StoreDb,
    node_uuid: String,
    exit_signal: Option<ExitSignal>,
    shutdown: CancellationToken,
}

/// Stream record row plus the partition it names.
struct StreamRecord {
    partition: Partition,
    snapshot_miniblock: u64,
}

impl SqliteStreamStore {
    /// Opens the store at `path`, migrates the schema and claims ownership.
    ///
    /// Any marker left by a previous process is logged and replaced; that
    /// process will observe the change on its next transaction.
    pub async fn open(
        path: impl AsRef<Path>,
        config: PoolConfig,
        exit_signal: Option<ExitSignal>,
    ) -> StorageResult<Self> {
        let db = StoreDb::open(path.as_ref(), &config).await?;
        sqlx::migrate!("./migrations").run(&db.write_pool).await?;

        let store = Self {
            db,
            node_uuid: uuid::Uuid::new_v4().to_string(),
            exit_signal,
            shutdown: CancellationToken::new(),
        };
        store
            .run_tx("initialize_single_node_key", || store.claim_ownership_tx())
            .await?;

        if config.pool_stats_interval_secs > 0 {
            store.spawn_pool_stats(Duration::from_secs(config.pool_stats_interval_secs));
        }

        tracing::info!(node_uuid = %store.node_uuid, "stream store ready");
        Ok(store)
    }

    /// The ownership marker this process holds.
    pub fn node_uuid(&self) -> &str {
        &self.node_uuid
    }

    fn spawn_pool_stats(&self, interval: Duration) {
        let db = self.db.clone();
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => db.report_stats(),
                }
            }
        });
    }

    // ========================================================================
    // Transaction runner
    // ========================================================================

    async fn run_tx<T, F, Fut>(&self, name: &'static str, op: F) -> StorageResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    let delay = backoff_delay(attempt);
                    tracing::warn!(
                        op = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transaction conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(StorageError::Superseded(notice)) => {
                    tracing::error!(op = name, %notice, "stream store ownership lost");
                    if let Some(signal) = &self.exit_signal {
                        let _ = signal.send(notice.clone());
                    }
                    return Err(StorageError::Superseded(notice));
                }
                Err(e) => {
                    tracing::debug!(op = name, error = %e, "transaction failed");
                    return Err(e);
                }
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(op = name, attempts = attempt + 1, "transaction succeeded after retry");
                    }
                    return Ok(value);
                }
            }
        }
    }

    async fn check_owner(&self, conn: &mut SqliteConnection) -> StorageResult<()> {
        let found: Vec<String> = sqlx::query_scalar("SELECT uuid FROM singlenodekey")
            .fetch_all(&mut *conn)
            .await?;
        if found.len() == 1 && found[0] == self.node_uuid {
            return Ok(());
        }
        Err(StorageError::Superseded(Superseded {
            current: self.node_uuid.clone(),
            found,
        }))
    }

    async fn stream_record(
        conn: &mut SqliteConnection,
        stream_id: &StreamId,
    ) -> StorageResult<StreamRecord> {
        let row = sqlx::query(
            "SELECT latest_snapshot_miniblock, table_suffix FROM es WHERE stream_id = ?",
        )
        .bind(stream_id.as_bytes())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(StorageError::StreamNotFound(*stream_id))?;

        let snapshot: i64 = row.try_get(0)?;
        let suffix: String = row.try_get(1)?;
        Ok(StreamRecord {
            partition: Partition::from_suffix(&suffix),
            snapshot_miniblock: stored_num(stream_id, snapshot)?,
        })
    }

    async fn last_miniblock_num(
        conn: &mut SqliteConnection,
        stream_id: &StreamId,
        partition: &Partition,
    ) -> StorageResult<u64> {
        let max: Option<i64> =
            sqlx::query_scalar(&format!("SELECT MAX(seq_num) FROM {}", partition.miniblocks))
                .fetch_one(&mut *conn)
                .await?;
        let max =
            max.ok_or_else(|| StorageError::consistency(*stream_id, "stream has no miniblocks"))?;
        stored_num(stream_id, max)
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    async fn claim_ownership_tx(&self) -> StorageResult<()> {
        let mut tx = self.db.write_pool.begin().await?;

        let previous = sqlx::query("SELECT uuid, storage_connection_time, info FROM singlenodekey")
            .fetch_all(&mut *tx)
            .await?;
        for row in &previous {
            let uuid: String = row.try_get(0)?;
            let time: String = row.try_get(1)?;
            let info: String = row.try_get(2)?;
            tracing::info!(%uuid, %time, %info, "replacing previous stream store owner");
        }

        sqlx::query("DELETE FROM singlenodekey")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO singlenodekey (uuid, storage_connection_time, info) VALUES (?, ?, ?)",
        )
        .bind(&self.node_uuid)
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(process_info())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn create_stream_tx(&self, stream_id: &StreamId, genesis: &Bytes) -> StorageResult<()> {
        let mut tx = self.db.write_pool.begin().await?;
        self.check_owner(&mut tx).await?;

        let suffix = table_suffix(stream_id);
        let inserted = sqlx::query(
            "INSERT INTO es (stream_id, latest_snapshot_miniblock, table_suffix) VALUES (?, 0, ?)",
        )
        .bind(stream_id.as_bytes())
        .bind(&suffix)
        .execute(&mut *tx)
        .await;
        if let Err(sqlx::Error::Database(db)) = &inserted
            && db.is_unique_violation()
        {
            return Err(StorageError::AlreadyExists(*stream_id));
        }
        inserted?;

        let partition = Partition::from_suffix(&suffix);
        for statement in partition.create_statements() {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        sqlx::query(&format!(
            "INSERT INTO {} (seq_num, blockdata) VALUES (0, ?)",
            partition.miniblocks
        ))
        .bind(genesis.as_ref())
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "INSERT INTO {} (generation, slot_num, envelope) VALUES (1, -1, NULL)",
            partition.minipools
        ))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn read_from_last_snapshot_tx(
        &self,
        stream_id: &StreamId,
        preceding: u64,
    ) -> StorageResult<ReadStreamResult> {
        let mut tx = self.db.read_pool.begin().await?;
        self.check_owner(&mut tx).await?;
        let record = Self::stream_record(&mut tx, stream_id).await?;

        let start = record.snapshot_miniblock.saturating_sub(preceding);
        let rows = sqlx::query(&format!(
            "SELECT seq_num, blockdata FROM {} WHERE seq_num >= ? ORDER BY seq_num",
            record.partition.miniblocks
        ))
        .bind(sql_int(start))
        .fetch_all(&mut *tx)
        .await?;

        let miniblocks = consecutive_blocks(stream_id, start, &rows)?;
        if miniblocks.is_empty() {
            return Err(StorageError::consistency(
                *stream_id,
                format!("no miniblocks from {start}"),
            ));
        }
        let last = start + miniblocks.len() as u64 - 1;

        let pool_rows = sqlx::query(&format!(
            "SELECT generation, slot_num, envelope FROM {} ORDER BY generation, slot_num",
            record.partition.minipools
        ))
        .fetch_all(&mut *tx)
        .await?;

        let mut minipool = Vec::with_capacity(pool_rows.len().saturating_sub(1));
        let mut expected_slot: i64 = -1;
        for row in &pool_rows {
            let generation: i64 = row.try_get(0)?;
            let slot: i64 = row.try_get(1)?;
            if generation != sql_int(last + 1) {
                return Err(StorageError::consistency(
                    *stream_id,
                    format!("minipool generation {generation}, expected {}", last + 1),
                ));
            }
            if slot != expected_slot {
                return Err(StorageError::consistency(
                    *stream_id,
                    format!("minipool slot {slot}, expected {expected_slot}"),
                ));
            }
            if slot >= 0 {
                let envelope: Vec<u8> = row.try_get(2)?;
                minipool.push(Bytes::from(envelope));
            }
            expected_slot += 1;
        }
        if expected_slot == -1 {
            return Err(StorageError::consistency(*stream_id, "minipool sentinel missing"));
        }

        tx.commit().await?;
        Ok(ReadStreamResult {
            start_miniblock_num: start,
            snapshot_miniblock_num: record.snapshot_miniblock,
            miniblocks,
            minipool,
        })
    }

    async fn read_miniblocks_tx(
        &self,
        stream_id: &StreamId,
        from_inclusive: u64,
        to_exclusive: u64,
    ) -> StorageResult<Vec<Bytes>> {
        let mut tx = self.db.read_pool.begin().await?;
        self.check_owner(&mut tx).await?;
        let record = Self::stream_record(&mut tx, stream_id).await?;

        let rows = sqlx::query(&format!(
            "SELECT seq_num, blockdata FROM {} WHERE seq_num >= ? AND seq_num < ? ORDER BY seq_num",
            record.partition.miniblocks
        ))
        .bind(sql_int(from_inclusive))
        .bind(sql_int(to_exclusive))
        .fetch_all(&mut *tx)
        .await?;
        let blocks = consecutive_blocks(stream_id, from_inclusive, &rows)?;

        tx.commit().await?;
        Ok(blocks)
    }

    async fn write_event_tx(
        &self,
        stream_id: &StreamId,
        expected_generation: u64,
        expected_slot: u64,
        envelope: &Bytes,
    ) -> StorageResult<()> {
        let mut tx = self.db.write_pool.begin().await?;
        self.check_owner(&mut tx).await?;
        let record = Self::stream_record(&mut tx, stream_id).await?;

        let rows = sqlx::query(&format!(
            "SELECT generation, slot_num FROM {} ORDER BY slot_num",
            record.partition.minipools
        ))
        .fetch_all(&mut *tx)
        .await?;

        let mut counter: i64 = -1;
        for row in &rows {
            let generation: i64 = row.try_get(0)?;
            let slot: i64 = row.try_get(1)?;
            if generation != sql_int(expected_generation) {
                return Err(StorageError::GenerationMismatch {
                    stream_id: *stream_id,
                    expected: expected_generation,
                    actual: stored_num(stream_id, generation)?,
                });
            }
            if slot != counter {
                return Err(StorageError::consistency(
                    *stream_id,
                    format!("minipool slot {slot}, expected {counter}"),
                ));
            }
            counter += 1;
        }
        if rows.is_empty() {
            return Err(StorageError::consistency(*stream_id, "minipool sentinel missing"));
        }
        if counter != sql_int(expected_slot) {
            return Err(StorageError::SlotMismatch {
                stream_id: *stream_id,
                expected: expected_slot,
                actual: stored_num(stream_id, counter)?,
            });
        }

        sqlx::query(&format!(
            "INSERT INTO {} (generation, slot_num, envelope) VALUES (?, ?, ?)",
            record.partition.minipools
        ))
        .bind(sql_int(expected_generation))
        .bind(sql_int(expected_slot))
        .bind(envelope.as_ref())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn write_block_proposal_tx(
        &self,
        stream_id: &StreamId,
        candidate_hash: Hash,
        block_number: u64,
        block: &Bytes,
    ) -> StorageResult<()> {
        let mut tx = self.db.write_pool.begin().await?;
        self.check_owner(&mut tx).await?;
        let record = Self::stream_record(&mut tx, stream_id).await?;

        let last = Self::last_miniblock_num(&mut tx, stream_id, &record.partition).await?;
        if block_number < last + 1 {
            return Err(StorageError::StaleCandidate {
                stream_id: *stream_id,
                block_number,
                open_generation: last + 1,
            });
        }

        sqlx::query(&format!(
            "INSERT OR IGNORE INTO {} (seq_num, block_hash, blockdata) VALUES (?, ?, ?)",
            record.partition.candidates
        ))
        .bind(sql_int(block_number))
        .bind(candidate_hash.as_ref())
        .bind(block.as_ref())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn read_candidate_tx(
        &self,
        stream_id: &StreamId,
        candidate_hash: Hash,
        block_number: u64,
    ) -> StorageResult<Bytes> {
        let mut tx = self.db.read_pool.begin().await?;
        self.check_owner(&mut tx).await?;
        let record = Self::stream_record(&mut tx, stream_id).await?;

        let block: Vec<u8> = sqlx::query_scalar(&format!(
            "SELECT blockdata FROM {} WHERE seq_num = ? AND block_hash = ?",
            record.partition.candidates
        ))
        .bind(sql_int(block_number))
        .bind(candidate_hash.as_ref())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StorageError::CandidateNotFound {
            stream_id: *stream_id,
            hash: candidate_hash,
            block_number,
        })?;

        tx.commit().await?;
        Ok(Bytes::from(block))
    }

    async fn promote_block_tx(
        &self,
        stream_id: &StreamId,
        generation: u64,
        candidate_hash: Hash,
        is_snapshot: bool,
        carryover: &[Bytes],
    ) -> StorageResult<()> {
        let mut tx = self.db.write_pool.begin().await?;
        self.check_owner(&mut tx).await?;
        let record = Self::stream_record(&mut tx, stream_id).await?;
        let partition = &record.partition;

        let last = Self::last_miniblock_num(&mut tx, stream_id, partition).await?;
        if last + 1 != generation {
            return Err(StorageError::GenerationMismatch {
                stream_id: *stream_id,
                expected: generation,
                actual: last + 1,
            });
        }

        let block: Vec<u8> = sqlx::query_scalar(&format!(
            "SELECT blockdata FROM {} WHERE seq_num = ? AND block_hash = ?",
            partition.candidates
        ))
        .bind(sql_int(generation))
        .bind(candidate_hash.as_ref())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StorageError::CandidateNotFound {
            stream_id: *stream_id,
            hash: candidate_hash,
            block_number: generation,
        })?;

        let sentinel: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT generation FROM {} WHERE slot_num = -1",
            partition.minipools
        ))
        .fetch_optional(&mut *tx)
        .await?;
        if sentinel != Some(sql_int(generation)) {
            return Err(StorageError::consistency(
                *stream_id,
                format!("minipool sentinel at generation {sentinel:?}, expected {generation}"),
            ));
        }

        sqlx::query(&format!("DELETE FROM {} WHERE slot_num > -1", partition.minipools))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "UPDATE {} SET generation = ? WHERE slot_num = -1",
            partition.minipools
        ))
        .bind(sql_int(generation + 1))
        .execute(&mut *tx)
        .await?;

        if is_snapshot {
            sqlx::query("UPDATE es SET latest_snapshot_miniblock = ? WHERE stream_id = ?")
                .bind(sql_int(generation))
                .bind(stream_id.as_bytes())
                .execute(&mut *tx)
                .await?;
        }

        let insert_slot = format!(
            "INSERT INTO {} (generation, slot_num, envelope) VALUES (?, ?, ?)",
            partition.minipools
        );
        for (slot, envelope) in carryover.iter().enumerate() {
            sqlx::query(&insert_slot)
                .bind(sql_int(generation + 1))
                .bind(sql_int(slot as u64))
                .bind(envelope.as_ref())
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(&format!(
            "INSERT INTO {} (seq_num, blockdata) VALUES (?, ?)",
            partition.miniblocks
        ))
        .bind(sql_int(generation))
        .bind(block)
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!("DELETE FROM {} WHERE seq_num <= ?", partition.candidates))
            .bind(sql_int(generation))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_last_miniblock_number_tx(&self, stream_id: &StreamId) -> StorageResult<u64> {
        let mut tx = self.db.read_pool.begin().await?;
        self.check_owner(&mut tx).await?;
        let record = Self::stream_record(&mut tx, stream_id).await?;
        let last = Self::last_miniblock_num(&mut tx, stream_id, &record.partition).await?;
        tx.commit().await?;
        Ok(last)
    }

    async fn delete_stream_tx(&self, stream_id: &StreamId) -> StorageResult<()> {
        let mut tx = self.db.write_pool.begin().await?;
        self.check_owner(&mut tx).await?;
        let record = Self::stream_record(&mut tx, stream_id).await?;

        for statement in record.partition.drop_statements() {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        sqlx::query("DELETE FROM es WHERE stream_id = ?")
            .bind(stream_id.as_bytes())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_streams_tx(&self) -> StorageResult<Vec<StreamId>> {
        let mut tx = self.db.read_pool.begin().await?;
        self.check_owner(&mut tx).await?;

        let raw: Vec<Vec<u8>> = sqlx::query_scalar("SELECT stream_id FROM es ORDER BY stream_id")
            .fetch_all(&mut *tx)
            .await?;
        let ids = raw
            .iter()
            .map(|bytes| {
                StreamId::from_bytes(bytes)
                    .map_err(|e| StorageError::internal(format!("stored stream id: {e}")))
            })
            .collect::<StorageResult<Vec<_>>>()?;

        tx.commit().await?;
        Ok(ids)
    }

    async fn get_streams_number_tx(&self) -> StorageResult<usize> {
        let mut tx = self.db.read_pool.begin().await?;
        self.check_owner(&mut tx).await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM es")
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(count as usize)
    }
}

#[async_trait]
impl StreamStorage for SqliteStreamStore {
    async fn create_stream_storage(
        &self,
        stream_id: &StreamId,
        genesis: Bytes,
    ) -> StorageResult<()> {
        let genesis = &genesis;
        self.run_tx("create_stream_storage", move || {
            self.create_stream_tx(stream_id, genesis)
        })
        .await
    }

    async fn read_stream_from_last_snapshot(
        &self,
        stream_id: &StreamId,
        preceding: u64,
    ) -> StorageResult<ReadStreamResult> {
        self.run_tx("read_stream_from_last_snapshot", move || {
            self.read_from_last_snapshot_tx(stream_id, preceding)
        })
        .await
    }

    async fn read_miniblocks(
        &self,
        stream_id: &StreamId,
        from_inclusive: u64,
        to_exclusive: u64,
    ) -> StorageResult<Vec<Bytes>> {
        self.run_tx("read_miniblocks", move || {
            self.read_miniblocks_tx(stream_id, from_inclusive, to_exclusive)
        })
        .await
    }

    async fn write_event(
        &self,
        stream_id: &StreamId,
        expected_generation: u64,
        expected_slot: u64,
        envelope: Bytes,
    ) -> StorageResult<()> {
        let envelope = &envelope;
        self.run_tx("write_event", move || {
            self.write_event_tx(stream_id, expected_generation, expected_slot, envelope)
        })
        .await
    }

    async fn write_block_proposal(
        &self,
        stream_id: &StreamId,
        candidate_hash: Hash,
        block_number: u64,
        block: Bytes,
    ) -> StorageResult<()> {
        let block = &block;
        self.run_tx("write_block_proposal", move || {
            self.write_block_proposal_tx(stream_id, candidate_hash, block_number, block)
        })
        .await
    }

    async fn read_miniblock_candidate(
        &self,
        stream_id: &StreamId,
        candidate_hash: Hash,
        block_number: u64,
    ) -> StorageResult<Bytes> {
        self.run_tx("read_miniblock_candidate", move || {
            self.read_candidate_tx(stream_id, candidate_hash, block_number)
        })
        .await
    }

    async fn promote_block(
        &self,
        stream_id: &StreamId,
        generation: u64,
        candidate_hash: Hash,
        is_snapshot: bool,
        carryover: Vec<Bytes>,
    ) -> StorageResult<()> {
        let carryover = carryover.as_slice();
        self.run_tx("promote_block", move || {
            self.promote_block_tx(stream_id, generation, candidate_hash, is_snapshot, carryover)
        })
        .await
    }

    async fn get_last_miniblock_number(&self, stream_id: &StreamId) -> StorageResult<u64> {
        self.run_tx("get_last_miniblock_number", move || {
            self.get_last_miniblock_number_tx(stream_id)
        })
        .await
    }

    async fn delete_stream(&self, stream_id: &StreamId) -> StorageResult<()> {
        self.run_tx("delete_stream", move || self.delete_stream_tx(stream_id))
            .await
    }

    async fn get_streams(&self) -> StorageResult<Vec<StreamId>> {
        self.run_tx("get_streams", || self.get_streams_tx()).await
    }

    async fn get_streams_number(&self) -> StorageResult<usize> {
        self.run_tx("get_streams_number", || self.get_streams_number_tx())
            .await
    }

    async fn cleanup_storage(&self) -> StorageResult<()> {
        sqlx::query("DELETE FROM singlenodekey WHERE uuid = ?")
            .bind(&self.node_uuid)
            .execute(&self.db.write_pool)
            .await?;
        tracing::info!(node_uuid = %self.node_uuid, "stream store ownership released");
        Ok(())
    }

    async fn close(&self) {
        self.shutdown.cancel();
        self.db.close().await;
        tracing::info!(node_uuid = %self.node_uuid, "stream store closed");
    }
}

/// Collects block rows, failing unless they run consecutively from `start`.
fn consecutive_blocks(
    stream_id: &StreamId,
    start: u64,
    rows: &[sqlx::sqlite::SqliteRow],
) -> StorageResult<Vec<Bytes>> {
    let mut blocks = Vec::with_capacity(rows.len());
    for (offset, row) in rows.iter().enumerate() {
        let seq: i64 = row.try_get(0)?;
        let expected = start + offset as u64;
        if seq != sql_int(expected) {
            return Err(StorageError::consistency(
                *stream_id,
                format!("miniblock gap: found {seq}, expected {expected}"),
            ));
        }
        let data: Vec<u8> = row.try_get(1)?;
        blocks.push(Bytes::from(data));
    }
    Ok(blocks)
}

/// Block, generation and slot numbers as SQLite integers. Values past
/// `i64::MAX` clamp, so an open-ended upper bound still means "all".
fn sql_int(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn stored_num(stream_id: &StreamId, n: i64) -> StorageResult<u64> {
    u64::try_from(n)
        .map_err(|_| StorageError::consistency(*stream_id, format!("negative stored number {n}")))
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << attempt.min(10));
    let capped = exp.min(BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 2);
    capped + Duration::from_millis(jitter)
}

fn process_info() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    format!("hostname={host}, pid={}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let first = backoff_delay(1);
        assert!(first >= Duration::from_millis(20));
        assert!(first <= Duration::from_millis(30));

        let late = backoff_delay(30);
        assert!(late >= BACKOFF_CAP);
        assert!(late <= BACKOFF_CAP + BACKOFF_CAP / 2);
    }

    #[test]
    fn process_info_names_pid() {
        assert!(process_info().contains(&format!("pid={}", std::process::id())));
    }
}
