//! Minute-bar storage
//!
//! `BarStore` is the sink's only view of the database. A write carries a
//! merged batch and its `BatchId`; the store applies the batch at most once,
//! recording the id in a ledger table inside the same transaction as the
//! upsert. The upsert itself is a merge, so bars from different batches for
//! the same `(symbol, ts)` combine exactly like `MinuteBar::merge`.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info};
use types::bar::{BarKey, MinuteBar};
use types::errors::StoreError;
use types::ids::{BatchId, Symbol};
use types::time::nanos_to_datetime;

use crate::config::PersistenceConfig;

/// What happened to a batch handed to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Bars merged into the table.
    Applied { rows: usize },
    /// The ledger already holds this batch id; nothing was written.
    AlreadyApplied,
}

#[async_trait]
pub trait BarStore: Send + Sync {
    /// Merge `bars` into storage unless `batch_id` was applied before.
    async fn upsert_bars(&self, batch_id: BatchId, bars: &[MinuteBar]) -> Result<UpsertOutcome, StoreError>;
}

#[async_trait]
impl<S: BarStore + ?Sized> BarStore for Arc<S> {
    async fn upsert_bars(&self, batch_id: BatchId, bars: &[MinuteBar]) -> Result<UpsertOutcome, StoreError> {
        (**self).upsert_bars(batch_id, bars).await
    }
}

// ── Postgres ────────────────────────────────────────────────────────

const BAR_COLUMNS: [&str; 10] = [
    "symbol",
    "ts",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "open_ts",
    "close_ts",
    "tick_count",
];

/// Rows per INSERT, keeping bind parameters under the protocol limit of 65535.
const ROWS_PER_STATEMENT: usize = 5000;

/// `INSERT INTO <table> (<columns>) ` prefix for the bulk upsert.
pub fn build_insert_prefix(table: &str) -> String {
    format!("INSERT INTO {} ({}) ", table, BAR_COLUMNS.join(", "))
}

/// Conflict clause merging an incoming row into the stored one.
///
/// Every right-hand side reads the pre-update row, so `open`/`open_ts` and
/// `close`/`close_ts` are decided against the same stored timestamps.
pub fn build_conflict_clause(table: &str) -> String {
    let t = table;
    format!(
        " ON CONFLICT (symbol, ts) DO UPDATE SET \
         open = CASE WHEN EXCLUDED.open_ts < {t}.open_ts \
         OR (EXCLUDED.open_ts = {t}.open_ts AND EXCLUDED.open < {t}.open) \
         THEN EXCLUDED.open ELSE {t}.open END, \
         open_ts = LEAST({t}.open_ts, EXCLUDED.open_ts), \
         high = GREATEST({t}.high, EXCLUDED.high), \
         low = LEAST({t}.low, EXCLUDED.low), \
         close = CASE WHEN EXCLUDED.close_ts > {t}.close_ts \
         OR (EXCLUDED.close_ts = {t}.close_ts AND EXCLUDED.close > {t}.close) \
         THEN EXCLUDED.close ELSE {t}.close END, \
         close_ts = GREATEST({t}.close_ts, EXCLUDED.close_ts), \
         volume = {t}.volume + EXCLUDED.volume, \
         tick_count = {t}.tick_count + EXCLUDED.tick_count"
    )
}

/// Ledger insert; affects zero rows when the batch was applied before.
pub fn build_ledger_sql(ledger_table: &str) -> String {
    format!(
        "INSERT INTO {ledger_table} (batch_id, bar_count) VALUES ($1, $2) \
         ON CONFLICT (batch_id) DO NOTHING"
    )
}

/// DDL for local runs; production schema is managed outside this service.
pub fn build_schema_sql(table: &str, ledger_table: &str) -> [String; 2] {
    [
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                symbol TEXT NOT NULL,
                ts TIMESTAMPTZ NOT NULL,
                open NUMERIC NOT NULL,
                high NUMERIC NOT NULL,
                low NUMERIC NOT NULL,
                close NUMERIC NOT NULL,
                volume NUMERIC NOT NULL,
                open_ts BIGINT NOT NULL,
                close_ts BIGINT NOT NULL,
                tick_count BIGINT NOT NULL,
                PRIMARY KEY (symbol, ts)
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {ledger_table} (
                batch_id UUID PRIMARY KEY,
                bar_count INTEGER NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        ),
    ]
}

fn push_bar_rows<'a>(builder: &mut QueryBuilder<'a, Postgres>, bars: &'a [MinuteBar]) {
    builder.push_values(bars, |mut row, bar| {
        row.push_bind(bar.symbol.as_str())
            .push_bind(nanos_to_datetime(bar.minute))
            .push_bind(bar.open.as_decimal())
            .push_bind(bar.high.as_decimal())
            .push_bind(bar.low.as_decimal())
            .push_bind(bar.close.as_decimal())
            .push_bind(bar.volume.as_decimal())
            .push_bind(bar.open_ts)
            .push_bind(bar.close_ts)
            .push_bind(i64::try_from(bar.tick_count).unwrap_or(i64::MAX));
    });
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db) => StoreError::Rejected(db.to_string()),
        other => StoreError::Unavailable(other.to_string()),
    }
}

/// Postgres-backed store over a bounded pool.
pub struct PgBarStore {
    pool: PgPool,
    table: String,
    ledger_table: String,
}

impl PgBarStore {
    /// Build a pool that connects on first use.
    ///
    /// Must be called inside the runtime that will drive the store.
    pub fn connect_lazy(config: &PersistenceConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy(&config.database_url)
            .map_err(map_sqlx)?;

        info!(
            pool_size = config.pool_size,
            table = %config.table,
            "PgBarStore initialized"
        );

        Ok(Self {
            pool,
            table: config.table.clone(),
            ledger_table: config.ledger_table.clone(),
        })
    }

    /// Create the bar and ledger tables if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for ddl in build_schema_sql(&self.table, &self.ledger_table) {
            sqlx::query(&ddl).execute(&self.pool).await.map_err(map_sqlx)?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BarStore for PgBarStore {
    async fn upsert_bars(&self, batch_id: BatchId, bars: &[MinuteBar]) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let ledger = sqlx::query(&build_ledger_sql(&self.ledger_table))
            .bind(*batch_id.as_uuid())
            .bind(i32::try_from(bars.len()).unwrap_or(i32::MAX))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        if ledger.rows_affected() == 0 {
            tx.rollback().await.map_err(map_sqlx)?;
            debug!(batch_id = %batch_id, "Batch already applied");
            return Ok(UpsertOutcome::AlreadyApplied);
        }

        let prefix = build_insert_prefix(&self.table);
        let conflict = build_conflict_clause(&self.table);
        for chunk in bars.chunks(ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(prefix.as_str());
            push_bar_rows(&mut builder, chunk);
            builder.push(conflict.as_str());
            builder.build().execute(&mut *tx).await.map_err(map_sqlx)?;
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(UpsertOutcome::Applied { rows: bars.len() })
    }
}

// ── In-memory ───────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    bars: BTreeMap<BarKey, MinuteBar>,
    applied: HashSet<BatchId>,
}

/// In-process store with the same merge and ledger semantics as Postgres.
///
/// Failures and latency can be injected to exercise the sink's retry and
/// shutdown paths.
#[derive(Default)]
pub struct MemoryBarStore {
    state: Mutex<MemoryState>,
    fail_next: AtomicU32,
    latency_ms: AtomicU64,
    calls: AtomicU64,
}

impl MemoryBarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with `StoreError::Unavailable`.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Delay every call by `latency` before it takes effect.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Total calls, including failed ones.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn bar(&self, symbol: &Symbol, minute: i64) -> Option<MinuteBar> {
        let state = self.state.lock().ok()?;
        state.bars.get(&(symbol.clone(), minute)).cloned()
    }

    /// All stored bars in key order.
    pub fn bars(&self) -> Vec<MinuteBar> {
        self.state
            .lock()
            .map(|state| state.bars.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn applied_batches(&self) -> usize {
        self.state.lock().map(|state| state.applied.len()).unwrap_or(0)
    }
}

#[async_trait]
impl BarStore for MemoryBarStore {
    async fn upsert_bars(&self, batch_id: BatchId, bars: &[MinuteBar]) -> Result<UpsertOutcome, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }

        let mut state = self
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("store state poisoned".to_string()))?;

        if state.applied.contains(&batch_id) {
            return Ok(UpsertOutcome::AlreadyApplied);
        }

        // Stage every merge first so a rejected row leaves the store untouched.
        let mut staged: BTreeMap<BarKey, MinuteBar> = BTreeMap::new();
        for bar in bars {
            let key = bar.key();
            if let Some(pending) = staged.get_mut(&key) {
                pending.merge(bar).map_err(|e| StoreError::Rejected(e.to_string()))?;
                continue;
            }
            let next = match state.bars.get(&key) {
                Some(stored) => {
                    let mut next = stored.clone();
                    next.merge(bar).map_err(|e| StoreError::Rejected(e.to_string()))?;
                    next
                }
                None => bar.clone(),
            };
            staged.insert(key, next);
        }

        state.applied.insert(batch_id);
        state.bars.extend(staged);
        Ok(UpsertOutcome::Applied { rows: bars.len() })
    }
}
