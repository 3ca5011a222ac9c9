// Derived cell values for spreadsheet resources.
//
// External consumers (boards embedding a sheet total, exports) read cell
// values without opening a live sync session. Rows come into being only
// through the authenticated ensure call; the trusted batch path patches
// existing rows and silently drops the rest, so a lagging writer cannot
// resurrect a retired reference.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cowrite_common::doc::ReplicatedDoc;
use cowrite_common::protocol::RoomId;
use cowrite_common::sheet::{read_range, CellRange};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::{debug, info_span, warn, Instrument};

use crate::snapshot::{SnapshotStore, StoreFuture};

/// Value stored by ensure before the first population pass runs.
pub const PLACEHOLDER_VALUE: &str = "[]";

/// One tracked cell value row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellRow {
    pub value_json: String,
    pub updated_at: DateTime<Utc>,
}

/// Result of a conditional write against one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// No row exists for this reference; nothing was written.
    Missing,
    /// The stored value already matched; nothing was written.
    Unchanged,
    Patched,
}

pub trait CellValueStore: Send + Sync {
    /// Create the row if absent. Returns true when a row was created.
    fn ensure<'a>(
        &'a self,
        resource_id: &'a str,
        cell_ref: &'a str,
        value_json: &'a str,
    ) -> StoreFuture<'a, bool>;

    fn get<'a>(&'a self, resource_id: &'a str, cell_ref: &'a str)
        -> StoreFuture<'a, Option<CellRow>>;

    /// Write `value_json` only when the row exists and the value differs.
    fn patch_if_changed<'a>(
        &'a self,
        resource_id: &'a str,
        cell_ref: &'a str,
        value_json: &'a str,
    ) -> StoreFuture<'a, WriteOutcome>;
}

/// In-memory store used when no database is configured, and in tests.
#[derive(Default)]
pub struct MemoryCellStore {
    rows: RwLock<HashMap<(String, String), CellRow>>,
}

impl MemoryCellStore {
    pub fn new() -> MemoryCellStore {
        MemoryCellStore::default()
    }
}

impl CellValueStore for MemoryCellStore {
    fn ensure<'a>(
        &'a self,
        resource_id: &'a str,
        cell_ref: &'a str,
        value_json: &'a str,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut rows = self.rows.write().await;
            let key = (resource_id.to_owned(), cell_ref.to_owned());
            if rows.contains_key(&key) {
                return Ok(false);
            }
            rows.insert(key, CellRow { value_json: value_json.to_owned(), updated_at: Utc::now() });
            Ok(true)
        })
    }

    fn get<'a>(
        &'a self,
        resource_id: &'a str,
        cell_ref: &'a str,
    ) -> StoreFuture<'a, Option<CellRow>> {
        Box::pin(async move {
            let rows = self.rows.read().await;
            Ok(rows.get(&(resource_id.to_owned(), cell_ref.to_owned())).cloned())
        })
    }

    fn patch_if_changed<'a>(
        &'a self,
        resource_id: &'a str,
        cell_ref: &'a str,
        value_json: &'a str,
    ) -> StoreFuture<'a, WriteOutcome> {
        Box::pin(async move {
            let mut rows = self.rows.write().await;
            match rows.get_mut(&(resource_id.to_owned(), cell_ref.to_owned())) {
                None => Ok(WriteOutcome::Missing),
                Some(row) if row.value_json == value_json => Ok(WriteOutcome::Unchanged),
                Some(row) => {
                    row.value_json = value_json.to_owned();
                    row.updated_at = Utc::now();
                    Ok(WriteOutcome::Patched)
                }
            }
        })
    }
}

/// Postgres-backed store over the `cell_cache` table.
pub struct PgCellStore {
    pool: PgPool,
}

impl PgCellStore {
    pub fn new(pool: PgPool) -> PgCellStore {
        PgCellStore { pool }
    }
}

impl CellValueStore for PgCellStore {
    fn ensure<'a>(
        &'a self,
        resource_id: &'a str,
        cell_ref: &'a str,
        value_json: &'a str,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                "INSERT INTO cell_cache (resource_id, cell_ref, value, updated_at) \
                 VALUES ($1, $2, $3, now()) \
                 ON CONFLICT (resource_id, cell_ref) DO NOTHING",
            )
            .bind(resource_id)
            .bind(cell_ref)
            .bind(value_json)
            .execute(&self.pool)
            .instrument(info_span!("relay.db.query", query = "cell_cache.ensure"))
            .await
            .context("failed to ensure cell row")?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn get<'a>(
        &'a self,
        resource_id: &'a str,
        cell_ref: &'a str,
    ) -> StoreFuture<'a, Option<CellRow>> {
        Box::pin(async move {
            let row: Option<(String, DateTime<Utc>)> = sqlx::query_as(
                "SELECT value, updated_at FROM cell_cache \
                 WHERE resource_id = $1 AND cell_ref = $2",
            )
            .bind(resource_id)
            .bind(cell_ref)
            .fetch_optional(&self.pool)
            .instrument(info_span!("relay.db.query", query = "cell_cache.get"))
            .await
            .context("failed to load cell row")?;

            Ok(row.map(|(value_json, updated_at)| CellRow { value_json, updated_at }))
        })
    }

    fn patch_if_changed<'a>(
        &'a self,
        resource_id: &'a str,
        cell_ref: &'a str,
        value_json: &'a str,
    ) -> StoreFuture<'a, WriteOutcome> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE cell_cache SET value = $3, updated_at = now() \
                 WHERE resource_id = $1 AND cell_ref = $2 AND value <> $3",
            )
            .bind(resource_id)
            .bind(cell_ref)
            .bind(value_json)
            .execute(&self.pool)
            .instrument(info_span!("relay.db.query", query = "cell_cache.patch"))
            .await
            .context("failed to patch cell row")?;

            if result.rows_affected() == 1 {
                return Ok(WriteOutcome::Patched);
            }

            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM cell_cache \
                 WHERE resource_id = $1 AND cell_ref = $2)",
            )
            .bind(resource_id)
            .bind(cell_ref)
            .fetch_one(&self.pool)
            .instrument(info_span!("relay.db.query", query = "cell_cache.exists"))
            .await
            .context("failed to probe cell row")?;

            Ok(if exists { WriteOutcome::Unchanged } else { WriteOutcome::Missing })
        })
    }
}

/// One entry in a trusted batch write.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellUpdate {
    pub cell_ref: String,
    pub values: Vec<Vec<String>>,
}

/// Tally of a batch write.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub patched: usize,
    pub unchanged: usize,
    /// Updates for references no one has ensured.
    pub dropped: usize,
    /// Updates whose reference failed to parse.
    pub invalid: usize,
    /// Updates whose write failed at the store.
    pub failed: usize,
}

/// Result of registering a reference for tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsureOutcome {
    /// Canonical form of the requested reference; the cache key.
    pub cell_ref: String,
    pub created: bool,
}

/// Coordinates the derived value store with the durable snapshots feeding it.
#[derive(Clone)]
pub struct CellCache {
    store: Arc<dyn CellValueStore>,
    snapshots: Arc<dyn SnapshotStore>,
}

impl CellCache {
    pub fn new(store: Arc<dyn CellValueStore>, snapshots: Arc<dyn SnapshotStore>) -> CellCache {
        CellCache { store, snapshots }
    }

    /// Register `range` for tracking and return its canonical key.
    ///
    /// The row appears immediately with a placeholder value; a background
    /// pass fills it from the latest durable snapshot.
    pub async fn ensure(&self, room: &RoomId, range: CellRange) -> Result<EnsureOutcome> {
        let cell_ref = range.canonical();
        let created = self.store.ensure(room.resource_id(), &cell_ref, PLACEHOLDER_VALUE).await?;

        let cache = self.clone();
        let room = room.clone();
        tokio::spawn(async move {
            if let Err(error) = cache.refresh(&room, range).await {
                warn!(room = %room, cell_ref = %range.canonical(), %error, "cell population failed");
            }
        });

        Ok(EnsureOutcome { cell_ref, created })
    }

    /// Recompute one tracked reference from the latest durable snapshot.
    ///
    /// When the room has never been persisted the placeholder is left in
    /// place; there is no state to derive values from yet.
    pub async fn refresh(&self, room: &RoomId, range: CellRange) -> Result<WriteOutcome> {
        let room_key = room.to_string();
        let Some(snapshot) = self.snapshots.load(&room_key).await? else {
            debug!(room = %room_key, cell_ref = %range.canonical(), "no durable snapshot yet");
            return Ok(WriteOutcome::Unchanged);
        };

        let doc = ReplicatedDoc::from_snapshot(&snapshot.payload)
            .context("stored snapshot failed to decode")?;
        let matrix = read_range(doc.inner(), &range);
        let value_json =
            serde_json::to_string(&matrix).context("cell matrix failed to serialize")?;

        let outcome =
            self.store.patch_if_changed(room.resource_id(), &range.canonical(), &value_json).await?;
        if outcome == WriteOutcome::Missing {
            debug!(room = %room_key, cell_ref = %range.canonical(), "refresh hit untracked reference");
        }
        Ok(outcome)
    }

    /// Apply a trusted batch of computed values. Writes never create rows;
    /// updates for untracked references are dropped.
    pub async fn apply_batch(&self, room: &RoomId, updates: &[CellUpdate]) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for update in updates {
            let range = match CellRange::parse(&update.cell_ref) {
                Ok(range) => range,
                Err(error) => {
                    debug!(room = %room, cell_ref = %update.cell_ref, %error, "dropping unparseable reference");
                    summary.invalid += 1;
                    continue;
                }
            };
            let value_json = match serde_json::to_string(&update.values) {
                Ok(json) => json,
                Err(error) => {
                    warn!(room = %room, cell_ref = %update.cell_ref, %error, "dropping unserializable value");
                    summary.invalid += 1;
                    continue;
                }
            };
            match self
                .store
                .patch_if_changed(room.resource_id(), &range.canonical(), &value_json)
                .await
            {
                Ok(WriteOutcome::Patched) => summary.patched += 1,
                Ok(WriteOutcome::Unchanged) => summary.unchanged += 1,
                Ok(WriteOutcome::Missing) => {
                    debug!(room = %room, cell_ref = %range.canonical(), "dropping update for untracked reference");
                    summary.dropped += 1;
                }
                Err(error) => {
                    warn!(room = %room, cell_ref = %range.canonical(), %error, "cell write failed");
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use cowrite_common::protocol::ResourceType;
    use cowrite_common::sheet::{set_row, SheetCell};

    use crate::snapshot::MemorySnapshotStore;

    use super::*;

    fn room() -> RoomId {
        RoomId::new(ResourceType::Spreadsheet, "s1")
    }

    fn cache_with_stores() -> (CellCache, Arc<MemoryCellStore>, Arc<MemorySnapshotStore>) {
        let store = Arc::new(MemoryCellStore::new());
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let cache = CellCache::new(store.clone(), snapshots.clone());
        (cache, store, snapshots)
    }

    fn range(raw: &str) -> CellRange {
        CellRange::parse(raw).expect("test reference should parse")
    }

    async fn persist_sheet(snapshots: &MemorySnapshotStore, version: u64, rows: &[&[SheetCell]]) {
        let doc = ReplicatedDoc::new();
        for (index, cells) in rows.iter().enumerate() {
            set_row(doc.inner(), index as u32, cells);
        }
        snapshots
            .persist(&room().to_string(), version, &doc.encode_snapshot())
            .await
            .expect("persist");
    }

    #[tokio::test]
    async fn memory_store_ensure_is_create_only() {
        let store = MemoryCellStore::new();
        assert!(store.ensure("s1", "A1", PLACEHOLDER_VALUE).await.expect("ensure"));
        assert!(!store.ensure("s1", "A1", "something else").await.expect("ensure again"));

        let row = store.get("s1", "A1").await.expect("get").expect("present");
        assert_eq!(row.value_json, PLACEHOLDER_VALUE);
    }

    #[tokio::test]
    async fn patch_missing_reference_is_dropped() {
        let store = MemoryCellStore::new();
        let outcome = store.patch_if_changed("s1", "A1", "[]").await.expect("patch");
        assert_eq!(outcome, WriteOutcome::Missing);
        assert_eq!(store.get("s1", "A1").await.expect("get"), None);
    }

    #[tokio::test]
    async fn identical_patch_reports_unchanged_and_keeps_timestamp() {
        let store = MemoryCellStore::new();
        store.ensure("s1", "A1", "[[\"5\"]]").await.expect("ensure");
        let before = store.get("s1", "A1").await.expect("get").expect("present");

        let outcome = store.patch_if_changed("s1", "A1", "[[\"5\"]]").await.expect("patch");
        assert_eq!(outcome, WriteOutcome::Unchanged);

        let after = store.get("s1", "A1").await.expect("get").expect("present");
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[tokio::test]
    async fn refresh_resolves_values_from_the_latest_snapshot() {
        let (cache, store, snapshots) = cache_with_stores();
        persist_sheet(
            &snapshots,
            1,
            &[&[
                SheetCell::Text("total".to_owned()),
                SheetCell::Formula { formula: "=SUM(B2:B9)".to_owned(), computed: Some("128".to_owned()) },
            ]],
        )
        .await;
        store.ensure("s1", "A1:B1", PLACEHOLDER_VALUE).await.expect("ensure");

        let outcome = cache.refresh(&room(), range("A1:B1")).await.expect("refresh");
        assert_eq!(outcome, WriteOutcome::Patched);

        let row = store.get("s1", "A1:B1").await.expect("get").expect("present");
        assert_eq!(row.value_json, r#"[["total","128"]]"#);
    }

    #[tokio::test]
    async fn refresh_without_snapshot_leaves_the_placeholder() {
        let (cache, store, _snapshots) = cache_with_stores();
        store.ensure("s1", "C3", PLACEHOLDER_VALUE).await.expect("ensure");

        let outcome = cache.refresh(&room(), range("C3")).await.expect("refresh");
        assert_eq!(outcome, WriteOutcome::Unchanged);

        let row = store.get("s1", "C3").await.expect("get").expect("present");
        assert_eq!(row.value_json, PLACEHOLDER_VALUE);
    }

    #[tokio::test]
    async fn ensure_normalizes_the_reference_and_populates_in_the_background() {
        let (cache, store, snapshots) = cache_with_stores();
        persist_sheet(&snapshots, 1, &[&[SheetCell::Text("a1".to_owned()), SheetCell::Text("b1".to_owned())]])
            .await;

        let outcome = cache.ensure(&room(), range("b1:a1")).await.expect("ensure");
        assert_eq!(outcome.cell_ref, "A1:B1");
        assert!(outcome.created);

        // The spawned population pass completes after a yield.
        let mut value = String::new();
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            let row = store.get("s1", "A1:B1").await.expect("get").expect("present");
            value = row.value_json;
            if value != PLACEHOLDER_VALUE {
                break;
            }
        }
        assert_eq!(value, r#"[["a1","b1"]]"#);
    }

    #[tokio::test]
    async fn apply_batch_tallies_each_outcome_class() {
        let (cache, store, _snapshots) = cache_with_stores();
        store.ensure("s1", "A1", PLACEHOLDER_VALUE).await.expect("ensure");
        store.ensure("s1", "B2", PLACEHOLDER_VALUE).await.expect("ensure");
        store.patch_if_changed("s1", "B2", r#"[["7"]]"#).await.expect("seed");

        let updates = vec![
            CellUpdate { cell_ref: "A1".to_owned(), values: vec![vec!["fresh".to_owned()]] },
            CellUpdate { cell_ref: "B2".to_owned(), values: vec![vec!["7".to_owned()]] },
            CellUpdate { cell_ref: "Z9".to_owned(), values: vec![vec!["untracked".to_owned()]] },
            CellUpdate { cell_ref: "not a ref".to_owned(), values: vec![] },
        ];
        let summary = cache.apply_batch(&room(), &updates).await;

        assert_eq!(
            summary,
            BatchSummary { patched: 1, unchanged: 1, dropped: 1, invalid: 1, failed: 0 }
        );
        // The untracked reference was not created by the batch.
        assert_eq!(store.get("s1", "Z9").await.expect("get"), None);
    }
}
