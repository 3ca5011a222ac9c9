// Durable room snapshots.
//
// A snapshot is the v2-encoded state of a room's replicated document plus a
// monotonically increasing version. Version 0 means "never persisted"; the
// first accepted write stores version 1. Writers racing across relay
// instances lose cleanly: a persist carrying a version at or below the
// stored one is reported as stale and changes nothing.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::{info_span, Instrument};

/// Boxed future returned by store methods, keeping the trait object-safe.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub version: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Persisted,
    /// A version at or above the attempted one is already stored.
    Stale { current: u64 },
}

pub trait SnapshotStore: Send + Sync {
    fn load<'a>(&'a self, room_id: &'a str) -> StoreFuture<'a, Option<StoredSnapshot>>;

    fn persist<'a>(
        &'a self,
        room_id: &'a str,
        version: u64,
        payload: &'a [u8],
    ) -> StoreFuture<'a, PersistOutcome>;
}

/// In-memory store used when no database is configured, and in tests.
#[derive(Default)]
pub struct MemorySnapshotStore {
    rooms: RwLock<HashMap<String, StoredSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> MemorySnapshotStore {
        MemorySnapshotStore::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load<'a>(&'a self, room_id: &'a str) -> StoreFuture<'a, Option<StoredSnapshot>> {
        Box::pin(async move { Ok(self.rooms.read().await.get(room_id).cloned()) })
    }

    fn persist<'a>(
        &'a self,
        room_id: &'a str,
        version: u64,
        payload: &'a [u8],
    ) -> StoreFuture<'a, PersistOutcome> {
        Box::pin(async move {
            let mut rooms = self.rooms.write().await;
            if let Some(existing) = rooms.get(room_id) {
                if existing.version >= version {
                    return Ok(PersistOutcome::Stale { current: existing.version });
                }
            }
            rooms
                .insert(room_id.to_owned(), StoredSnapshot { version, payload: payload.to_vec() });
            Ok(PersistOutcome::Persisted)
        })
    }
}

/// Postgres-backed store; one row per room in `room_snapshots`.
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub fn new(pool: PgPool) -> PgSnapshotStore {
        PgSnapshotStore { pool }
    }
}

impl SnapshotStore for PgSnapshotStore {
    fn load<'a>(&'a self, room_id: &'a str) -> StoreFuture<'a, Option<StoredSnapshot>> {
        Box::pin(async move {
            let row: Option<(i64, Vec<u8>)> =
                sqlx::query_as("SELECT version, payload FROM room_snapshots WHERE room_id = $1")
                    .bind(room_id)
                    .fetch_optional(&self.pool)
                    .instrument(info_span!("relay.db.query", query = "room_snapshots.load"))
                    .await
                    .context("failed to load room snapshot")?;

            Ok(row.map(|(version, payload)| StoredSnapshot {
                version: u64::try_from(version).unwrap_or(0),
                payload,
            }))
        })
    }

    fn persist<'a>(
        &'a self,
        room_id: &'a str,
        version: u64,
        payload: &'a [u8],
    ) -> StoreFuture<'a, PersistOutcome> {
        Box::pin(async move {
            let version =
                i64::try_from(version).context("snapshot version exceeds storable range")?;

            // Conditional upsert: the WHERE clause makes stale writers lose
            // without a transaction.
            let result = sqlx::query(
                "INSERT INTO room_snapshots (room_id, version, payload, updated_at) \
                 VALUES ($1, $2, $3, now()) \
                 ON CONFLICT (room_id) DO UPDATE \
                 SET version = EXCLUDED.version, payload = EXCLUDED.payload, updated_at = now() \
                 WHERE room_snapshots.version < EXCLUDED.version",
            )
            .bind(room_id)
            .bind(version)
            .bind(payload)
            .execute(&self.pool)
            .instrument(info_span!("relay.db.query", query = "room_snapshots.persist"))
            .await
            .context("failed to persist room snapshot")?;

            if result.rows_affected() > 0 {
                return Ok(PersistOutcome::Persisted);
            }

            let current: Option<i64> =
                sqlx::query_scalar("SELECT version FROM room_snapshots WHERE room_id = $1")
                    .bind(room_id)
                    .fetch_optional(&self.pool)
                    .instrument(info_span!("relay.db.query", query = "room_snapshots.version"))
                    .await
                    .context("failed to read stored snapshot version")?;

            Ok(PersistOutcome::Stale {
                current: current.and_then(|v| u64::try_from(v).ok()).unwrap_or(0),
            })
        })
    }
}
