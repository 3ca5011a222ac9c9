// Per-room offline cache: one sqlite file per room under the cache dir.
//
// Layout per file: a single v2 snapshot row plus an append-only log of v1
// updates received since that snapshot. Loading replays snapshot then log.
// The filename is a hash of the room id so ids containing path separators
// or unicode never leak into the filesystem; the cleartext id is kept in
// the `meta` table for inspection.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cowrite_common::protocol::RoomId;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::doc_state::LiveDoc;

/// Log entries accumulated before `compact` folds them into the snapshot.
pub const COMPACT_THRESHOLD: u64 = 64;

const MIGRATION_V1_SQL: &str = "
    CREATE TABLE meta (
        key    TEXT PRIMARY KEY,
        value  TEXT NOT NULL
    );

    CREATE TABLE snapshot (
        id        INTEGER PRIMARY KEY CHECK (id = 1),
        payload   BLOB NOT NULL,
        saved_at  TEXT NOT NULL
    );

    CREATE TABLE update_log (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        payload     BLOB NOT NULL,
        created_at  TEXT NOT NULL
    );
";

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL)];

/// What a cache load put into the doc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheLoadSummary {
    pub snapshot_loaded: bool,
    pub updates_applied: u64,
}

#[derive(Debug)]
pub struct LocalDocCache {
    conn: Connection,
    path: PathBuf,
}

impl LocalDocCache {
    pub fn open(cache_dir: &Path, room: &RoomId) -> Result<Self> {
        fs::create_dir_all(cache_dir).with_context(|| {
            format!("failed to create cache directory `{}`", cache_dir.display())
        })?;

        let path = cache_dir.join(cache_file_name(room));
        let mut conn = Connection::open(&path)
            .with_context(|| format!("failed to open room cache at `{}`", path.display()))?;

        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            ",
        )
        .context("failed to configure sqlite pragmas for room cache")?;

        ensure_migration_table(&conn)?;
        apply_pending_migrations(&mut conn)?;

        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('room_id', ?1)",
            params![room.to_string()],
        )
        .context("failed to record room id in cache meta")?;

        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cleartext room id recorded at open time.
    pub fn room_id(&self) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM meta WHERE key = 'room_id'", [], |row| row.get(0))
            .optional()
            .context("failed to read room id from cache meta")
    }

    /// True once anything has been persisted for this room.
    pub fn has_content(&self) -> Result<bool> {
        let snapshot: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM snapshot", [], |row| row.get(0))
            .context("failed to count cached snapshots")?;
        if snapshot > 0 {
            return Ok(true);
        }
        Ok(self.log_len()? > 0)
    }

    /// Replay the cache into a doc: snapshot first, then logged updates in
    /// insertion order. Corrupt log rows are skipped, not fatal; losing one
    /// delta is recoverable on the next relay sync, losing the whole cache
    /// is not.
    pub fn load_into(&self, doc: &LiveDoc) -> Result<CacheLoadSummary> {
        let mut summary = CacheLoadSummary::default();

        let snapshot: Option<Vec<u8>> = self
            .conn
            .query_row("SELECT payload FROM snapshot WHERE id = 1", [], |row| row.get(0))
            .optional()
            .context("failed to read cached snapshot")?;
        if let Some(payload) = snapshot {
            doc.apply_snapshot(&payload).context("failed to apply cached snapshot")?;
            summary.snapshot_loaded = true;
        }

        let mut stmt = self
            .conn
            .prepare("SELECT id, payload FROM update_log ORDER BY id ASC")
            .context("failed to prepare update log query")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)))
            .context("failed to query update log")?;
        for row in rows {
            let (id, payload) = row.context("failed to read update log row")?;
            match doc.apply_cached_update(&payload) {
                Ok(()) => summary.updates_applied += 1,
                Err(error) => {
                    tracing::warn!(row = id, ?error, "skipping corrupt cached update");
                }
            }
        }

        Ok(summary)
    }

    /// Append one v1 update to the log.
    pub fn append_update(&self, payload: &[u8]) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO update_log (payload, created_at) VALUES (?1, datetime('now'))",
                params![payload],
            )
            .context("failed to append update to cache log")?;
        Ok(())
    }

    pub fn log_len(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM update_log", [], |row| row.get(0))
            .context("failed to count cached updates")?;
        Ok(count as u64)
    }

    /// Replace the snapshot and drop the log it supersedes, atomically.
    pub fn save_snapshot(&mut self, payload: &[u8]) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start snapshot transaction")?;
        tx.execute(
            "INSERT OR REPLACE INTO snapshot (id, payload, saved_at) VALUES (1, ?1, datetime('now'))",
            params![payload],
        )
        .context("failed to write cache snapshot")?;
        tx.execute("DELETE FROM update_log", [])
            .context("failed to clear superseded update log")?;
        tx.commit().context("failed to commit cache snapshot")
    }

    /// Fold the log into a fresh snapshot once it crosses the threshold.
    /// Returns whether compaction ran.
    pub fn compact(&mut self, doc: &LiveDoc) -> Result<bool> {
        if self.log_len()? < COMPACT_THRESHOLD {
            return Ok(false);
        }
        let snapshot = doc.encode_snapshot();
        self.save_snapshot(&snapshot)?;
        tracing::debug!(room = %doc.room(), "compacted room cache");
        Ok(true)
    }
}

/// Hashed filename for a room cache: first 8 bytes of sha256 as hex.
fn cache_file_name(room: &RoomId) -> String {
    let digest = Sha256::digest(room.to_string().as_bytes());
    let hex: String = digest[..8].iter().map(|byte| format!("{byte:02x}")).collect();
    format!("{hex}.db")
}

fn ensure_migration_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );
        ",
    )
    .context("failed to ensure schema_migrations table exists")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read current schema version")
}

fn apply_pending_migrations(conn: &mut Connection) -> Result<()> {
    let mut current_version = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }

        let tx = conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply room cache migration v{version}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )
        .with_context(|| format!("failed to record migration v{version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        current_version = *version;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use cowrite_common::protocol::ResourceType;
    use tempfile::TempDir;
    use yrs::{GetString, Text, Transact};

    use super::*;

    fn room() -> RoomId {
        RoomId::new(ResourceType::Doc, "cache-test")
    }

    fn insert(doc: &LiveDoc, content: &str) -> Vec<u8> {
        let mut updates = doc.subscribe_updates();
        doc.edit(|d| {
            let text = d.get_or_insert_text("body");
            let mut txn = d.transact_mut();
            let len = text.get_string(&txn).len() as u32;
            text.insert(&mut txn, len, content);
        });
        updates.try_recv().expect("edit should publish an update").payload
    }

    fn body(doc: &LiveDoc) -> String {
        doc.edit(|d| {
            let text = d.get_or_insert_text("body");
            let txn = d.transact();
            text.get_string(&txn)
        })
    }

    #[test]
    fn filename_is_hashed_but_meta_keeps_the_cleartext_id() {
        let dir = TempDir::new().unwrap();
        let room = RoomId::new(ResourceType::Spreadsheet, "ws/42:βß");
        let cache = LocalDocCache::open(dir.path(), &room).unwrap();

        let name = cache.path().file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with(".db"));
        assert_eq!(name.len(), 16 + 3);
        assert!(!name.contains("ws"));
        assert_eq!(cache.room_id().unwrap().as_deref(), Some("spreadsheet-ws/42:βß"));
    }

    #[test]
    fn same_room_maps_to_the_same_file() {
        let dir = TempDir::new().unwrap();
        let a = LocalDocCache::open(dir.path(), &room()).unwrap();
        let b = LocalDocCache::open(dir.path(), &room()).unwrap();
        assert_eq!(a.path(), b.path());

        let other = LocalDocCache::open(dir.path(), &RoomId::new(ResourceType::Doc, "x")).unwrap();
        assert_ne!(a.path(), other.path());
    }

    #[test]
    fn appended_updates_replay_in_order() {
        let dir = TempDir::new().unwrap();
        let source = LiveDoc::with_client_id(room(), 1);
        let first = insert(&source, "hello");
        let second = insert(&source, " world");

        {
            let cache = LocalDocCache::open(dir.path(), &room()).unwrap();
            cache.append_update(&first).unwrap();
            cache.append_update(&second).unwrap();
            assert_eq!(cache.log_len().unwrap(), 2);
        }

        let cache = LocalDocCache::open(dir.path(), &room()).unwrap();
        let doc = LiveDoc::with_client_id(room(), 2);
        let summary = cache.load_into(&doc).unwrap();
        assert_eq!(summary, CacheLoadSummary { snapshot_loaded: false, updates_applied: 2 });
        assert_eq!(body(&doc), "hello world");
    }

    #[test]
    fn snapshot_save_clears_the_log() {
        let dir = TempDir::new().unwrap();
        let source = LiveDoc::with_client_id(room(), 1);
        let update = insert(&source, "content");

        let mut cache = LocalDocCache::open(dir.path(), &room()).unwrap();
        cache.append_update(&update).unwrap();
        cache.save_snapshot(&source.encode_snapshot()).unwrap();
        assert_eq!(cache.log_len().unwrap(), 0);

        let doc = LiveDoc::with_client_id(room(), 2);
        let summary = cache.load_into(&doc).unwrap();
        assert!(summary.snapshot_loaded);
        assert_eq!(summary.updates_applied, 0);
        assert_eq!(body(&doc), "content");
    }

    #[test]
    fn compact_waits_for_the_threshold() {
        let dir = TempDir::new().unwrap();
        let doc = LiveDoc::with_client_id(room(), 1);
        let mut cache = LocalDocCache::open(dir.path(), &room()).unwrap();

        for _ in 0..COMPACT_THRESHOLD - 1 {
            let update = insert(&doc, "x");
            cache.append_update(&update).unwrap();
        }
        assert!(!cache.compact(&doc).unwrap());
        assert_eq!(cache.log_len().unwrap(), COMPACT_THRESHOLD - 1);

        let update = insert(&doc, "x");
        cache.append_update(&update).unwrap();
        assert!(cache.compact(&doc).unwrap());
        assert_eq!(cache.log_len().unwrap(), 0);

        let restored = LiveDoc::with_client_id(room(), 2);
        assert!(cache.load_into(&restored).unwrap().snapshot_loaded);
        assert_eq!(body(&restored), "x".repeat(COMPACT_THRESHOLD as usize));
    }

    #[test]
    fn has_content_turns_true_after_any_write() {
        let dir = TempDir::new().unwrap();
        let mut cache = LocalDocCache::open(dir.path(), &room()).unwrap();
        assert!(!cache.has_content().unwrap());

        let source = LiveDoc::with_client_id(room(), 1);
        let update = insert(&source, "a");
        cache.append_update(&update).unwrap();
        assert!(cache.has_content().unwrap());

        cache.save_snapshot(&source.encode_snapshot()).unwrap();
        assert!(cache.has_content().unwrap());
    }

    #[test]
    fn corrupt_log_rows_are_skipped() {
        let dir = TempDir::new().unwrap();
        let source = LiveDoc::with_client_id(room(), 1);
        let good = insert(&source, "good");

        let path = {
            let cache = LocalDocCache::open(dir.path(), &room()).unwrap();
            cache.append_update(&good).unwrap();
            cache.path().to_path_buf()
        };

        let raw = Connection::open(&path).unwrap();
        raw.execute(
            "INSERT INTO update_log (payload, created_at) VALUES (?1, datetime('now'))",
            params![&[0xde_u8, 0xad, 0xbe, 0xef][..]],
        )
        .unwrap();
        drop(raw);

        let cache = LocalDocCache::open(dir.path(), &room()).unwrap();
        let doc = LiveDoc::with_client_id(room(), 2);
        let summary = cache.load_into(&doc).unwrap();
        assert_eq!(summary.updates_applied, 1);
        assert_eq!(body(&doc), "good");
    }

    #[test]
    fn reopen_preserves_schema_and_data() {
        let dir = TempDir::new().unwrap();
        let source = LiveDoc::with_client_id(room(), 1);
        let update = insert(&source, "durable");

        {
            let cache = LocalDocCache::open(dir.path(), &room()).unwrap();
            cache.append_update(&update).unwrap();
        }
        {
            let cache = LocalDocCache::open(dir.path(), &room()).unwrap();
            assert_eq!(cache.log_len().unwrap(), 1);
            assert!(cache.has_content().unwrap());
        }
    }
}
