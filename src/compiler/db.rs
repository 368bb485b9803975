use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};

use super::models::{LessonDocument, LessonRecord, LessonVersion, PreLessonKit, VersionSummary};
use crate::errors::CompileError;

/// Async-safe handle to the lesson database.
///
/// Wraps `LessonDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<LessonDb>>,
}

impl DbHandle {
    pub fn new(db: LessonDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&LessonDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Append the next version of a lesson, re-reading the version number
    /// and retrying when another writer got there first.
    pub async fn persist_version(
        &self,
        lesson_id: i64,
        document: &LessonDocument,
        max_attempts: u32,
    ) -> std::result::Result<LessonVersion, CompileError> {
        let attempts = max_attempts.max(1);
        for attempt in 1..=attempts {
            let doc = document.clone();
            match self
                .call(move |db| db.try_persist_version(lesson_id, &doc))
                .await
            {
                Ok(Some(version)) => return Ok(version),
                Ok(None) => {
                    tracing::debug!(lesson_id, attempt, "version write conflict, retrying");
                }
                Err(e) => return Err(CompileError::Persistence(e)),
            }
        }
        Err(CompileError::PersistenceConflict { lesson_id, attempts })
    }
}

fn is_write_conflict(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::ConstraintViolation | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

pub struct LessonDb {
    conn: Connection,
}

impl LessonDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure connection")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS lessons (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    objective_id TEXT NOT NULL UNIQUE,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS lesson_versions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    lesson_id INTEGER NOT NULL REFERENCES lessons(id) ON DELETE CASCADE,
                    version INTEGER NOT NULL,
                    document TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(lesson_id, version)
                );

                CREATE TABLE IF NOT EXISTS pre_lesson_kits (
                    learner_id TEXT NOT NULL,
                    objective_id TEXT NOT NULL,
                    kit TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    PRIMARY KEY (learner_id, objective_id)
                );

                CREATE TABLE IF NOT EXISTS lesson_kits (
                    lesson_id INTEGER PRIMARY KEY REFERENCES lessons(id) ON DELETE CASCADE,
                    kit TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_lesson_versions_lesson ON lesson_versions(lesson_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Lesson records ────────────────────────────────────────────────

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<LessonRecord> {
        Ok(LessonRecord {
            id: row.get(0)?,
            objective_id: row.get(1)?,
            created_at: row.get(2)?,
        })
    }

    /// At most one record per objective; returns the existing one if present.
    pub fn upsert_lesson_record(&self, objective_id: &str) -> Result<LessonRecord> {
        self.conn
            .execute(
                "INSERT INTO lessons (objective_id) VALUES (?1) ON CONFLICT(objective_id) DO NOTHING",
                params![objective_id],
            )
            .context("Failed to upsert lesson record")?;
        self.find_lesson(objective_id)?
            .context("Lesson record not found after upsert")
    }

    pub fn find_lesson(&self, objective_id: &str) -> Result<Option<LessonRecord>> {
        self.conn
            .query_row(
                "SELECT id, objective_id, created_at FROM lessons WHERE objective_id = ?1",
                params![objective_id],
                Self::row_to_record,
            )
            .optional()
            .context("Failed to query lesson by objective")
    }

    pub fn get_lesson(&self, lesson_id: i64) -> Result<Option<LessonRecord>> {
        self.conn
            .query_row(
                "SELECT id, objective_id, created_at FROM lessons WHERE id = ?1",
                params![lesson_id],
                Self::row_to_record,
            )
            .optional()
            .context("Failed to query lesson")
    }

    // ── Versions ──────────────────────────────────────────────────────

    /// Read the next version number and insert it as one transaction.
    /// `Ok(None)` signals a write conflict the caller should retry.
    pub fn try_persist_version(
        &self,
        lesson_id: i64,
        document: &LessonDocument,
    ) -> Result<Option<LessonVersion>> {
        let json = serde_json::to_string(document).context("Failed to serialize document")?;

        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = match self.conn.unchecked_transaction() {
            Ok(tx) => tx,
            Err(e) if is_write_conflict(&e) => return Ok(None),
            Err(e) => return Err(e).context("Failed to begin transaction"),
        };
        let version: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM lesson_versions WHERE lesson_id = ?1",
                params![lesson_id],
                |row| row.get(0),
            )
            .context("Failed to read next version")?;
        match tx.execute(
            "INSERT INTO lesson_versions (lesson_id, version, document) VALUES (?1, ?2, ?3)",
            params![lesson_id, version, json],
        ) {
            Ok(_) => {}
            Err(e) if is_write_conflict(&e) => return Ok(None),
            Err(e) => return Err(e).context("Failed to insert lesson version"),
        }
        match tx.commit() {
            Ok(()) => {}
            Err(e) if is_write_conflict(&e) => return Ok(None),
            Err(e) => return Err(e).context("Failed to commit lesson version"),
        }

        self.get_version(lesson_id, version)
    }

    fn row_to_version(row: &rusqlite::Row) -> rusqlite::Result<(i64, i64, String, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    }

    fn decode_version(raw: (i64, i64, String, String)) -> Result<LessonVersion> {
        let (lesson_id, version, document, created_at) = raw;
        let document: LessonDocument = serde_json::from_str(&document)
            .with_context(|| format!("Corrupt document for lesson {} v{}", lesson_id, version))?;
        Ok(LessonVersion {
            lesson_id,
            version,
            document,
            created_at,
        })
    }

    pub fn get_version(&self, lesson_id: i64, version: i64) -> Result<Option<LessonVersion>> {
        let raw = self
            .conn
            .query_row(
                "SELECT lesson_id, version, document, created_at FROM lesson_versions
                 WHERE lesson_id = ?1 AND version = ?2",
                params![lesson_id, version],
                Self::row_to_version,
            )
            .optional()
            .context("Failed to query lesson version")?;
        raw.map(Self::decode_version).transpose()
    }

    /// The version with the highest number.
    pub fn current_version(&self, lesson_id: i64) -> Result<Option<LessonVersion>> {
        let raw = self
            .conn
            .query_row(
                "SELECT lesson_id, version, document, created_at FROM lesson_versions
                 WHERE lesson_id = ?1 ORDER BY version DESC LIMIT 1",
                params![lesson_id],
                Self::row_to_version,
            )
            .optional()
            .context("Failed to query current version")?;
        raw.map(Self::decode_version).transpose()
    }

    pub fn list_versions(&self, lesson_id: i64) -> Result<Vec<VersionSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT lesson_id, version, document, created_at FROM lesson_versions
                 WHERE lesson_id = ?1 ORDER BY version",
            )
            .context("Failed to prepare list_versions")?;
        let rows = stmt
            .query_map(params![lesson_id], Self::row_to_version)
            .context("Failed to query versions")?;
        let mut versions = Vec::new();
        for row in rows {
            let v = Self::decode_version(row.context("Failed to read version row")?)?;
            versions.push(VersionSummary {
                version: v.version,
                generation_status: v.document.metadata.generation_status,
                created_at: v.created_at,
            });
        }
        Ok(versions)
    }

    // ── Pre-lesson kits ───────────────────────────────────────────────

    pub fn save_kit(&self, learner_id: &str, objective_id: &str, kit: &PreLessonKit) -> Result<()> {
        let json = serde_json::to_string(kit).context("Failed to serialize kit")?;
        self.conn
            .execute(
                "INSERT INTO pre_lesson_kits (learner_id, objective_id, kit) VALUES (?1, ?2, ?3)
                 ON CONFLICT(learner_id, objective_id) DO UPDATE SET kit = excluded.kit",
                params![learner_id, objective_id, json],
            )
            .context("Failed to save kit")?;
        Ok(())
    }

    pub fn get_kit(&self, learner_id: &str, objective_id: &str) -> Result<Option<PreLessonKit>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT kit FROM pre_lesson_kits WHERE learner_id = ?1 AND objective_id = ?2",
                params![learner_id, objective_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query kit")?;
        raw.map(|json| serde_json::from_str(&json).context("Corrupt kit JSON"))
            .transpose()
    }

    /// Record the kit a lesson was compiled with; `None` clears it.
    pub fn set_lesson_kit(&self, lesson_id: i64, kit: Option<&PreLessonKit>) -> Result<()> {
        match kit {
            Some(kit) => {
                let json = serde_json::to_string(kit).context("Failed to serialize kit")?;
                self.conn
                    .execute(
                        "INSERT INTO lesson_kits (lesson_id, kit) VALUES (?1, ?2)
                         ON CONFLICT(lesson_id) DO UPDATE SET kit = excluded.kit, updated_at = datetime('now')",
                        params![lesson_id, json],
                    )
                    .context("Failed to save lesson kit")?;
            }
            None => {
                self.conn
                    .execute("DELETE FROM lesson_kits WHERE lesson_id = ?1", params![lesson_id])
                    .context("Failed to clear lesson kit")?;
            }
        }
        Ok(())
    }

    pub fn get_lesson_kit(&self, lesson_id: i64) -> Result<Option<PreLessonKit>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT kit FROM lesson_kits WHERE lesson_id = ?1",
                params![lesson_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query lesson kit")?;
        raw.map(|json| serde_json::from_str(&json).context("Corrupt lesson kit JSON"))
            .transpose()
    }
}
