//! SQLite-backed state store: features, notes, sessions.
//!
//! Sole owner of persistent state. Every operation commits before returning;
//! multi-step transitions (`retry`, `ingest`) run inside short transactions.
//! The orchestrator holds one connection; the `tool` subcommand invoked by
//! the agent opens a second connection against the same file, so the store
//! runs in WAL mode with a busy timeout instead of assuming a single writer.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::core::types::{
    Feature, FeatureSpec, FeatureStatus, KanbanStats, Note, NoteScope, SessionClose, SessionRow,
    SessionStatus, StatusCounts,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS features (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    category TEXT NOT NULL,
    steps TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'pending',
    retries INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_features_status ON features(status);
CREATE INDEX IF NOT EXISTS idx_features_category ON features(category);
CREATE TABLE IF NOT EXISTS notes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    feature_id INTEGER,
    category TEXT,
    content TEXT NOT NULL,
    session_id INTEGER,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_notes_feature ON notes(feature_id);
CREATE INDEX IF NOT EXISTS idx_notes_category ON notes(category);
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    status TEXT NOT NULL DEFAULT 'running',
    features_attempted INTEGER NOT NULL DEFAULT 0,
    features_completed INTEGER NOT NULL DEFAULT 0,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    cost REAL NOT NULL DEFAULT 0,
    error TEXT
);
";

const FEATURE_COLUMNS: &str = "id, name, description, category, steps, status, retries, created_at, updated_at";

/// Open handle over the on-disk (or in-memory) state.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if absent) a store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create store directory {}", parent.display()))?;
        }
        let conn =
            Connection::open(path).with_context(|| format!("open store {}", path.display()))?;
        Self::bootstrap(conn)
    }

    /// Open a store that must already exist.
    pub fn open_existing(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow!(
                "missing store {} (run `foreman ingest` first)",
                path.display()
            ));
        }
        Self::open(path)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory store")?;
        Self::bootstrap(conn)
    }

    fn bootstrap(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))
            .context("set busy timeout")?;
        // The pragma reports the resulting mode as a row, so query_row it.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))
            .context("enable wal")?;
        conn.execute_batch(SCHEMA).context("initialize schema")?;
        Ok(Self { conn })
    }

    /// Bulk-insert features, preserving caller-assigned ids. Fails on a
    /// duplicate id without applying any of the batch.
    pub fn ingest(&mut self, specs: &[FeatureSpec]) -> Result<usize> {
        let now = now_ts();
        let tx = self.conn.transaction().context("begin ingest")?;
        for spec in specs {
            let steps = serde_json::to_string(&spec.steps).context("serialize steps")?;
            tx.execute(
                "INSERT INTO features (id, name, description, category, steps, status, retries, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?6)",
                params![spec.id, spec.name, spec.description, spec.category, steps, now],
            )
            .with_context(|| format!("insert feature {}", spec.id))?;
        }
        tx.commit().context("commit ingest")?;
        Ok(specs.len())
    }

    pub fn feature(&self, id: i64) -> Result<Option<Feature>> {
        self.conn
            .query_row(
                &format!("SELECT {FEATURE_COLUMNS} FROM features WHERE id = ?1"),
                params![id],
                map_feature,
            )
            .optional()
            .with_context(|| format!("read feature {id}"))
    }

    pub fn feature_count(&self) -> Result<u32> {
        self.conn
            .query_row("SELECT COUNT(*) FROM features", [], |row| row.get(0))
            .context("count features")
    }

    /// All features, ascending id (validator input).
    pub fn all_features(&self) -> Result<Vec<Feature>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {FEATURE_COLUMNS} FROM features ORDER BY id ASC"
            ))
            .context("prepare all_features")?;
        let rows = stmt.query_map([], map_feature).context("query features")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("read features")
    }

    pub fn features_by_status(&self, status: FeatureStatus) -> Result<Vec<Feature>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {FEATURE_COLUMNS} FROM features WHERE status = ?1 ORDER BY id ASC"
            ))
            .context("prepare features_by_status")?;
        let rows = stmt
            .query_map(params![status.as_str()], map_feature)
            .context("query features")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("read features")
    }

    /// Unconditional status write for in_progress/completed transitions.
    pub fn set_status(&mut self, id: i64, status: FeatureStatus) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE features SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now_ts(), id],
            )
            .with_context(|| format!("set feature {id} to {}", status.as_str()))?;
        if changed == 0 {
            return Err(anyhow!("feature {id} not found"));
        }
        Ok(())
    }

    /// Retry request: atomically increment the retry counter and demote the
    /// feature to pending, or to failed once the counter reaches
    /// `max_retries`. The only path into the failed state.
    ///
    /// A retry against a feature already completed or failed is a no-op that
    /// returns the current state unchanged.
    pub fn retry(&mut self, id: i64, max_retries: u32) -> Result<(FeatureStatus, u32)> {
        let tx = self.conn.transaction().context("begin retry")?;
        let row: Option<(String, u32)> = tx
            .query_row(
                "SELECT status, retries FROM features WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .with_context(|| format!("read feature {id}"))?;
        let (status_raw, retries) = row.ok_or_else(|| anyhow!("feature {id} not found"))?;
        let status = FeatureStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("feature {id} has unknown status '{status_raw}'"))?;

        if status.is_terminal() {
            tx.commit().context("commit retry")?;
            return Ok((status, retries));
        }

        let retries = retries + 1;
        let status = if retries >= max_retries {
            FeatureStatus::Failed
        } else {
            FeatureStatus::Pending
        };
        tx.execute(
            "UPDATE features SET status = ?1, retries = ?2, updated_at = ?3 WHERE id = ?4",
            params![status.as_str(), retries, now_ts(), id],
        )
        .with_context(|| format!("update feature {id}"))?;
        tx.commit().context("commit retry")?;
        Ok((status, retries))
    }

    /// Select the next batch: up to `limit` pending features from the
    /// category owning the lowest pending id, ascending. Empty iff no
    /// pending features exist. Read-only.
    pub fn next_batch(&self, limit: usize) -> Result<Vec<Feature>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {FEATURE_COLUMNS} FROM features
                 WHERE status = 'pending'
                   AND category = (
                       SELECT category FROM features
                       WHERE status = 'pending'
                       ORDER BY id ASC LIMIT 1
                   )
                 ORDER BY id ASC
                 LIMIT ?1"
            ))
            .context("prepare next_batch")?;
        let rows = stmt
            .query_map(params![limit as i64], map_feature)
            .context("query batch")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("read batch")
    }

    pub fn has_incomplete(&self) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM features WHERE status IN ('pending', 'in_progress'))",
                [],
                |row| row.get(0),
            )
            .context("check incomplete features")
    }

    /// Return every in_progress feature to pending. Idempotent.
    pub fn reset_orphans(&mut self) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE features SET status = 'pending', updated_at = ?1
                 WHERE status = 'in_progress'",
                params![now_ts()],
            )
            .context("reset orphans")
    }

    /// Return in_progress features untouched for `hours` hours to pending.
    pub fn reset_stale(&mut self, hours: i64) -> Result<usize> {
        let cutoff = (Utc::now() - chrono::Duration::hours(hours))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        self.conn
            .execute(
                "UPDATE features SET status = 'pending', updated_at = ?1
                 WHERE status = 'in_progress' AND updated_at < ?2",
                params![now_ts(), cutoff],
            )
            .context("reset stale features")
    }

    /// Counts by status, globally and per category. Categories come back in
    /// batcher order (ascending lowest member id).
    pub fn kanban_stats(&self) -> Result<KanbanStats> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT category, status, COUNT(*), MIN(id)
                 FROM features GROUP BY category, status",
            )
            .context("prepare stats")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .context("query stats")?;

        let mut stats = KanbanStats::default();
        let mut categories: Vec<(i64, String, StatusCounts)> = Vec::new();
        for row in rows {
            let (category, status_raw, count, min_id) = row.context("read stats row")?;
            let status = FeatureStatus::parse(&status_raw)
                .ok_or_else(|| anyhow!("unknown status '{status_raw}' in store"))?;
            stats.total.bump(status, count);
            match categories.iter_mut().find(|(_, name, _)| *name == category) {
                Some((first_id, _, counts)) => {
                    *first_id = (*first_id).min(min_id);
                    counts.bump(status, count);
                }
                None => {
                    let mut counts = StatusCounts::default();
                    counts.bump(status, count);
                    categories.push((min_id, category, counts));
                }
            }
        }
        categories.sort_by_key(|(first_id, _, _)| *first_id);
        stats.by_category = categories
            .into_iter()
            .map(|(_, name, counts)| (name, counts))
            .collect();
        Ok(stats)
    }

    /// Insert a note. Scope exclusivity is enforced by the tool surface; the
    /// store just records it.
    pub fn add_note(
        &mut self,
        scope: &NoteScope,
        content: &str,
        session_id: Option<i64>,
    ) -> Result<i64> {
        let (feature_id, category) = match scope {
            NoteScope::Feature(id) => (Some(*id), None),
            NoteScope::Category(cat) => (None, Some(cat.as_str())),
            NoteScope::Global => (None, None),
        };
        self.conn
            .execute(
                "INSERT INTO notes (feature_id, category, content, session_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![feature_id, category, content, session_id, now_ts()],
            )
            .context("insert note")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Notes whose scope matches the given feature, the given category, or is
    /// global. Newest first.
    pub fn notes_for(&self, feature_id: Option<i64>, category: Option<&str>) -> Result<Vec<Note>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, feature_id, category, content, session_id, created_at FROM notes
                 WHERE (?1 IS NOT NULL AND feature_id = ?1)
                    OR (?2 IS NOT NULL AND category = ?2)
                    OR (feature_id IS NULL AND category IS NULL)
                 ORDER BY id DESC",
            )
            .context("prepare notes_for")?;
        let rows = stmt
            .query_map(params![feature_id, category], map_note)
            .context("query notes")?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("read notes")
    }

    /// The newest `limit` notes scoped to `category` or global, the slice
    /// injected into a session context. Feature-scoped notes are excluded;
    /// the agent fetches those on demand.
    pub fn recent_notes(&self, category: &str, limit: usize) -> Result<Vec<Note>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, feature_id, category, content, session_id, created_at FROM notes
                 WHERE category = ?1 OR (feature_id IS NULL AND category IS NULL)
                 ORDER BY id DESC
                 LIMIT ?2",
            )
            .context("prepare recent_notes")?;
        let rows = stmt
            .query_map(params![category, limit as i64], map_note)
            .context("query notes")?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("read notes")
    }

    /// Open a session row in status running; returns its id.
    pub fn start_session(&mut self) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO sessions (started_at, status) VALUES (?1, 'running')",
                params![now_ts()],
            )
            .context("insert session")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Terminal transition for a session row; written exactly once.
    pub fn end_session(&mut self, id: i64, close: &SessionClose) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE sessions SET ended_at = ?1, status = ?2, features_attempted = ?3,
                        features_completed = ?4, input_tokens = ?5, output_tokens = ?6,
                        cost = ?7, error = ?8
                 WHERE id = ?9",
                params![
                    now_ts(),
                    close.status.as_str(),
                    close.features_attempted,
                    close.features_completed,
                    close.input_tokens as i64,
                    close.output_tokens as i64,
                    close.cost,
                    close.error,
                    id
                ],
            )
            .with_context(|| format!("close session {id}"))?;
        if changed == 0 {
            return Err(anyhow!("session {id} not found"));
        }
        Ok(())
    }

    pub fn session(&self, id: i64) -> Result<SessionRow> {
        self.conn
            .query_row(
                "SELECT id, started_at, ended_at, status, features_attempted,
                        features_completed, input_tokens, output_tokens, cost, error
                 FROM sessions WHERE id = ?1",
                params![id],
                |row| {
                    let status_raw: String = row.get(3)?;
                    let status = SessionStatus::parse(&status_raw).ok_or_else(|| {
                        bad_column(3, format!("unknown session status '{status_raw}'"))
                    })?;
                    Ok(SessionRow {
                        id: row.get(0)?,
                        started_at: row.get(1)?,
                        ended_at: row.get(2)?,
                        status,
                        features_attempted: row.get(4)?,
                        features_completed: row.get(5)?,
                        input_tokens: row.get::<_, i64>(6)? as u64,
                        output_tokens: row.get::<_, i64>(7)? as u64,
                        cost: row.get(8)?,
                        error: row.get(9)?,
                    })
                },
            )
            .with_context(|| format!("read session {id}"))
    }

    /// Test hook: rewrite a feature's updated_at to fake elapsed time.
    #[cfg(test)]
    pub fn backdate_feature(&mut self, id: i64, updated_at: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE features SET updated_at = ?1 WHERE id = ?2",
                params![updated_at, id],
            )
            .context("backdate feature")?;
        Ok(())
    }
}

fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn bad_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

fn map_feature(row: &Row<'_>) -> rusqlite::Result<Feature> {
    let steps_raw: String = row.get(4)?;
    let steps = serde_json::from_str(&steps_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(err))
    })?;
    let status_raw: String = row.get(5)?;
    let status = FeatureStatus::parse(&status_raw)
        .ok_or_else(|| bad_column(5, format!("unknown status '{status_raw}'")))?;
    Ok(Feature {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        category: row.get(3)?,
        steps,
        status,
        retries: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn map_note(row: &Row<'_>) -> rusqlite::Result<Note> {
    Ok(Note {
        id: row.get(0)?,
        feature_id: row.get(1)?,
        category: row.get(2)?,
        content: row.get(3)?,
        session_id: row.get(4)?,
        created_at: row.get(5)?,
    })
}
