//! SQLite-backed persistent store for sessions, iterations and the cost ledger.
//!
//! The schema is a stable contract shared with external db tooling:
//! `sessions`, `iterations` (cascading from `sessions`) and `cost_log`
//! (cascading from both). Iterations form a backward-linked chain through
//! `parent_id`; the store never walks that chain itself.

mod cancel;
mod cost_log;

pub use cancel::CancelToken;

use crate::error::{Error, ResultExt};
use crate::session::{Iteration, IterationMetadata, Operation, Session};
use crate::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SESSION_COLUMNS: &str = "id, name, created_at, updated_at, current_iteration_id, model";

/// SQLite VM steps between cancellation checks.
const CANCEL_CHECK_OPS: i32 = 1_000;

const ITERATION_COLUMNS: &str = "id, session_id, parent_id, operation, prompt, revised_prompt, \
     model, image_path, timestamp, metadata";

/// Row counts reported by `imgforge db info`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub sessions: u64,
    pub iterations: u64,
    pub cost_entries: u64,
}

/// Durable store over one SQLite database file.
///
/// Cheap to clone; clones share the same connection, so independent
/// workflows (a batch runner, a cost report) can use the store concurrently
/// without going through a session manager. Calls are serialized on the
/// connection lock.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    cancel: Option<CancelToken>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database {}", db_path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to set SQLite pragmas")?;

        Self::init_schema(&conn)?;
        tracing::debug!("opened store at {}", db_path.display());

        Ok(Self::from_connection(conn, Some(db_path.to_path_buf())))
    }

    /// Open a private in-memory database. Nothing survives the last clone.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("failed to set SQLite pragmas")?;
        Self::init_schema(&conn)?;
        Ok(Self::from_connection(conn, None))
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            cancel: None,
            path,
        }
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id                   TEXT PRIMARY KEY NOT NULL,
                name                 TEXT,
                created_at           TEXT NOT NULL,
                updated_at           TEXT NOT NULL,
                current_iteration_id TEXT,
                model                TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_updated_at ON sessions(updated_at DESC);

            CREATE TABLE IF NOT EXISTS iterations (
                id             TEXT PRIMARY KEY NOT NULL,
                session_id     TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                parent_id      TEXT,
                operation      TEXT NOT NULL,
                prompt         TEXT NOT NULL,
                revised_prompt TEXT,
                model          TEXT NOT NULL DEFAULT '',
                image_path     TEXT NOT NULL DEFAULT '',
                timestamp      TEXT NOT NULL,
                metadata       TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_iterations_session ON iterations(session_id);
            CREATE INDEX IF NOT EXISTS idx_iterations_parent ON iterations(parent_id);

            CREATE TABLE IF NOT EXISTS cost_log (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                iteration_id TEXT REFERENCES iterations(id) ON DELETE CASCADE,
                session_id   TEXT REFERENCES sessions(id) ON DELETE CASCADE,
                provider     TEXT NOT NULL,
                model        TEXT NOT NULL DEFAULT '',
                cost         REAL NOT NULL DEFAULT 0,
                image_count  INTEGER NOT NULL DEFAULT 1,
                timestamp    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cost_log_timestamp ON cost_log(timestamp);
            CREATE INDEX IF NOT EXISTS idx_cost_log_provider ON cost_log(provider);
            CREATE INDEX IF NOT EXISTS idx_cost_log_session ON cost_log(session_id);",
        )
        .context("failed to initialize schema")?;

        // Migration: databases created before per-session models lack sessions.model.
        let has_model_column = conn
            .prepare("PRAGMA table_info(sessions)")
            .context("failed to inspect sessions table")?
            .query_map([], |row| row.get::<_, String>(1))
            .context("failed to inspect sessions table")?
            .filter_map(|r| r.ok())
            .any(|col| col == "model");

        if !has_model_column {
            conn.execute_batch("ALTER TABLE sessions ADD COLUMN model TEXT NOT NULL DEFAULT '';")
                .context("failed to add sessions.model column")?;
            tracing::info!("migrated sessions table: added model column");
        }

        Ok(())
    }

    /// Database file backing this store, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// A handle on the same database whose calls abort once `token` is
    /// cancelled.
    ///
    /// The token is only consulted while this handle holds the connection,
    /// so cancelling it never disturbs calls made through other clones.
    pub fn with_cancel_token(&self, token: CancelToken) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
            cancel: Some(token),
            path: self.path.clone(),
        }
    }

    /// Lock the connection for one call, arming this handle's cancel token.
    fn lock(&self) -> Result<ConnGuard<'_>> {
        let conn = self.conn.lock();
        let Some(token) = &self.cancel else {
            return Ok(ConnGuard { conn, armed: false });
        };
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let token = token.clone();
        conn.progress_handler(CANCEL_CHECK_OPS, Some(move || token.is_cancelled()));
        Ok(ConnGuard { conn, armed: true })
    }

    // ── Sessions ──────────────────────────────────────────────────

    pub fn create_session(&self, session: &Session) -> Result<()> {
        let conn = self.lock()?;
        insert_session(&conn, session)?;
        tracing::debug!(session_id = %session.id, "created session");
        Ok(())
    }

    /// Get a session by id. Fails with `NotFound` when absent.
    pub fn get_session(&self, id: &str) -> Result<Session> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
            params![id],
            session_from_row,
        )
        .optional()
        .context("failed to get session")?
        .ok_or_else(|| Error::session_not_found(id))
    }

    /// Overwrite every mutable field of an existing session.
    pub fn update_session(&self, session: &Session) -> Result<()> {
        let conn = self.lock()?;
        update_session_row(&conn, session)
    }

    /// Delete a session together with its iterations and ledger rows.
    pub fn delete_session(&self, id: &str) -> Result<()> {
        let conn = self.lock()?;
        let rows = conn
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])
            .context("failed to delete session")?;
        if rows == 0 {
            return Err(Error::session_not_found(id));
        }
        tracing::debug!(session_id = %id, "deleted session");
        Ok(())
    }

    /// All sessions, most recently active first.
    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY updated_at DESC, created_at DESC"
            ))
            .context("failed to list sessions")?;
        let rows = stmt
            .query_map([], session_from_row)
            .context("failed to list sessions")?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row.context("failed to read session row")?);
        }
        Ok(sessions)
    }

    // ── Iterations ────────────────────────────────────────────────

    pub fn create_iteration(&self, iteration: &Iteration) -> Result<()> {
        let conn = self.lock()?;
        insert_iteration(&conn, iteration)?;
        tracing::debug!(iteration_id = %iteration.id, session_id = %iteration.session_id, "created iteration");
        Ok(())
    }

    /// Insert `iteration` and overwrite `session` in a single transaction.
    ///
    /// Either both rows change or neither does, so a crash can never leave a
    /// new iteration that the session pointer does not know about.
    pub fn append_iteration(&self, iteration: &Iteration, session: &Session) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .context("failed to begin iteration transaction")?;
        insert_iteration(&tx, iteration)?;
        update_session_row(&tx, session)?;
        tx.commit().context("failed to commit iteration")?;
        tracing::debug!(
            iteration_id = %iteration.id,
            session_id = %session.id,
            parent_id = ?iteration.parent_id,
            "appended iteration"
        );
        Ok(())
    }

    /// Get an iteration by id. Fails with `NotFound` when absent.
    pub fn get_iteration(&self, id: &str) -> Result<Iteration> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {ITERATION_COLUMNS} FROM iterations WHERE id = ?1"),
            params![id],
            iteration_from_row,
        )
        .optional()
        .context("failed to get iteration")?
        .ok_or_else(|| Error::iteration_not_found(id))
    }

    /// Every iteration ever created in the session, oldest first.
    ///
    /// This is a flat listing: iterations on abandoned branches are included
    /// even when the current pointer can no longer reach them.
    pub fn list_iterations(&self, session_id: &str) -> Result<Vec<Iteration>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ITERATION_COLUMNS} FROM iterations
                 WHERE session_id = ?1 ORDER BY timestamp ASC, rowid ASC"
            ))
            .context("failed to list iterations")?;
        let rows = stmt
            .query_map(params![session_id], iteration_from_row)
            .context("failed to list iterations")?;

        let mut iterations = Vec::new();
        for row in rows {
            iterations.push(row.context("failed to read iteration row")?);
        }
        Ok(iterations)
    }

    pub fn count_iterations(&self, session_id: &str) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM iterations WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .context("failed to count iterations")?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT
                (SELECT COUNT(*) FROM sessions),
                (SELECT COUNT(*) FROM iterations),
                (SELECT COUNT(*) FROM cost_log)",
            [],
            |row| {
                Ok(StoreStats {
                    sessions: u64::try_from(row.get::<_, i64>(0)?).unwrap_or_default(),
                    iterations: u64::try_from(row.get::<_, i64>(1)?).unwrap_or_default(),
                    cost_entries: u64::try_from(row.get::<_, i64>(2)?).unwrap_or_default(),
                })
            },
        )
        .context("failed to read store statistics")
    }
}

/// Connection lock that disarms the progress handler on release, so the
/// next holder never runs under someone else's token.
struct ConnGuard<'a> {
    conn: MutexGuard<'a, Connection>,
    armed: bool,
}

impl Deref for ConnGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for ConnGuard<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl Drop for ConnGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.conn.progress_handler(0, None::<fn() -> bool>);
        }
    }
}

// ── Row helpers ───────────────────────────────────────────────────

fn insert_session(conn: &Connection, session: &Session) -> Result<()> {
    conn.execute(
        "INSERT INTO sessions (id, name, created_at, updated_at, current_iteration_id, model)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            session.id,
            session.name,
            format_timestamp(&session.created_at),
            format_timestamp(&session.updated_at),
            session.current_iteration_id,
            session.model,
        ],
    )
    .context("failed to create session")?;
    Ok(())
}

fn update_session_row(conn: &Connection, session: &Session) -> Result<()> {
    let rows = conn
        .execute(
            "UPDATE sessions
             SET name = ?2, updated_at = ?3, current_iteration_id = ?4, model = ?5
             WHERE id = ?1",
            params![
                session.id,
                session.name,
                format_timestamp(&session.updated_at),
                session.current_iteration_id,
                session.model,
            ],
        )
        .context("failed to update session")?;
    if rows == 0 {
        return Err(Error::session_not_found(&session.id));
    }
    Ok(())
}

fn insert_iteration(conn: &Connection, iteration: &Iteration) -> Result<()> {
    conn.execute(
        "INSERT INTO iterations (id, session_id, parent_id, operation, prompt, revised_prompt,
                                 model, image_path, timestamp, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            iteration.id,
            iteration.session_id,
            iteration.parent_id,
            iteration.operation.as_str(),
            iteration.prompt,
            iteration.revised_prompt,
            iteration.model,
            iteration.image_path,
            format_timestamp(&iteration.timestamp),
            iteration.metadata.encode(),
        ],
    )
    .context("failed to create iteration")?;
    Ok(())
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: parse_timestamp(2, &row.get::<_, String>(2)?)?,
        updated_at: parse_timestamp(3, &row.get::<_, String>(3)?)?,
        current_iteration_id: row.get(4)?,
        model: row.get(5)?,
    })
}

fn iteration_from_row(row: &Row<'_>) -> rusqlite::Result<Iteration> {
    let operation: String = row.get(3)?;
    let operation = operation
        .parse::<Operation>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, e.into()))?;
    let metadata: Option<String> = row.get(9)?;

    Ok(Iteration {
        id: row.get(0)?,
        session_id: row.get(1)?,
        parent_id: row.get(2)?,
        operation,
        prompt: row.get(4)?,
        revised_prompt: row.get(5)?,
        model: row.get(6)?,
        image_path: row.get(7)?,
        timestamp: parse_timestamp(8, &row.get::<_, String>(8)?)?,
        metadata: IterationMetadata::decode(metadata.as_deref().unwrap_or_default()),
    })
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::NewIteration;
    use chrono::Duration;

    fn iteration_in(session: &Session, parent: Option<&Iteration>, prompt: &str) -> Iteration {
        let new = NewIteration::new(Operation::Generate, prompt);
        Iteration {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            parent_id: parent.map(|p| p.id.clone()),
            operation: new.operation,
            prompt: new.prompt,
            revised_prompt: None,
            model: "gpt-image-1".into(),
            image_path: format!("/tmp/{prompt}.png"),
            timestamp: crate::util::timestamp_now(),
            metadata: IterationMetadata::default(),
        }
    }

    #[test]
    fn create_and_get_session() {
        let store = Store::open_in_memory().unwrap();
        let session = Session::new(Some("logo".into()), "gpt-image-1");
        store.create_session(&session).unwrap();

        let loaded = store.get_session(&session.id).unwrap();
        assert_eq!(loaded, session);
    }

    #[test]
    fn get_session_missing_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        let err = store.get_session("nope").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn update_session_overwrites_mutable_fields() {
        let store = Store::open_in_memory().unwrap();
        let mut session = Session::new(None, "gpt-image-1");
        store.create_session(&session).unwrap();

        session.name = Some("renamed".into());
        session.model = "dall-e-3".into();
        session.updated_at = session.updated_at + Duration::seconds(5);
        store.update_session(&session).unwrap();

        let loaded = store.get_session(&session.id).unwrap();
        assert_eq!(loaded.name.as_deref(), Some("renamed"));
        assert_eq!(loaded.model, "dall-e-3");
        assert_eq!(loaded.updated_at, session.updated_at);
    }

    #[test]
    fn update_session_errors_on_missing_session() {
        let store = Store::open_in_memory().unwrap();
        let session = Session::new(None, "gpt-image-1");
        let err = store.update_session(&session).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn list_sessions_orders_by_recent_activity() {
        let store = Store::open_in_memory().unwrap();
        let base = crate::util::timestamp_now();

        let mut old = Session::new(Some("old".into()), "m");
        old.updated_at = base - Duration::hours(2);
        let mut newest = Session::new(Some("newest".into()), "m");
        newest.updated_at = base;
        let mut middle = Session::new(Some("middle".into()), "m");
        middle.updated_at = base - Duration::hours(1);

        for s in [&old, &newest, &middle] {
            store.create_session(s).unwrap();
        }

        let names: Vec<_> = store
            .list_sessions()
            .unwrap()
            .into_iter()
            .map(|s| s.name.unwrap())
            .collect();
        assert_eq!(names, ["newest", "middle", "old"]);
    }

    #[test]
    fn list_iterations_is_chronological_and_flat() {
        let store = Store::open_in_memory().unwrap();
        let session = Session::new(None, "m");
        store.create_session(&session).unwrap();

        let first = iteration_in(&session, None, "first");
        let mut second = iteration_in(&session, Some(&first), "second");
        second.timestamp = first.timestamp + Duration::milliseconds(10);
        // Sibling of `second`: both children of `first`.
        let mut third = iteration_in(&session, Some(&first), "third");
        third.timestamp = first.timestamp + Duration::milliseconds(20);

        // Insert out of order to prove ordering comes from the timestamp.
        store.create_iteration(&first).unwrap();
        store.create_iteration(&third).unwrap();
        store.create_iteration(&second).unwrap();

        let prompts: Vec<_> = store
            .list_iterations(&session.id)
            .unwrap()
            .into_iter()
            .map(|i| i.prompt)
            .collect();
        assert_eq!(prompts, ["first", "second", "third"]);
        assert_eq!(store.count_iterations(&session.id).unwrap(), 3);
    }

    #[test]
    fn iteration_for_missing_session_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let ghost = Session::new(None, "m");
        let iteration = iteration_in(&ghost, None, "orphan");
        let err = store.create_iteration(&iteration).unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
        assert!(err.to_string().contains("failed to create iteration"));
    }

    #[test]
    fn get_iteration_missing_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        let err = store.get_iteration("missing").unwrap_err();
        assert_eq!(err.to_string(), "iteration not found: missing");
    }

    #[test]
    fn malformed_metadata_does_not_break_reads() {
        let store = Store::open_in_memory().unwrap();
        let session = Session::new(None, "m");
        store.create_session(&session).unwrap();

        let good = iteration_in(&session, None, "good");
        let bad = iteration_in(&session, Some(&good), "bad");
        let empty = iteration_in(&session, Some(&bad), "empty");
        for it in [&good, &bad, &empty] {
            store.create_iteration(it).unwrap();
        }
        {
            let conn = store.conn.lock();
            conn.execute(
                "UPDATE iterations SET metadata = '{broken' WHERE id = ?1",
                params![bad.id],
            )
            .unwrap();
            conn.execute(
                "UPDATE iterations SET metadata = NULL WHERE id = ?1",
                params![empty.id],
            )
            .unwrap();
        }

        let loaded = store.get_iteration(&bad.id).unwrap();
        assert_eq!(loaded.metadata, IterationMetadata::default());
        assert_eq!(store.list_iterations(&session.id).unwrap().len(), 3);
    }

    #[test]
    fn append_iteration_rolls_back_when_session_update_fails() {
        let store = Store::open_in_memory().unwrap();
        let session = Session::new(None, "m");
        store.create_session(&session).unwrap();

        // Session row id does not exist, so the update half fails.
        let stranger = Session::new(None, "m");
        let iteration = iteration_in(&session, None, "lost");
        let err = store.append_iteration(&iteration, &stranger).unwrap_err();
        assert!(err.is_not_found());

        assert!(store.get_iteration(&iteration.id).unwrap_err().is_not_found());
        assert_eq!(store.count_iterations(&session.id).unwrap(), 0);
    }

    #[test]
    fn append_iteration_moves_current_pointer() {
        let store = Store::open_in_memory().unwrap();
        let mut session = Session::new(None, "m");
        store.create_session(&session).unwrap();

        let iteration = iteration_in(&session, None, "one");
        session.current_iteration_id = Some(iteration.id.clone());
        store.append_iteration(&iteration, &session).unwrap();

        let loaded = store.get_session(&session.id).unwrap();
        assert_eq!(loaded.current_iteration_id.as_deref(), Some(iteration.id.as_str()));
    }

    #[test]
    fn delete_session_cascades_to_iterations() {
        let store = Store::open_in_memory().unwrap();
        let session = Session::new(None, "m");
        store.create_session(&session).unwrap();
        let it = iteration_in(&session, None, "x");
        store.create_iteration(&it).unwrap();

        store.delete_session(&session.id).unwrap();
        assert!(store.list_iterations(&session.id).unwrap().is_empty());
        assert!(store.get_iteration(&it.id).unwrap_err().is_not_found());
        assert!(store.delete_session(&session.id).unwrap_err().is_not_found());
    }

    #[test]
    fn schema_migration_adds_model_column() {
        // Simulate an old database whose sessions table predates the model column.
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE sessions (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                current_iteration_id TEXT
            );
            INSERT INTO sessions (id, name, created_at, updated_at)
            VALUES ('legacy', 'old one', '2025-01-01T00:00:00.000000Z', '2025-01-01T00:00:00.000000Z');",
        )
        .unwrap();

        Store::init_schema(&conn).unwrap();
        let store = Store::from_connection(conn, None);

        let legacy = store.get_session("legacy").unwrap();
        assert_eq!(legacy.name.as_deref(), Some("old one"));
        assert_eq!(legacy.model, "");
    }

    #[test]
    fn open_creates_parent_directory_and_persists() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db_path = tmp.path().join("nested").join("imgforge.db");
        let session = Session::new(Some("durable".into()), "m");

        {
            let store = Store::open(&db_path).unwrap();
            assert_eq!(store.path(), Some(db_path.as_path()));
            store.create_session(&session).unwrap();
        }

        let reopened = Store::open(&db_path).unwrap();
        assert_eq!(reopened.get_session(&session.id).unwrap().name.as_deref(), Some("durable"));
    }

    #[test]
    fn cancel_aborts_statement_in_flight() {
        let store = Store::open_in_memory().unwrap();
        let token = CancelToken::new();
        let scoped = store.with_cancel_token(token.clone());

        let worker = std::thread::spawn(move || {
            let conn = scoped.lock()?;
            conn.query_row(
                "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n)
                 SELECT COUNT(*) FROM n",
                [],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to count forever")
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        token.cancel();
        let err = worker.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        // The guard disarmed the handler, so unscoped calls still run.
        assert_eq!(store.stats().unwrap(), StoreStats::default());
    }

    #[test]
    fn cancelled_token_rejects_calls_on_its_handle_only() {
        let store = Store::open_in_memory().unwrap();
        let token = CancelToken::new();
        let scoped = store.with_cancel_token(token.clone());
        let session = Session::new(None, "m");

        scoped.create_session(&session).unwrap();
        token.cancel();

        assert!(matches!(scoped.list_sessions(), Err(Error::Cancelled)));
        assert!(matches!(scoped.get_session(&session.id), Err(Error::Cancelled)));
        assert_eq!(store.get_session(&session.id).unwrap(), session);
        assert_eq!(scoped.path(), store.path());
    }

    #[test]
    fn cancel_interrupts_list_iterations_on_large_session() {
        let store = Store::open_in_memory().unwrap();
        let session = Session::new(None, "m");
        store.create_session(&session).unwrap();
        store
            .conn
            .lock()
            .execute(
                "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 300000)
                 INSERT INTO iterations (id, session_id, operation, prompt, model, image_path,
                                         timestamp, metadata)
                 SELECT 'it-' || x, ?1, 'generate', 'prompt ' || x, 'm', '',
                        '2025-01-01T00:00:00.000000Z', '{}'
                 FROM n",
                params![session.id],
            )
            .unwrap();

        let token = CancelToken::new();
        let worker = {
            let scoped = store.with_cancel_token(token.clone());
            let session_id = session.id.clone();
            std::thread::spawn(move || scoped.list_iterations(&session_id))
        };

        // Wait until the listing owns the connection, then cancel it mid-read.
        while store.conn.try_lock().is_some() && !worker.is_finished() {
            std::thread::yield_now();
        }
        token.cancel();

        let err = worker.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled), "got {err:?}");
        assert_eq!(store.count_iterations(&session.id).unwrap(), 300_000);
    }

    #[test]
    fn stats_counts_rows() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.stats().unwrap(), StoreStats::default());

        let session = Session::new(None, "m");
        store.create_session(&session).unwrap();
        store
            .create_iteration(&iteration_in(&session, None, "a"))
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.iterations, 1);
        assert_eq!(stats.cost_entries, 0);
    }
}
