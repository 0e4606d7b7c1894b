use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Thread-safe handle to the local ledger, wrapping a SQLite connection.
///
/// All durable rows live here: receipts, traces, daily quotas, RPM events,
/// sessions, and messages. Writes serialize through the connection mutex;
/// WAL mode keeps readers concurrent.
#[derive(Clone)]
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

impl Ledger {
    /// Open or create the ledger at the given path with WAL mode.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory ledger (for testing).
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Execute a closure with access to the connection.
    ///
    /// Holding the mutex for the whole closure is what serializes the quota
    /// gates' read-check-write sequences.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, rusqlite::Error>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        f(&conn)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })?;
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS receipts (
    id                TEXT PRIMARY KEY,
    ts                TEXT NOT NULL,
    policy            TEXT NOT NULL,
    route_primary     TEXT NOT NULL,
    route_final       TEXT NOT NULL,
    fallback_count    INTEGER NOT NULL DEFAULT 0,
    reasons           TEXT NOT NULL DEFAULT '[]',
    latency_ms        INTEGER NOT NULL DEFAULT 0,
    first_token_ms    INTEGER,
    task_id           TEXT,
    parent_id         TEXT,
    agent             TEXT,
    prompt_tokens     INTEGER NOT NULL DEFAULT 0,
    completion_tokens INTEGER NOT NULL DEFAULT 0,
    cost_usd          REAL NOT NULL DEFAULT 0.0,
    prompt_hash       TEXT NOT NULL,
    policy_hash       TEXT NOT NULL,
    meta              TEXT NOT NULL DEFAULT '{}',
    payload_json      TEXT NOT NULL,
    signature         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_receipts_task ON receipts(task_id, ts);

CREATE TABLE IF NOT EXISTS traces (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    ts            TEXT NOT NULL,
    user_ref      TEXT,
    policy        TEXT NOT NULL,
    route_primary TEXT NOT NULL,
    route_final   TEXT NOT NULL,
    latency_ms    INTEGER NOT NULL,
    tokens        INTEGER NOT NULL DEFAULT 0,
    cost_usd      REAL NOT NULL DEFAULT 0.0
);
CREATE INDEX IF NOT EXISTS idx_traces_route_ts ON traces(route_final, ts DESC);

CREATE TABLE IF NOT EXISTS quotas_daily (
    user_ref TEXT NOT NULL,
    day      TEXT NOT NULL,
    tokens   INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_ref, day)
);

CREATE TABLE IF NOT EXISTS rpm_events (
    user_ref TEXT NOT NULL,
    ts_ms    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rpm_events_user_ts ON rpm_events(user_ref, ts_ms);

CREATE TABLE IF NOT EXISTS sessions (
    id          TEXT PRIMARY KEY,
    created_at  TEXT NOT NULL DEFAULT (datetime('now')),
    user_ref    TEXT NOT NULL,
    agent_name  TEXT NOT NULL,
    policy_name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    role       TEXT NOT NULL CHECK (role IN ('system', 'user', 'assistant')),
    content    TEXT NOT NULL,
    ts         TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, id);
"#;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_creates_schema() {
        let db = Ledger::open_in_memory().unwrap();
        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
                     ('receipts', 'traces', 'quotas_daily', 'rpm_events', 'sessions', 'messages')",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(count, 6);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let db = Ledger::open_in_memory().unwrap();
        // Running the schema a second time must not error.
        db.run_migrations().unwrap();
    }

    #[test]
    fn test_clone_shares_connection() {
        let db = Ledger::open_in_memory().unwrap();
        let db2 = db.clone();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rpm_events (user_ref, ts_ms) VALUES ('u', 1)",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        let count: i64 = db2
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM rpm_events", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(count, 1);
    }
}
