//! SQLite-backed event store.
//!
//! Timestamps are stored as integer microseconds since the epoch so that
//! `ORDER BY` on them is exact. Every statement runs inside
//! `tokio::task::spawn_blocking` against a single mutex-guarded connection.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use super::EventStore;
use crate::error::StoreError;
use crate::types::{CheckpointEntry, Event, NewEvent};

/// Increment when the schema changes and add a step to `run_migrations`.
const CURRENT_SCHEMA_VERSION: i64 = 1;

pub struct SqliteEventStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEventStore {
    /// Open (or create) the database at `path` and bring the schema up to date.
    ///
    /// Configured with `journal_mode = WAL`, `synchronous = FULL` and a 5s
    /// `busy_timeout`, so concurrent request handlers and a retry pass in
    /// another process can share the file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::new(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| StoreError::new("open database", e.to_string()))?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| StoreError::new("configure journal_mode", e.to_string()))?;
        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            warn!(
                journal_mode = %journal_mode,
                "SQLite did not switch to WAL mode; concurrent writers may see busy errors"
            );
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| StoreError::new("configure pragmas", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::new("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;
        debug!(path = %path_str, "event store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), StoreError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::new(
                "schema version",
                format!(
                    "database schema version {} is newer than supported version {}",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS events (
                    sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                    delivery_id TEXT NOT NULL,
                    signature TEXT NOT NULL,
                    received INTEGER NOT NULL,
                    event TEXT NOT NULL,
                    payload TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_events_delivery_id
                    ON events(delivery_id);

                CREATE TABLE IF NOT EXISTS checkpoint (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    delivery_id TEXT NOT NULL,
                    sequence INTEGER NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_checkpoint_created_at
                    ON checkpoint(created_at);

                CREATE TABLE IF NOT EXISTS failure_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    delivery_id TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_failure_events_delivery_id
                    ON failure_events(delivery_id);
                "#,
            )
            .map_err(|e| StoreError::new("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| StoreError::new("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Run `f` on the blocking pool with the connection locked.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StoreError::new(operation, "connection mutex poisoned"))?;
            f(&*conn).map_err(|e| StoreError::new(operation, e.to_string()))
        })
        .await
        .map_err(|e| StoreError::new(operation, format!("blocking task failed: {e}")))?
    }
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Integer,
            format!("timestamp out of range: {micros}").into(),
        )
    })
}

fn count_to_u64(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn event_exists(&self, delivery_id: &str) -> Result<bool, StoreError> {
        let delivery_id = delivery_id.to_string();
        self.with_conn("event_exists", move |conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM events WHERE delivery_id = ?1)",
                params![delivery_id],
                |row| row.get(0),
            )
        })
        .await
    }

    async fn count_events(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .with_conn("count_events", |conn| {
                conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            })
            .await?;
        Ok(count_to_u64(count))
    }

    async fn append_event(&self, event: NewEvent) -> Result<Event, StoreError> {
        self.with_conn("append_event", move |conn| {
            conn.execute(
                "INSERT INTO events (delivery_id, signature, received, event, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.delivery_id,
                    event.signature,
                    to_micros(event.received),
                    event.event,
                    event.payload,
                ],
            )?;
            let sequence = conn.last_insert_rowid();
            Ok(event.with_sequence(sequence))
        })
        .await
    }

    async fn events_after(
        &self,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let floor = after.unwrap_or(0);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn("events_after", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT sequence, delivery_id, signature, received, event, payload
                 FROM events WHERE sequence > ?1
                 ORDER BY sequence ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![floor, limit], |row| {
                Ok(Event {
                    sequence: row.get(0)?,
                    delivery_id: row.get(1)?,
                    signature: row.get(2)?,
                    received: from_micros(row.get(3)?)?,
                    event: row.get(4)?,
                    payload: row.get(5)?,
                })
            })?;
            let events = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(events)
        })
        .await
    }

    async fn latest_checkpoint(&self) -> Result<Option<CheckpointEntry>, StoreError> {
        self.with_conn("latest_checkpoint", |conn| {
            conn.query_row(
                "SELECT delivery_id, sequence, created_at FROM checkpoint
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                [],
                |row| {
                    Ok(CheckpointEntry {
                        delivery_id: row.get(0)?,
                        sequence: row.get(1)?,
                        created_at: from_micros(row.get(2)?)?,
                    })
                },
            )
            .optional()
        })
        .await
    }

    async fn write_checkpoint(&self, entry: CheckpointEntry) -> Result<(), StoreError> {
        self.with_conn("write_checkpoint", move |conn| {
            conn.execute(
                "INSERT INTO checkpoint (delivery_id, sequence, created_at) VALUES (?1, ?2, ?3)",
                params![entry.delivery_id, entry.sequence, to_micros(entry.created_at)],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_failure(
        &self,
        delivery_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let delivery_id = delivery_id.to_string();
        self.with_conn("record_failure", move |conn| {
            conn.execute(
                "INSERT INTO failure_events (delivery_id, created_at) VALUES (?1, ?2)",
                params![delivery_id, to_micros(at)],
            )?;
            Ok(())
        })
        .await
    }

    async fn count_failures(&self, delivery_id: &str) -> Result<u64, StoreError> {
        let delivery_id = delivery_id.to_string();
        let count: i64 = self
            .with_conn("count_failures", move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM failure_events WHERE delivery_id = ?1",
                    params![delivery_id],
                    |row| row.get(0),
                )
            })
            .await?;
        Ok(count_to_u64(count))
    }
}
