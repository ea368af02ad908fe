//! Offline fallback mirror — batched SQLite writes
//!
//! The local analogue of the backend: a key/value table with two fixed
//! keys holding JSON payloads of the session list and the ICP models.
//! Uses `spawn_blocking` for async-safe SQLite access and batches writes
//! so bursts of store mutations cost one transaction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use gtmintel_protocol::{IcpModel, Session};

use crate::error::CacheError;

pub const SESSIONS_KEY: &str = "sessions";
pub const ICP_MODELS_KEY: &str = "icp-models";

/// Mirror writes issued by the store
#[derive(Debug, Clone)]
pub enum CacheCommand {
    SaveSessions(Vec<Session>),
    SaveIcpModels(Vec<IcpModel>),
}

/// Create the channel feeding a [`CacheWriter`]
pub fn create_cache_channel() -> (mpsc::Sender<CacheCommand>, mpsc::Receiver<CacheCommand>) {
    mpsc::channel(256)
}

/// Cache writer that batches SQLite writes
pub struct CacheWriter {
    rx: mpsc::Receiver<CacheCommand>,
    db_path: PathBuf,
    batch: Vec<CacheCommand>,
    batch_size: usize,
    flush_interval: Duration,
}

impl CacheWriter {
    pub fn new(rx: mpsc::Receiver<CacheCommand>, db_path: PathBuf) -> Self {
        Self {
            rx,
            db_path,
            batch: Vec::with_capacity(32),
            batch_size: 16,
            flush_interval: Duration::from_millis(250),
        }
    }

    /// Run the cache writer (call from `tokio::spawn`). Exits when the
    /// sending side closes, flushing whatever is pending.
    pub async fn run(mut self) {
        info!(
            component = "cache",
            event = "cache.writer.started",
            db_path = %self.db_path.display(),
            "Cache writer started"
        );

        let mut interval = tokio::time::interval(self.flush_interval);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            self.batch.push(cmd);
                            if self.batch.len() >= self.batch_size {
                                self.flush().await;
                            }
                        }
                        None => {
                            self.flush().await;
                            break;
                        }
                    }
                }

                _ = interval.tick() => {
                    if !self.batch.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.batch);
        let db_path = self.db_path.clone();

        let result = tokio::task::spawn_blocking(move || flush_batch(&db_path, batch)).await;

        match result {
            Ok(Ok(count)) => {
                debug!(
                    component = "cache",
                    event = "cache.flush.ok",
                    count,
                    "Mirrored {} writes", count
                );
            }
            Ok(Err(e)) => {
                error!(
                    component = "cache",
                    event = "cache.flush.failed",
                    error = %e,
                    "Cache flush failed"
                );
            }
            Err(e) => {
                error!(
                    component = "cache",
                    event = "cache.flush.panicked",
                    error = %e,
                    "spawn_blocking panicked"
                );
            }
        }
    }
}

fn open(db_path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;
         CREATE TABLE IF NOT EXISTS offline_cache (
             key TEXT PRIMARY KEY,
             payload TEXT NOT NULL,
             saved_at TEXT NOT NULL
         );",
    )?;
    Ok(conn)
}

/// Flush a batch to SQLite (runs in a blocking thread). Only the latest
/// payload per key matters, so earlier writes in the batch are skipped.
fn flush_batch(db_path: &Path, batch: Vec<CacheCommand>) -> Result<usize, CacheError> {
    let conn = open(db_path)?;

    let mut latest_sessions = None;
    let mut latest_models = None;
    for cmd in batch {
        match cmd {
            CacheCommand::SaveSessions(sessions) => latest_sessions = Some(sessions),
            CacheCommand::SaveIcpModels(models) => latest_models = Some(models),
        }
    }

    let now = chrono::Utc::now().to_rfc3339();
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;

    if let Some(sessions) = latest_sessions {
        let payload = serde_json::to_string(&sessions)?;
        tx.execute(
            "INSERT OR REPLACE INTO offline_cache (key, payload, saved_at) VALUES (?1, ?2, ?3)",
            params![SESSIONS_KEY, payload, now],
        )?;
        count += 1;
    }
    if let Some(models) = latest_models {
        let payload = serde_json::to_string(&models)?;
        tx.execute(
            "INSERT OR REPLACE INTO offline_cache (key, payload, saved_at) VALUES (?1, ?2, ?3)",
            params![ICP_MODELS_KEY, payload, now],
        )?;
        count += 1;
    }

    tx.commit()?;
    Ok(count)
}

fn load_payload(db_path: &Path, key: &str) -> Result<Option<String>, CacheError> {
    if !db_path.exists() {
        return Ok(None);
    }
    let conn = open(db_path)?;
    let payload = conn
        .query_row(
            "SELECT payload FROM offline_cache WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(payload)
}

/// Load the cached session list. Date fields revive from their string
/// form; legacy single-string queries normalize through the Session
/// deserializer. Blocking — call from `spawn_blocking`.
pub fn load_sessions(db_path: &Path) -> Result<Vec<Session>, CacheError> {
    match load_payload(db_path, SESSIONS_KEY)? {
        Some(payload) => Ok(serde_json::from_str(&payload)?),
        None => Ok(Vec::new()),
    }
}

/// Load the cached ICP models. Blocking — call from `spawn_blocking`.
pub fn load_icp_models(db_path: &Path) -> Result<Vec<IcpModel>, CacheError> {
    match load_payload(db_path, ICP_MODELS_KEY)? {
        Some(payload) => Ok(serde_json::from_str(&payload)?),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn session(id: &str) -> Session {
        Session::new(id.to_string(), format!("session {}", id), Utc::now())
    }

    #[tokio::test]
    async fn writer_round_trips_sessions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("cache.db");

        let (tx, rx) = create_cache_channel();
        let writer = CacheWriter::new(rx, db_path.clone());
        let handle = tokio::spawn(writer.run());

        tx.send(CacheCommand::SaveSessions(vec![session("s1"), session("s2")]))
            .await
            .expect("send");
        drop(tx); // closes the channel; writer flushes and exits
        handle.await.expect("writer task");

        let loaded = load_sessions(&db_path).expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "s1");
        assert!(loaded[0].query.is_empty());
    }

    #[tokio::test]
    async fn later_write_wins_within_one_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("cache.db");

        let (tx, rx) = create_cache_channel();
        let writer = CacheWriter::new(rx, db_path.clone());
        let handle = tokio::spawn(writer.run());

        tx.send(CacheCommand::SaveSessions(vec![session("old")]))
            .await
            .expect("send");
        tx.send(CacheCommand::SaveSessions(vec![session("new-1"), session("new-2")]))
            .await
            .expect("send");
        drop(tx);
        handle.await.expect("writer task");

        let loaded = load_sessions(&db_path).expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "new-1");
    }

    #[tokio::test]
    async fn missing_db_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("never-written.db");
        assert!(load_sessions(&db_path).expect("load").is_empty());
        assert!(load_icp_models(&db_path).expect("load").is_empty());
    }

    #[test]
    fn legacy_string_query_revives_as_sequence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("cache.db");

        // Simulate an old cache written before query became a sequence.
        let conn = open(&db_path).expect("open");
        let legacy = r#"[{"id":"s1","name":"old","createdAt":"2025-06-01T00:00:00Z","query":"solo query"}]"#;
        conn.execute(
            "INSERT INTO offline_cache (key, payload, saved_at) VALUES (?1, ?2, ?3)",
            params![SESSIONS_KEY, legacy, "2025-06-01T00:00:00Z"],
        )
        .expect("insert");

        let loaded = load_sessions(&db_path).expect("load");
        assert_eq!(loaded[0].query, vec!["solo query"]);
        assert_eq!(loaded[0].created_at.to_rfc3339(), "2025-06-01T00:00:00+00:00");
    }
}
