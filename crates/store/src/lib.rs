//! flora-store
//!
//! Relational persistence for the consumer. Two tables carry everything:
//!
//! ```text
//! app_state(key TEXT PRIMARY KEY, value TEXT)
//! consensus_entries(epoch INTEGER PRIMARY KEY, state_hash, price,
//!                   timestamp, participants JSON, sources JSON,
//!                   hcs_message, consensus_timestamp, sequence_number)
//! ```
//!
//! `consensus_entries` upserts on `epoch`; log metadata columns are filled
//! with `COALESCE`, so a value that has been set once can never be
//! overwritten. Secret values in `app_state` are sealed (`enc:v1:...`)
//! before they reach the database and opened transparently on read.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

use flora_common::secrets::{self, SecretError};
use flora_common::{ConsensusEntry, ConsensusTimestamp, SourcePrice};

const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Well-known `app_state` keys.
pub mod state_keys {
    /// Shared epoch origin, unix milliseconds, persisted on first boot.
    pub const EPOCH_ORIGIN_MS: &str = "epoch_origin_ms";
    /// JSON map petal label → account id.
    pub const PETAL_BINDINGS: &str = "petal_bindings";
    /// JSON list of flora topic ids, as provisioned at bootstrap.
    pub const FLORA_TOPICS: &str = "flora_topics";
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored JSON is corrupt: {0}")]
    Json(#[from] serde_json::Error),
    #[error("secret state: {0}")]
    Secret(#[from] SecretError),
    #[error("secret state requires key material (PETAL_KEY_SECRET)")]
    MissingKeyMaterial,
}

/// Append-only consensus history plus small key/value bootstrap state.
pub struct HistoryStore {
    conn: Mutex<Connection>,
    key: Option<[u8; 32]>,
}

impl HistoryStore {
    /// Open (and migrate) the store at `path`. `secret` is the AEAD key
    /// material for sealed `app_state` values; without it, secret reads
    /// and writes raise.
    pub fn open(path: impl AsRef<Path>, secret: Option<&str>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, secret)
    }

    /// In-memory store for tests.
    pub fn open_in_memory(secret: Option<&str>) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, secret)
    }

    fn with_connection(conn: Connection, secret: Option<&str>) -> Result<Self, StoreError> {
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS app_state (
                 key   TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS consensus_entries (
                 epoch               INTEGER PRIMARY KEY,
                 state_hash          TEXT NOT NULL,
                 price               DOUBLE NOT NULL,
                 timestamp           TEXT NOT NULL,
                 participants        TEXT NOT NULL,
                 sources             TEXT NOT NULL,
                 hcs_message         TEXT,
                 consensus_timestamp TEXT,
                 sequence_number     INTEGER
             );",
        )?;
        Ok(Self { conn: Mutex::new(conn), key: secret.map(secrets::derive_key) })
    }

    // ── app_state ───────────────────────────────────────────────────────

    /// Read a state value, opening sealed values transparently.
    pub fn get_state(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row("SELECT value FROM app_state WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        match raw {
            None => Ok(None),
            Some(value) if secrets::is_sealed(&value) => {
                let aead = self.key.as_ref().ok_or(StoreError::MissingKeyMaterial)?;
                Ok(Some(secrets::open(aead, &value)?))
            }
            Some(value) => Ok(Some(value)),
        }
    }

    /// Write a plain state value.
    pub fn put_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT INTO app_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Seal and write a secret state value.
    pub fn put_secret_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let aead = self.key.as_ref().ok_or(StoreError::MissingKeyMaterial)?;
        let sealed = secrets::seal(aead, value)?;
        self.put_state(key, &sealed)
    }

    // ── consensus_entries ───────────────────────────────────────────────

    /// Upsert an entry on `epoch`. Metadata columns only ever move from
    /// NULL to a value.
    pub fn upsert_entry(&self, entry: &ConsensusEntry) -> Result<(), StoreError> {
        let participants = serde_json::to_string(&entry.participants)?;
        let sources = serde_json::to_string(&entry.sources)?;
        self.conn.lock().execute(
            "INSERT INTO consensus_entries
                 (epoch, state_hash, price, timestamp, participants, sources,
                  hcs_message, consensus_timestamp, sequence_number)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(epoch) DO UPDATE SET
                 state_hash          = excluded.state_hash,
                 price               = excluded.price,
                 timestamp           = excluded.timestamp,
                 participants        = excluded.participants,
                 sources             = excluded.sources,
                 hcs_message         = COALESCE(consensus_entries.hcs_message, excluded.hcs_message),
                 consensus_timestamp = COALESCE(consensus_entries.consensus_timestamp, excluded.consensus_timestamp),
                 sequence_number     = COALESCE(consensus_entries.sequence_number, excluded.sequence_number)",
            params![
                entry.epoch,
                entry.state_hash,
                entry.price,
                entry.timestamp,
                participants,
                sources,
                entry.hcs_message,
                entry.consensus_timestamp,
                entry.sequence_number,
            ],
        )?;
        debug!(epoch = entry.epoch, state_hash = %entry.state_hash, "persisted consensus entry");
        Ok(())
    }

    /// Fill log metadata for an epoch, exactly once per column.
    pub fn fill_metadata(
        &self,
        epoch: i64,
        hcs_message: &str,
        consensus_timestamp: &str,
        sequence_number: u64,
    ) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "UPDATE consensus_entries SET
                 hcs_message         = COALESCE(hcs_message, ?2),
                 consensus_timestamp = COALESCE(consensus_timestamp, ?3),
                 sequence_number     = COALESCE(sequence_number, ?4)
             WHERE epoch = ?1",
            params![epoch, hcs_message, consensus_timestamp, sequence_number],
        )?;
        Ok(())
    }

    /// One entry by epoch.
    pub fn entry(&self, epoch: i64) -> Result<Option<ConsensusEntry>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT epoch, state_hash, price, timestamp, participants, sources,
                    hcs_message, consensus_timestamp, sequence_number
             FROM consensus_entries WHERE epoch = ?1",
        )?;
        let row = stmt
            .query_row(params![epoch], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, Option<i64>>(8)?,
                ))
            })
            .optional()?;
        row.map(Self::entry_from_row).transpose()
    }

    /// All entries, sorted ascending by epoch.
    pub fn load_entries(&self) -> Result<Vec<ConsensusEntry>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT epoch, state_hash, price, timestamp, participants, sources,
                    hcs_message, consensus_timestamp, sequence_number
             FROM consensus_entries ORDER BY epoch ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<i64>>(8)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(Self::entry_from_row(row?)?);
        }
        Ok(entries)
    }

    /// Newest persisted consensus timestamp, for the tailer's initial
    /// cursor.
    pub fn latest_consensus_timestamp(&self) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT consensus_timestamp FROM consensus_entries
             WHERE consensus_timestamp IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut newest: Option<(ConsensusTimestamp, String)> = None;
        for row in rows {
            let raw = row?;
            if let Some(parsed) = ConsensusTimestamp::parse(&raw) {
                if newest.as_ref().map_or(true, |(best, _)| parsed > *best) {
                    newest = Some((parsed, raw));
                }
            }
        }
        Ok(newest.map(|(_, raw)| raw))
    }

    #[allow(clippy::type_complexity)]
    fn entry_from_row(
        row: (i64, String, f64, String, String, String, Option<String>, Option<String>, Option<i64>),
    ) -> Result<ConsensusEntry, StoreError> {
        let participants: Vec<String> = serde_json::from_str(&row.4)?;
        let sources: Vec<SourcePrice> = serde_json::from_str(&row.5)?;
        Ok(ConsensusEntry {
            epoch: row.0,
            state_hash: row.1,
            price: row.2,
            timestamp: row.3,
            participants,
            sources,
            hcs_message: row.6,
            consensus_timestamp: row.7,
            sequence_number: row.8.map(|n| n as u64),
        })
    }
}
