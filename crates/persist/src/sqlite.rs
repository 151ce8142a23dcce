//! SQLite-backed rollout records for runs outside a cluster.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use rollwatch_core::{Phase, WorkloadKey};
use rusqlite::OptionalExtension;
use tracing::debug;

use crate::{PersistError, PersistedRolloutRecord, RolloutStore};

#[derive(Clone)]
pub struct SqliteRolloutStore {
    db: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteRolloutStore {
    pub fn open_default() -> Result<Self, PersistError> {
        let path = std::env::var("ROLLWATCH_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self, PersistError> {
        let started = Instant::now();
        let db = rusqlite::Connection::open(path)?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS rollout_state (
                namespace         TEXT NOT NULL,
                name              TEXT NOT NULL,
                kind              TEXT NOT NULL,
                rollout_started   TEXT,
                version           TEXT NOT NULL,
                previous_version  TEXT NOT NULL,
                last_sent_version TEXT NOT NULL,
                last_sent_phase   TEXT,
                last_sent_at      TEXT,
                PRIMARY KEY (namespace, name, kind)
            )",
            [],
        )?;
        histogram!("rollwatch_persist_open_ms").record(started.elapsed().as_secs_f64() * 1000.0);
        debug!(path, "sqlite rollout store opened");
        Ok(Self { db: Arc::new(Mutex::new(db)) })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_db<T, F>(&self, f: F) -> Result<T, PersistError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T, PersistError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().unwrap_or_else(PoisonError::into_inner);
            f(&conn)
        })
        .await
        .map_err(|e| PersistError::Task(e.to_string()))?
    }
}

fn ts(v: Option<DateTime<Utc>>) -> Option<String> { v.map(|t| t.to_rfc3339()) }

fn parse_ts(key: &WorkloadKey, v: Option<String>) -> Result<Option<DateTime<Utc>>, PersistError> {
    v.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| PersistError::Corrupt { key: key.to_string(), reason: e.to_string() })
    })
    .transpose()
}

#[async_trait]
impl RolloutStore for SqliteRolloutStore {
    async fn get(&self, key: &WorkloadKey) -> Result<Option<PersistedRolloutRecord>, PersistError> {
        let started = Instant::now();
        let k = key.clone();
        let row = self
            .with_db(move |db| {
                let row = db
                    .query_row(
                        "SELECT rollout_started, version, previous_version, last_sent_version, last_sent_phase, last_sent_at
                         FROM rollout_state WHERE namespace = ?1 AND name = ?2 AND kind = ?3",
                        (&k.namespace, &k.name, k.kind.as_str()),
                        |r| {
                            Ok((
                                r.get::<_, Option<String>>(0)?,
                                r.get::<_, String>(1)?,
                                r.get::<_, String>(2)?,
                                r.get::<_, String>(3)?,
                                r.get::<_, Option<String>>(4)?,
                                r.get::<_, Option<String>>(5)?,
                            ))
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        histogram!("rollwatch_persist_get_ms", "backend" => "sqlite").record(started.elapsed().as_secs_f64() * 1000.0);
        let Some((rollout_started, version, previous_version, last_sent_version, phase, last_sent_at)) = row else {
            return Ok(None);
        };
        Ok(Some(PersistedRolloutRecord {
            rollout_started: parse_ts(key, rollout_started)?,
            version,
            previous_version,
            last_sent_version,
            last_sent_phase: phase.as_deref().and_then(Phase::parse),
            last_sent_at: parse_ts(key, last_sent_at)?,
        }))
    }

    async fn upsert(&self, key: &WorkloadKey, record: &PersistedRolloutRecord) -> Result<(), PersistError> {
        let started = Instant::now();
        let (k, rec) = (key.clone(), record.clone());
        self.with_db(move |db| {
            db.execute(
                "INSERT INTO rollout_state
                    (namespace, name, kind, rollout_started, version, previous_version, last_sent_version, last_sent_phase, last_sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(namespace, name, kind) DO UPDATE SET
                    rollout_started = excluded.rollout_started,
                    version = excluded.version,
                    previous_version = excluded.previous_version,
                    last_sent_version = excluded.last_sent_version,
                    last_sent_phase = excluded.last_sent_phase,
                    last_sent_at = excluded.last_sent_at",
                (
                    &k.namespace,
                    &k.name,
                    k.kind.as_str(),
                    ts(rec.rollout_started),
                    &rec.version,
                    &rec.previous_version,
                    &rec.last_sent_version,
                    rec.last_sent_phase.map(|p| p.as_str()),
                    ts(rec.last_sent_at),
                ),
            )?;
            Ok(())
        })
        .await?;
        histogram!("rollwatch_persist_put_ms", "backend" => "sqlite").record(started.elapsed().as_secs_f64() * 1000.0);
        counter!("rollwatch_persist_put_total", "backend" => "sqlite").increment(1);
        Ok(())
    }

    async fn delete(&self, key: &WorkloadKey) -> Result<(), PersistError> {
        let k = key.clone();
        self.with_db(move |db| {
            db.execute(
                "DELETE FROM rollout_state WHERE namespace = ?1 AND name = ?2 AND kind = ?3",
                (&k.namespace, &k.name, k.kind.as_str()),
            )?;
            Ok(())
        })
        .await
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".rollwatch");
        let _ = std::fs::create_dir_all(&p);
        p.push("rollouts.db");
        return p.to_string_lossy().to_string();
    }
    "rollouts.db".to_string()
}
