//! Session snapshot persistence (spec §4.4). One capability set across
//! three backends — in-memory, relational, and a two-tier cache
//! decorator — expressed as a trait rather than an inheritance
//! hierarchy (design note §9). Grounded on `vault/vault_db.rs`'s
//! `VaultDb` (`Arc<Mutex<Connection>>`, `INSERT ... ON CONFLICT DO
//! UPDATE` upsert) for the relational backend.

use crate::session::state_machine::GamePhase;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Opaque state-machine extras carried alongside a snapshot (spec §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionExtras {
    pub error_message: Option<String>,
    pub spin_digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub user_id: String,
    pub current_state: GamePhase,
    pub bet_amount: i64,
    pub win_amount: i64,
    pub last_update: DateTime<Utc>,
    pub extras: SessionExtras,
}

impl SessionSnapshot {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>, bet_amount: i64, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            current_state: GamePhase::Idle,
            bet_amount,
            win_amount: 0,
            last_update: now,
            extras: SessionExtras::default(),
        }
    }
}

#[derive(Debug)]
pub enum StoreError {
    NotFound,
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "session snapshot not found"),
            Self::Backend(msg) => write!(f, "session store backend error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StoreError>;
    async fn load(&self, session_id: &str) -> Result<SessionSnapshot, StoreError>;
    async fn delete(&self, session_id: &str) -> Result<(), StoreError>;
    /// All snapshots whose `last_update` is strictly older than `older_than`.
    async fn find_expired(&self, older_than: DateTime<Utc>) -> Result<Vec<SessionSnapshot>, StoreError>;
}

/// Test/in-process backend.
#[derive(Default)]
pub struct InMemorySessionStore {
    rows: parking_lot::Mutex<HashMap<String, SessionSnapshot>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StoreError> {
        self.rows.lock().insert(snapshot.session_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<SessionSnapshot, StoreError> {
        self.rows.lock().get(session_id).cloned().ok_or(StoreError::NotFound)
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        self.rows.lock().remove(session_id);
        Ok(())
    }

    async fn find_expired(&self, older_than: DateTime<Utc>) -> Result<Vec<SessionSnapshot>, StoreError> {
        Ok(self
            .rows
            .lock()
            .values()
            .filter(|s| s.last_update < older_than)
            .cloned()
            .collect())
    }
}

/// SQLite-backed relational backend; extras serialize as a JSON blob.
pub struct SqliteSessionStore {
    conn: Arc<AsyncMutex<Connection>>,
}

impl SqliteSessionStore {
    pub fn new(db_path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS session_snapshots (
                session_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                current_state TEXT NOT NULL,
                bet_amount INTEGER NOT NULL,
                win_amount INTEGER NOT NULL,
                last_update TEXT NOT NULL,
                extras TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_session_snapshots_last_update ON session_snapshots(last_update)",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(AsyncMutex::new(conn)),
        })
    }

    fn row_to_snapshot(
        session_id: String,
        user_id: String,
        current_state: String,
        bet_amount: i64,
        win_amount: i64,
        last_update: String,
        extras: String,
    ) -> Result<SessionSnapshot, StoreError> {
        Ok(SessionSnapshot {
            session_id,
            user_id,
            current_state: GamePhase::parse(&current_state)
                .map_err(|_| StoreError::Backend(format!("unknown persisted state {current_state}")))?,
            bet_amount,
            win_amount,
            last_update: DateTime::parse_from_rfc3339(&last_update)
                .map_err(|e| StoreError::Backend(e.to_string()))?
                .with_timezone(&Utc),
            extras: serde_json::from_str(&extras)?,
        })
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let extras = serde_json::to_string(&snapshot.extras)?;
        conn.execute(
            "INSERT INTO session_snapshots
                (session_id, user_id, current_state, bet_amount, win_amount, last_update, extras)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(session_id) DO UPDATE SET
                user_id = excluded.user_id,
                current_state = excluded.current_state,
                bet_amount = excluded.bet_amount,
                win_amount = excluded.win_amount,
                last_update = excluded.last_update,
                extras = excluded.extras",
            params![
                snapshot.session_id,
                snapshot.user_id,
                snapshot.current_state.as_str(),
                snapshot.bet_amount,
                snapshot.win_amount,
                snapshot.last_update.to_rfc3339(),
                extras,
            ],
        )?;
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<SessionSnapshot, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT session_id, user_id, current_state, bet_amount, win_amount, last_update, extras
             FROM session_snapshots WHERE session_id = ?1",
            params![session_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?
        .ok_or(StoreError::NotFound)
        .and_then(|(id, user, state, bet, win, last, extras)| {
            Self::row_to_snapshot(id, user, state, bet, win, last, extras)
        })
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM session_snapshots WHERE session_id = ?1", params![session_id])?;
        Ok(())
    }

    async fn find_expired(&self, older_than: DateTime<Utc>) -> Result<Vec<SessionSnapshot>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT session_id, user_id, current_state, bet_amount, win_amount, last_update, extras
             FROM session_snapshots WHERE last_update < ?1",
        )?;
        let rows = stmt.query_map(params![older_than.to_rfc3339()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, user, state, bet, win, last, extras) = row?;
            out.push(Self::row_to_snapshot(id, user, state, bet, win, last, extras)?);
        }
        Ok(out)
    }
}

/// Fronts a slow `primary` backend with a fast `cache`. Reads try the
/// cache first and fall through on a miss, repopulating it; writes go
/// to the primary and best-effort to the cache; deletes remove from
/// both (spec §4.4).
pub struct TwoTierSessionStore {
    primary: Arc<dyn SessionStore>,
    cache: Arc<dyn SessionStore>,
}

impl TwoTierSessionStore {
    pub fn new(primary: Arc<dyn SessionStore>, cache: Arc<dyn SessionStore>) -> Self {
        Self { primary, cache }
    }
}

#[async_trait]
impl SessionStore for TwoTierSessionStore {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StoreError> {
        self.primary.save(snapshot).await?;
        let _ = self.cache.save(snapshot).await;
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<SessionSnapshot, StoreError> {
        if let Ok(hit) = self.cache.load(session_id).await {
            return Ok(hit);
        }
        let snapshot = self.primary.load(session_id).await?;
        let _ = self.cache.save(&snapshot).await;
        Ok(snapshot)
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        let primary_result = self.primary.delete(session_id).await;
        let _ = self.cache.delete(session_id).await;
        primary_result
    }

    async fn find_expired(&self, older_than: DateTime<Utc>) -> Result<Vec<SessionSnapshot>, StoreError> {
        self.primary.find_expired(older_than).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn snap(id: &str, state: GamePhase, last_update: DateTime<Utc>) -> SessionSnapshot {
        let mut s = SessionSnapshot::new(id, "user-1", 100, last_update);
        s.current_state = state;
        s
    }

    #[tokio::test]
    async fn in_memory_save_then_load_round_trips() {
        let store = InMemorySessionStore::new();
        let snapshot = snap("s1", GamePhase::Ready, Utc::now());
        store.save(&snapshot).await.unwrap();
        let loaded = store.load("s1").await.unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn in_memory_load_missing_is_not_found() {
        let store = InMemorySessionStore::new();
        assert!(matches!(store.load("missing").await, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn find_expired_filters_by_last_update() {
        let store = InMemorySessionStore::new();
        let now = Utc::now();
        store.save(&snap("stale", GamePhase::Ready, now - Duration::hours(1))).await.unwrap();
        store.save(&snap("fresh", GamePhase::Ready, now)).await.unwrap();
        let expired = store.find_expired(now - Duration::minutes(5)).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].session_id, "stale");
    }

    #[tokio::test]
    async fn two_tier_populates_cache_on_miss_and_clears_both_on_delete() {
        let primary = Arc::new(InMemorySessionStore::new());
        let cache = Arc::new(InMemorySessionStore::new());
        let two_tier = TwoTierSessionStore::new(primary.clone(), cache.clone());

        let snapshot = snap("s1", GamePhase::Ready, Utc::now());
        primary.save(&snapshot).await.unwrap();

        let loaded = two_tier.load("s1").await.unwrap();
        assert_eq!(loaded, snapshot);
        assert!(cache.load("s1").await.is_ok(), "cache should be populated after a miss");

        two_tier.delete("s1").await.unwrap();
        assert!(primary.load("s1").await.is_err());
        assert!(cache.load("s1").await.is_err());
    }
}
