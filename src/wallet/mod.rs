//! Wallet ledger: balances and the transaction log behind bet / win /
//! refund postings (spec §4.7).
//!
//! Grounded on `vault/user_accounts.rs`'s `UserAccountsDB` (SQLite
//! schema shape, `Arc<Mutex<Connection>>` handle, balance-column update
//! alongside an append-only record) and `vault/vault_db.rs`'s
//! `upsert_state` (`INSERT ... ON CONFLICT DO UPDATE`). Unlike the
//! teacher's `f64` USDC balances, amounts here are signed `i64` minor
//! currency units: a recovery sweep re-running a postable action must
//! never accumulate floating-point drift.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    Bet,
    Win,
    Refund,
}

impl TransactionType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Bet => "bet",
            Self::Win => "win",
            Self::Refund => "refund",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WalletTransaction {
    pub order_no: String,
    pub wallet_id: String,
    pub tx_type: TransactionType,
    pub sub_type: String,
    pub amount: i64,
    pub before_balance: i64,
    pub after_balance: i64,
    pub ref_type: String,
    pub ref_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum WalletError {
    InsufficientBalance { wallet_id: String, have: i64, need: i64 },
    DuplicateTransaction { ref_id: String, tx_type: TransactionType },
    Db(rusqlite::Error),
}

impl std::fmt::Display for WalletError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientBalance { wallet_id, have, need } => write!(
                f,
                "wallet {wallet_id} has balance {have} but {need} was requested"
            ),
            Self::DuplicateTransaction { ref_id, tx_type } => write!(
                f,
                "a {} transaction for ref_id {ref_id} already exists",
                tx_type.as_str()
            ),
            Self::Db(e) => write!(f, "wallet database error: {e}"),
        }
    }
}

impl std::error::Error for WalletError {}

impl From<rusqlite::Error> for WalletError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Db(e)
    }
}

/// Posts debits/credits against a wallet and records the transaction
/// log entry in the same atomic step. Expressed as a trait so the
/// session manager never depends on `rusqlite` directly.
#[async_trait]
pub trait WalletRepository: Send + Sync {
    async fn balance(&self, wallet_id: &str) -> Result<i64, WalletError>;

    /// Debit `amount` for a bet. Fails with `InsufficientBalance` if the
    /// wallet cannot cover it.
    async fn debit(
        &self,
        wallet_id: &str,
        amount: i64,
        sub_type: &str,
        ref_id: &str,
    ) -> Result<WalletTransaction, WalletError>;

    /// Credit `amount` for a win exactly once per `ref_id`. A second
    /// call for the same session is the recovery sweep replaying a
    /// completed settlement and must be a no-op, not a double payout
    /// (spec §4.6 idempotency invariant).
    async fn credit_win_once(
        &self,
        wallet_id: &str,
        amount: i64,
        sub_type: &str,
        ref_id: &str,
    ) -> Result<Option<WalletTransaction>, WalletError>;

    /// Credit `amount` back to the wallet for a refund (timeout /
    /// cancellation compensation). Unlike wins, refunds are not
    /// deduplicated by `ref_id` — the recovery engine is responsible for
    /// issuing at most one per session by consulting its own state.
    async fn refund(
        &self,
        wallet_id: &str,
        amount: i64,
        sub_type: &str,
        ref_id: &str,
    ) -> Result<WalletTransaction, WalletError>;

    async fn has_win_transaction(&self, ref_id: &str) -> Result<bool, WalletError>;
}

/// SQLite-backed wallet store.
pub struct SqliteWalletRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteWalletRepository {
    pub fn new(db_path: &str) -> Result<Self, WalletError> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS wallets (
                id TEXT PRIMARY KEY,
                balance INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS wallet_transactions (
                order_no TEXT PRIMARY KEY,
                wallet_id TEXT NOT NULL,
                tx_type TEXT NOT NULL,
                sub_type TEXT NOT NULL,
                amount INTEGER NOT NULL,
                before_balance INTEGER NOT NULL,
                after_balance INTEGER NOT NULL,
                ref_type TEXT NOT NULL,
                ref_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_wallet_tx_win_once
             ON wallet_transactions(ref_id) WHERE tx_type = 'win'",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_wallet_tx_wallet ON wallet_transactions(wallet_id)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn ensure_wallet(conn: &Connection, wallet_id: &str) -> Result<i64, rusqlite::Error> {
        conn.execute(
            "INSERT OR IGNORE INTO wallets (id, balance) VALUES (?1, 0)",
            params![wallet_id],
        )?;
        conn.query_row(
            "SELECT balance FROM wallets WHERE id = ?1",
            params![wallet_id],
            |row| row.get(0),
        )
    }

    fn post(
        conn: &mut Connection,
        wallet_id: &str,
        tx_type: TransactionType,
        signed_amount: i64,
        sub_type: &str,
        ref_id: &str,
    ) -> Result<WalletTransaction, rusqlite::Error> {
        let tx = conn.transaction()?;
        let before = Self::ensure_wallet(&tx, wallet_id)?;
        let after = before + signed_amount;

        tx.execute(
            "UPDATE wallets SET balance = ?1 WHERE id = ?2",
            params![after, wallet_id],
        )?;

        let order_no = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        tx.execute(
            "INSERT INTO wallet_transactions
                (order_no, wallet_id, tx_type, sub_type, amount, before_balance, after_balance, ref_type, ref_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'game_session', ?8, 'completed', ?9)",
            params![
                order_no,
                wallet_id,
                tx_type.as_str(),
                sub_type,
                signed_amount,
                before,
                after,
                ref_id,
                created_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        Ok(WalletTransaction {
            order_no,
            wallet_id: wallet_id.to_string(),
            tx_type,
            sub_type: sub_type.to_string(),
            amount: signed_amount,
            before_balance: before,
            after_balance: after,
            ref_type: "game_session".to_string(),
            ref_id: ref_id.to_string(),
            status: "completed".to_string(),
            created_at,
        })
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl WalletRepository for SqliteWalletRepository {
    async fn balance(&self, wallet_id: &str) -> Result<i64, WalletError> {
        let conn = self.conn.lock().await;
        Ok(Self::ensure_wallet(&conn, wallet_id)?)
    }

    async fn debit(
        &self,
        wallet_id: &str,
        amount: i64,
        sub_type: &str,
        ref_id: &str,
    ) -> Result<WalletTransaction, WalletError> {
        let mut conn = self.conn.lock().await;
        let balance = Self::ensure_wallet(&conn, wallet_id)?;
        if balance < amount {
            return Err(WalletError::InsufficientBalance {
                wallet_id: wallet_id.to_string(),
                have: balance,
                need: amount,
            });
        }
        Ok(Self::post(&mut conn, wallet_id, TransactionType::Bet, -amount, sub_type, ref_id)?)
    }

    async fn credit_win_once(
        &self,
        wallet_id: &str,
        amount: i64,
        sub_type: &str,
        ref_id: &str,
    ) -> Result<Option<WalletTransaction>, WalletError> {
        let mut conn = self.conn.lock().await;
        match Self::post(&mut conn, wallet_id, TransactionType::Win, amount, sub_type, ref_id) {
            Ok(tx) => Ok(Some(tx)),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn refund(
        &self,
        wallet_id: &str,
        amount: i64,
        sub_type: &str,
        ref_id: &str,
    ) -> Result<WalletTransaction, WalletError> {
        let mut conn = self.conn.lock().await;
        Ok(Self::post(&mut conn, wallet_id, TransactionType::Refund, amount, sub_type, ref_id)?)
    }

    async fn has_win_transaction(&self, ref_id: &str) -> Result<bool, WalletError> {
        let conn = self.conn.lock().await;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM wallet_transactions WHERE ref_id = ?1 AND tx_type = 'win' LIMIT 1",
                params![ref_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}
