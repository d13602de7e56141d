//! Recovery engine: per-state continuations that bring a reloaded or
//! stale session snapshot back to a consistent phase, with compensating
//! wallet transactions where the table calls for them (spec §4.6).

use super::state_machine::{GameEvent, GamePhase, StateMachine, TransitionError};
use super::store::{SessionSnapshot, SessionStore, StoreError};
use crate::clock::SharedClock;
use crate::wallet::{WalletError, WalletRepository};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug)]
pub enum RecoveryError {
    SessionNotFound,
    SessionExpired,
    Store(StoreError),
    Wallet(WalletError),
    Transition(TransitionError),
}

impl std::fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionNotFound => write!(f, "no session snapshot for this session_id"),
            Self::SessionExpired => write!(f, "session snapshot exceeded its timeout and was deleted"),
            Self::Store(e) => write!(f, "session store error during recovery: {e}"),
            Self::Wallet(e) => write!(f, "wallet error during recovery: {e}"),
            Self::Transition(e) => write!(f, "state transition error during recovery: {e}"),
        }
    }
}

impl std::error::Error for RecoveryError {}

impl From<StoreError> for RecoveryError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<WalletError> for RecoveryError {
    fn from(e: WalletError) -> Self {
        Self::Wallet(e)
    }
}

impl From<TransitionError> for RecoveryError {
    fn from(e: TransitionError) -> Self {
        Self::Transition(e)
    }
}

pub struct RecoveryEngine {
    store: Arc<dyn SessionStore>,
    wallet: Arc<dyn WalletRepository>,
    state_machine: StateMachine,
    clock: SharedClock,
    session_timeout: Duration,
    ready_stale_limit: Duration,
}

impl RecoveryEngine {
    pub fn new(
        store: Arc<dyn SessionStore>,
        wallet: Arc<dyn WalletRepository>,
        state_machine: StateMachine,
        clock: SharedClock,
        session_timeout: Duration,
        ready_stale_limit: Duration,
    ) -> Self {
        Self {
            store,
            wallet,
            state_machine,
            clock,
            session_timeout,
            ready_stale_limit,
        }
    }

    /// On-demand reattach for a single session (spec §4.6 entry a).
    pub async fn recover_session(&self, session_id: &str) -> Result<SessionSnapshot, RecoveryError> {
        let mut snapshot = match self.store.load(session_id).await {
            Ok(s) => s,
            Err(StoreError::NotFound) => return Err(RecoveryError::SessionNotFound),
            Err(e) => return Err(e.into()),
        };

        let age = self.clock.now() - snapshot.last_update;
        if age > chrono::Duration::from_std(self.session_timeout).unwrap_or(chrono::Duration::zero()) {
            self.store.delete(session_id).await?;
            return Err(RecoveryError::SessionExpired);
        }

        self.apply_continuation(&mut snapshot).await?;

        if snapshot.current_state == GamePhase::Idle {
            self.store.delete(session_id).await?;
        }
        Ok(snapshot)
    }

    /// Periodic sweep over every snapshot older than `session_timeout`
    /// (spec §4.6 entry b). Per-session failures are logged and do not
    /// abort the sweep.
    pub async fn sweep(&self) -> Vec<(String, Result<(), RecoveryError>)> {
        let cutoff = self.clock.now()
            - chrono::Duration::from_std(self.session_timeout).unwrap_or(chrono::Duration::zero());
        let expired = match self.store.find_expired(cutoff).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "recovery sweep could not enumerate expired snapshots");
                return Vec::new();
            }
        };

        let mut results = Vec::with_capacity(expired.len());
        for mut snapshot in expired {
            let session_id = snapshot.session_id.clone();
            let outcome = async {
                self.apply_continuation(&mut snapshot).await?;
                self.store.delete(&session_id).await?;
                Ok(())
            }
            .await;
            if let Err(e) = &outcome {
                warn!(session_id = %session_id, error = %e, "recovery sweep failed for session");
            }
            results.push((session_id, outcome));
        }
        results
    }

    async fn apply_continuation(&self, snapshot: &mut SessionSnapshot) -> Result<(), RecoveryError> {
        match snapshot.current_state {
            GamePhase::Idle => Ok(()),
            GamePhase::Ready => self.continue_ready(snapshot).await,
            GamePhase::Spinning => Ok(self.state_machine.fire(snapshot, GameEvent::StopSpin).await?),
            GamePhase::Calculating => {
                let event = if snapshot.win_amount > 0 { GameEvent::ShowWin } else { GameEvent::NoWin };
                Ok(self.state_machine.fire(snapshot, event).await?)
            }
            GamePhase::Winning => Ok(self.state_machine.fire(snapshot, GameEvent::Settle).await?),
            GamePhase::Settlement => self.continue_settlement(snapshot).await,
            GamePhase::Error => Ok(self.state_machine.fire(snapshot, GameEvent::Recover).await?),
        }
    }

    async fn continue_ready(&self, snapshot: &mut SessionSnapshot) -> Result<(), RecoveryError> {
        if snapshot.bet_amount <= 0 {
            self.state_machine.fire(snapshot, GameEvent::Cancel).await?;
            return Ok(());
        }

        // A session swept after exceeding `session_timeout` is stale
        // enough on its own merits, even if it hasn't individually
        // crossed the (usually much longer) `ready_stale_limit` yet;
        // gate on whichever configured limit is tighter so sweep-driven
        // and on-demand recovery agree on what counts as stale.
        let effective_limit = self.session_timeout.min(self.ready_stale_limit);
        let stale_limit = chrono::Duration::from_std(effective_limit).unwrap_or(chrono::Duration::zero());
        if self.clock.now() - snapshot.last_update > stale_limit {
            self.wallet
                .refund(&snapshot.user_id, snapshot.bet_amount, "game_timeout", &snapshot.session_id)
                .await?;
            self.state_machine.fire(snapshot, GameEvent::Timeout).await?;
        }
        Ok(())
    }

    async fn continue_settlement(&self, snapshot: &mut SessionSnapshot) -> Result<(), RecoveryError> {
        if !self.wallet.has_win_transaction(&snapshot.session_id).await? && snapshot.win_amount > 0 {
            self.wallet
                .credit_win_once(&snapshot.user_id, snapshot.win_amount, "game_recovery", &snapshot.session_id)
                .await?;
        }
        self.state_machine.fire(snapshot, GameEvent::Finish).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state_machine::StateMachine;
    use crate::session::store::InMemorySessionStore;
    use crate::wallet::SqliteWalletRepository;
    use chrono::Utc;

    fn engine(store: Arc<InMemorySessionStore>, wallet: Arc<SqliteWalletRepository>) -> RecoveryEngine {
        let clock = crate::clock::system_clock();
        let state_machine = StateMachine::new(store.clone(), clock.clone(), None);
        RecoveryEngine::new(
            store,
            wallet,
            state_machine,
            clock,
            Duration::from_secs(30 * 60),
            Duration::from_secs(5 * 60),
        )
    }

    // S1 — timeout refund.
    #[tokio::test]
    async fn s1_timeout_refund() {
        let store = Arc::new(InMemorySessionStore::new());
        let wallet = Arc::new(SqliteWalletRepository::new(":memory:").unwrap());
        wallet.refund("u1", 10_000, "seed", "seed").await.unwrap();

        let now = Utc::now();
        let mut snapshot = SessionSnapshot::new("s1", "u1", 100, now - chrono::Duration::minutes(10));
        snapshot.current_state = GamePhase::Ready;
        store.save(&snapshot).await.unwrap();

        let engine = engine(store.clone(), wallet.clone());
        let result = engine.recover_session("s1").await.unwrap();
        assert_eq!(result.current_state, GamePhase::Idle);
        assert!(store.load("s1").await.is_err());
        assert_eq!(wallet.balance("u1").await.unwrap(), 10_100);
    }

    // S2 — settlement completion.
    #[tokio::test]
    async fn s2_settlement_completion() {
        let store = Arc::new(InMemorySessionStore::new());
        let wallet = Arc::new(SqliteWalletRepository::new(":memory:").unwrap());

        let now = Utc::now();
        let mut snapshot = SessionSnapshot::new("s2", "u1", 100, now);
        snapshot.current_state = GamePhase::Settlement;
        snapshot.win_amount = 500;
        store.save(&snapshot).await.unwrap();

        let engine = engine(store.clone(), wallet.clone());
        let result = engine.recover_session("s2").await.unwrap();
        assert_eq!(result.current_state, GamePhase::Idle);
        assert!(store.load("s2").await.is_err());
        assert_eq!(wallet.balance("u1").await.unwrap(), 500);
        assert!(wallet.has_win_transaction("s2").await.unwrap());
    }

    // S3 — settlement idempotence.
    #[tokio::test]
    async fn s3_settlement_idempotence() {
        let store = Arc::new(InMemorySessionStore::new());
        let wallet = Arc::new(SqliteWalletRepository::new(":memory:").unwrap());
        wallet.credit_win_once("u1", 500, "win", "s3").await.unwrap();

        let mut snapshot = SessionSnapshot::new("s3", "u1", 100, Utc::now());
        snapshot.current_state = GamePhase::Settlement;
        snapshot.win_amount = 500;
        store.save(&snapshot).await.unwrap();

        let engine = engine(store.clone(), wallet.clone());
        engine.recover_session("s3").await.unwrap();
        assert_eq!(wallet.balance("u1").await.unwrap(), 500);
    }

    // S4 — expired sweep.
    #[tokio::test]
    async fn s4_expired_sweep() {
        let store = Arc::new(InMemorySessionStore::new());
        let wallet = Arc::new(SqliteWalletRepository::new(":memory:").unwrap());
        wallet.refund("u1", 10_000, "seed", "seed-1").await.unwrap();
        wallet.refund("u2", 10_000, "seed", "seed-2").await.unwrap();
        wallet.refund("u3", 10_000, "seed", "seed-3").await.unwrap();

        let now = Utc::now();
        let stale = now - chrono::Duration::seconds(5);
        let fresh = now;

        let mut ready = SessionSnapshot::new("sess-ready", "u1", 200, stale);
        ready.current_state = GamePhase::Ready;
        store.save(&ready).await.unwrap();

        let mut settlement = SessionSnapshot::new("sess-settlement", "u2", 0, stale);
        settlement.current_state = GamePhase::Settlement;
        settlement.win_amount = 300;
        store.save(&settlement).await.unwrap();

        let mut spinning = SessionSnapshot::new("sess-spinning", "u3", 100, fresh);
        spinning.current_state = GamePhase::Spinning;
        store.save(&spinning).await.unwrap();

        let clock = crate::clock::system_clock();
        let state_machine = StateMachine::new(store.clone(), clock.clone(), None);
        let engine = RecoveryEngine::new(
            store.clone(),
            wallet.clone(),
            state_machine,
            clock,
            Duration::from_secs(1),
            Duration::from_secs(5 * 60),
        );

        engine.sweep().await;

        assert_eq!(wallet.balance("u1").await.unwrap(), 10_200);
        assert_eq!(wallet.balance("u2").await.unwrap(), 10_300);
        assert_eq!(wallet.balance("u3").await.unwrap(), 10_000);
        assert!(store.load("sess-ready").await.is_err());
        assert!(store.load("sess-settlement").await.is_err());
        assert!(store.load("sess-spinning").await.is_ok());
    }
}
