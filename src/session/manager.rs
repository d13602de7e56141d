//! Session manager: in-memory session registry, the bet/spin/settle/end
//! request surface, and the idle reaper (spec §4.7). Holds the recovery
//! engine, never the reverse (design note §9).

use super::recovery::RecoveryEngine;
use super::state_machine::{GameEvent, GamePhase, StateMachine, TransitionError};
use super::store::{SessionSnapshot, SessionStore, StoreError};
use crate::clock::SharedClock;
use crate::config::SessionConfig;
use crate::device::DeviceController;
use crate::protocol::commands::dispense_plan;
use crate::slot::{SlotEngine, SpinResult};
use crate::wallet::{WalletError, WalletRepository};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

#[derive(Debug)]
pub enum ManagerError {
    SessionLimitReached,
    SessionNotFound,
    Wallet(WalletError),
    Transition(TransitionError),
    Store(StoreError),
}

impl std::fmt::Display for ManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionLimitReached => write!(f, "maximum number of concurrent sessions reached"),
            Self::SessionNotFound => write!(f, "no active session with this session_id"),
            Self::Wallet(e) => write!(f, "wallet error: {e}"),
            Self::Transition(e) => write!(f, "state transition error: {e}"),
            Self::Store(e) => write!(f, "session store error: {e}"),
        }
    }
}

impl std::error::Error for ManagerError {}

impl From<WalletError> for ManagerError {
    fn from(e: WalletError) -> Self {
        Self::Wallet(e)
    }
}

impl From<TransitionError> for ManagerError {
    fn from(e: TransitionError) -> Self {
        Self::Transition(e)
    }
}

impl From<StoreError> for ManagerError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

type SharedSnapshot = Arc<AsyncMutex<SessionSnapshot>>;

pub struct SessionManager {
    registry: parking_lot::Mutex<HashMap<String, SharedSnapshot>>,
    last_activity: parking_lot::Mutex<HashMap<String, DateTime<Utc>>>,
    store: Arc<dyn SessionStore>,
    wallet: Arc<dyn WalletRepository>,
    state_machine: StateMachine,
    recovery: Arc<RecoveryEngine>,
    slot_engine: Arc<dyn SlotEngine>,
    device: Option<Arc<DeviceController>>,
    clock: SharedClock,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        wallet: Arc<dyn WalletRepository>,
        state_machine: StateMachine,
        recovery: Arc<RecoveryEngine>,
        slot_engine: Arc<dyn SlotEngine>,
        device: Option<Arc<DeviceController>>,
        clock: SharedClock,
        config: SessionConfig,
    ) -> Self {
        Self {
            registry: parking_lot::Mutex::new(HashMap::new()),
            last_activity: parking_lot::Mutex::new(HashMap::new()),
            store,
            wallet,
            state_machine,
            recovery,
            slot_engine,
            device,
            clock,
            config,
        }
    }

    pub fn recovery_engine(&self) -> &Arc<RecoveryEngine> {
        &self.recovery
    }

    fn touch(&self, session_id: &str) {
        self.last_activity.lock().insert(session_id.to_string(), self.clock.now());
    }

    fn get(&self, session_id: &str) -> Result<SharedSnapshot, ManagerError> {
        self.registry
            .lock()
            .get(session_id)
            .cloned()
            .ok_or(ManagerError::SessionNotFound)
    }

    /// Debit the bet, open/resume the session, and fire `insert_coin`
    /// all-or-nothing (spec §4.7). A failure after the debit refunds it
    /// back out so no step leaves money moved without a matching state
    /// change.
    pub async fn start(&self, session_id: &str, user_id: &str, bet_amount: i64) -> Result<(), ManagerError> {
        {
            let registry = self.registry.lock();
            if !registry.contains_key(session_id) && registry.len() >= self.config.max_sessions {
                return Err(ManagerError::SessionLimitReached);
            }
        }

        self.wallet.debit(user_id, bet_amount, "bet", session_id).await?;

        let mut snapshot = match self.store.load(session_id).await {
            Ok(existing) => existing,
            Err(StoreError::NotFound) => SessionSnapshot::new(session_id, user_id, bet_amount, self.clock.now()),
            Err(e) => {
                self.compensate_start_failure(user_id, bet_amount, session_id).await;
                return Err(e.into());
            }
        };
        snapshot.bet_amount = bet_amount;

        if let Err(e) = self.state_machine.fire(&mut snapshot, GameEvent::InsertCoin).await {
            self.compensate_start_failure(user_id, bet_amount, session_id).await;
            return Err(e.into());
        }

        self.registry
            .lock()
            .insert(session_id.to_string(), Arc::new(AsyncMutex::new(snapshot)));
        self.touch(session_id);
        Ok(())
    }

    async fn compensate_start_failure(&self, user_id: &str, bet_amount: i64, session_id: &str) {
        if let Err(e) = self
            .wallet
            .refund(user_id, bet_amount, "game_start_rollback", session_id)
            .await
        {
            warn!(session_id = %session_id, error = %e, "failed to roll back bet debit after start failure");
        }
    }

    /// Require `Ready`, run the spin, and book the resulting win if any
    /// (spec §4.7).
    pub async fn spin(&self, session_id: &str) -> Result<SpinResult, ManagerError> {
        let shared = self.get(session_id)?;
        let mut snapshot = shared.lock().await;

        if snapshot.current_state != GamePhase::Ready {
            return Err(TransitionError::InvalidTransition {
                from: snapshot.current_state,
                event: "spin",
            }
            .into());
        }

        self.state_machine.fire(&mut snapshot, GameEvent::StartSpin).await?;
        let result = self.slot_engine.spin(snapshot.bet_amount).await;
        snapshot.win_amount = result.total_payout;
        snapshot.extras.spin_digest = Some(result.digest.clone());
        self.state_machine.fire(&mut snapshot, GameEvent::StopSpin).await?;

        if result.total_payout > 0 {
            self.state_machine.fire(&mut snapshot, GameEvent::ShowWin).await?;
            self.wallet
                .credit_win_once(&snapshot.user_id, result.total_payout, "spin_win", session_id)
                .await?;
            self.maybe_dispense(result.total_payout);
        } else {
            self.state_machine.fire(&mut snapshot, GameEvent::NoWin).await?;
        }

        drop(snapshot);
        self.touch(session_id);
        Ok(result)
    }

    /// Dispense failures never roll back a wallet credit already booked
    /// (spec §7 propagation policy) — run it detached from the request.
    fn maybe_dispense(&self, payout: i64) {
        let Some(device) = self.device.clone() else { return };
        let plan = dispense_plan(payout);
        if plan.coins < 1 {
            return;
        }
        tokio::spawn(async move {
            if let Err(e) = device.dispense(plan.coins as u16, 5).await {
                warn!(error = %e, "payout dispense failed");
            }
        });
    }

    /// Drive `Winning -> Settlement -> Idle` and drop the session once
    /// it is idle.
    pub async fn settle(&self, session_id: &str) -> Result<(), ManagerError> {
        let shared = self.get(session_id)?;
        let is_idle = {
            let mut snapshot = shared.lock().await;
            if snapshot.current_state == GamePhase::Winning {
                self.state_machine.fire(&mut snapshot, GameEvent::Settle).await?;
            }
            if snapshot.current_state == GamePhase::Settlement {
                self.state_machine.fire(&mut snapshot, GameEvent::Finish).await?;
            }
            if snapshot.current_state == GamePhase::Idle {
                self.store.delete(session_id).await?;
            }
            snapshot.current_state == GamePhase::Idle
        };
        if is_idle {
            self.registry.lock().remove(session_id);
            self.last_activity.lock().remove(session_id);
        }
        Ok(())
    }

    /// Flush an in-memory session, persisting its current snapshot
    /// whatever phase it is in.
    pub async fn end(&self, session_id: &str) -> Result<(), ManagerError> {
        let removed = self.registry.lock().remove(session_id);
        self.last_activity.lock().remove(session_id);
        if let Some(shared) = removed {
            let snapshot = shared.lock().await;
            self.store.save(&snapshot).await?;
        }
        Ok(())
    }

    /// Background task: evict and flush sessions idle past
    /// `session_timeout` (spec §4.7).
    pub fn spawn_idle_reaper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.idle_reaper_interval);
            loop {
                ticker.tick().await;
                self.reap_idle().await;
            }
        })
    }

    async fn reap_idle(&self) {
        let now = self.clock.now();
        let timeout = chrono::Duration::from_std(self.config.session_timeout).unwrap_or(chrono::Duration::zero());
        let stale: Vec<String> = self
            .last_activity
            .lock()
            .iter()
            .filter(|(_, last)| now - **last > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for session_id in stale {
            if let Err(e) = self.end(&session_id).await {
                warn!(session_id = %session_id, error = %e, "idle reaper failed to flush session");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::InMemorySessionStore;
    use crate::slot::FixedPayoutEngine;
    use crate::wallet::SqliteWalletRepository;
    use std::time::Duration;

    fn manager(wallet: Arc<SqliteWalletRepository>, slot: Arc<dyn SlotEngine>) -> SessionManager {
        let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
        let clock = crate::clock::system_clock();
        let state_machine = StateMachine::new(store.clone(), clock.clone(), None);
        let recovery = Arc::new(RecoveryEngine::new(
            store.clone(),
            wallet.clone() as Arc<dyn WalletRepository>,
            StateMachine::new(store.clone(), clock.clone(), None),
            clock.clone(),
            Duration::from_secs(30 * 60),
            Duration::from_secs(5 * 60),
        ));
        SessionManager::new(
            store,
            wallet,
            state_machine,
            recovery,
            slot,
            None,
            clock,
            SessionConfig {
                session_timeout: Duration::from_secs(30 * 60),
                max_sessions: 2,
                idle_reaper_interval: Duration::from_secs(5 * 60),
                ready_stale_limit: Duration::from_secs(5 * 60),
            },
        )
    }

    #[tokio::test]
    async fn start_debits_and_creates_a_ready_session() {
        let wallet = Arc::new(SqliteWalletRepository::new(":memory:").unwrap());
        wallet.refund("u1", 1_000, "seed", "seed").await.unwrap();
        let mgr = manager(wallet.clone(), Arc::new(FixedPayoutEngine::always_lose()));

        mgr.start("s1", "u1", 100).await.unwrap();
        assert_eq!(wallet.balance("u1").await.unwrap(), 900);
    }

    #[tokio::test]
    async fn start_rejects_insufficient_balance_without_creating_a_session() {
        let wallet = Arc::new(SqliteWalletRepository::new(":memory:").unwrap());
        let mgr = manager(wallet.clone(), Arc::new(FixedPayoutEngine::always_lose()));

        let err = mgr.start("s1", "u1", 100).await.unwrap_err();
        assert!(matches!(err, ManagerError::Wallet(WalletError::InsufficientBalance { .. })));
        assert!(mgr.get("s1").is_err());
    }

    #[tokio::test]
    async fn winning_spin_credits_wallet_exactly_once() {
        let wallet = Arc::new(SqliteWalletRepository::new(":memory:").unwrap());
        wallet.refund("u1", 1_000, "seed", "seed").await.unwrap();
        let mgr = manager(wallet.clone(), Arc::new(FixedPayoutEngine::always_win(5, 1)));

        mgr.start("s1", "u1", 100).await.unwrap();
        let result = mgr.spin("s1").await.unwrap();
        assert_eq!(result.total_payout, 500);
        assert_eq!(wallet.balance("u1").await.unwrap(), 1_400);
        assert!(wallet.has_win_transaction("s1").await.unwrap());
    }

    #[tokio::test]
    async fn session_limit_is_enforced() {
        let wallet = Arc::new(SqliteWalletRepository::new(":memory:").unwrap());
        wallet.refund("u1", 1_000, "seed", "seed").await.unwrap();
        let mgr = manager(wallet.clone(), Arc::new(FixedPayoutEngine::always_lose()));

        mgr.start("s1", "u1", 100).await.unwrap();
        mgr.start("s2", "u1", 100).await.unwrap();
        let err = mgr.start("s3", "u1", 100).await.unwrap_err();
        assert!(matches!(err, ManagerError::SessionLimitReached));
    }
}
