//! Game-phase state machine: pure transition table plus a thin wrapper
//! that persists through the session store and notifies an observer
//! (spec §4.5). Grounded on the teacher's preference for small
//! hand-written error enums (`ArtifactStoreError`-style) over a derive
//! macro, kept here because transition failures need to carry the
//! attempted `(from, event)` pair for diagnostics.

use super::store::{SessionSnapshot, SessionStore, StoreError};
use crate::clock::SharedClock;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GamePhase {
    Idle,
    Ready,
    Spinning,
    Calculating,
    Winning,
    Settlement,
    Error,
}

impl GamePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Ready => "ready",
            Self::Spinning => "spinning",
            Self::Calculating => "calculating",
            Self::Winning => "winning",
            Self::Settlement => "settlement",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ()> {
        match s {
            "idle" => Ok(Self::Idle),
            "ready" => Ok(Self::Ready),
            "spinning" => Ok(Self::Spinning),
            "calculating" => Ok(Self::Calculating),
            "winning" => Ok(Self::Winning),
            "settlement" => Ok(Self::Settlement),
            "error" => Ok(Self::Error),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum GameEvent {
    InsertCoin,
    StartSpin,
    StopSpin,
    ShowWin,
    NoWin,
    Settle,
    Finish,
    Cancel,
    Timeout,
    Recover,
    Fault(String),
}

impl GameEvent {
    fn label(&self) -> &'static str {
        match self {
            Self::InsertCoin => "insert_coin",
            Self::StartSpin => "start_spin",
            Self::StopSpin => "stop_spin",
            Self::ShowWin => "show_win",
            Self::NoWin => "no_win",
            Self::Settle => "settle",
            Self::Finish => "finish",
            Self::Cancel => "cancel",
            Self::Timeout => "timeout",
            Self::Recover => "recover",
            Self::Fault(_) => "fault",
        }
    }
}

#[derive(Debug)]
pub enum TransitionError {
    InvalidTransition { from: GamePhase, event: &'static str },
    GuardFailed { reason: &'static str },
    Store(StoreError),
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTransition { from, event } => {
                write!(f, "no transition for event {event:?} from state {from:?}")
            }
            Self::GuardFailed { reason } => write!(f, "transition guard failed: {reason}"),
            Self::Store(e) => write!(f, "failed to persist snapshot: {e}"),
        }
    }
}

impl std::error::Error for TransitionError {}

impl From<StoreError> for TransitionError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Apply one event to `snapshot` in place. Pure: no I/O, no locking.
/// Effects named in the transition table (clearing bet/win, recording
/// the fault message) are applied here; money-moving effects (the
/// timeout refund, the recovery win credit) are the caller's
/// responsibility since they cross into the wallet.
pub fn apply(event: GameEvent, snapshot: &mut SessionSnapshot) -> Result<(), TransitionError> {
    let from = snapshot.current_state;

    if let GameEvent::Fault(message) = &event {
        snapshot.extras.error_message = Some(message.clone());
        snapshot.current_state = GamePhase::Error;
        return Ok(());
    }

    let to = match (from, &event) {
        (GamePhase::Idle, GameEvent::InsertCoin) => {
            if snapshot.bet_amount <= 0 {
                return Err(TransitionError::GuardFailed {
                    reason: "bet_amount must be > 0 to insert a coin",
                });
            }
            GamePhase::Ready
        }
        (GamePhase::Ready, GameEvent::StartSpin) => GamePhase::Spinning,
        (GamePhase::Ready, GameEvent::Cancel) => {
            snapshot.bet_amount = 0;
            GamePhase::Idle
        }
        (GamePhase::Ready, GameEvent::Timeout) => GamePhase::Idle,
        (GamePhase::Spinning, GameEvent::StopSpin) => GamePhase::Calculating,
        (GamePhase::Calculating, GameEvent::ShowWin) => {
            if snapshot.win_amount <= 0 {
                return Err(TransitionError::GuardFailed {
                    reason: "win_amount must be > 0 to show a win",
                });
            }
            GamePhase::Winning
        }
        (GamePhase::Calculating, GameEvent::NoWin) => GamePhase::Settlement,
        (GamePhase::Winning, GameEvent::Settle) => GamePhase::Settlement,
        (GamePhase::Settlement, GameEvent::Finish) => {
            snapshot.bet_amount = 0;
            snapshot.win_amount = 0;
            GamePhase::Idle
        }
        (GamePhase::Error, GameEvent::Recover) => GamePhase::Idle,
        _ => {
            return Err(TransitionError::InvalidTransition {
                from,
                event: event.label(),
            })
        }
    };

    snapshot.current_state = to;
    Ok(())
}

pub type Observer = Arc<dyn Fn(&SessionSnapshot) + Send + Sync>;

/// Thin wrapper around [`apply`] that persists through a [`SessionStore`]
/// and notifies the observer only after the snapshot is durable (spec
/// §4.5: "invoked after the snapshot is persisted, never before").
pub struct StateMachine {
    store: Arc<dyn SessionStore>,
    clock: SharedClock,
    observer: Option<Observer>,
}

impl StateMachine {
    pub fn new(store: Arc<dyn SessionStore>, clock: SharedClock, observer: Option<Observer>) -> Self {
        Self { store, clock, observer }
    }

    pub async fn fire(&self, snapshot: &mut SessionSnapshot, event: GameEvent) -> Result<(), TransitionError> {
        apply(event, snapshot)?;
        snapshot.last_update = self.clock.now();
        self.store.save(snapshot).await?;
        if let Some(observer) = &self.observer {
            observer(snapshot);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::InMemorySessionStore;
    use chrono::Utc;

    fn ready_snapshot() -> SessionSnapshot {
        let mut s = SessionSnapshot::new("s1", "u1", 100, Utc::now());
        s.current_state = GamePhase::Ready;
        s
    }

    #[test]
    fn idle_insert_coin_requires_positive_bet() {
        let mut s = SessionSnapshot::new("s1", "u1", 0, Utc::now());
        assert!(matches!(
            apply(GameEvent::InsertCoin, &mut s),
            Err(TransitionError::GuardFailed { .. })
        ));
    }

    #[test]
    fn full_happy_path_reaches_idle() {
        let mut s = SessionSnapshot::new("s1", "u1", 100, Utc::now());
        apply(GameEvent::InsertCoin, &mut s).unwrap();
        apply(GameEvent::StartSpin, &mut s).unwrap();
        apply(GameEvent::StopSpin, &mut s).unwrap();
        s.win_amount = 500;
        apply(GameEvent::ShowWin, &mut s).unwrap();
        apply(GameEvent::Settle, &mut s).unwrap();
        apply(GameEvent::Finish, &mut s).unwrap();
        assert_eq!(s.current_state, GamePhase::Idle);
        assert_eq!(s.bet_amount, 0);
        assert_eq!(s.win_amount, 0);
    }

    #[test]
    fn fault_from_any_state_moves_to_error_and_records_message() {
        let mut s = ready_snapshot();
        apply(GameEvent::Fault("jam".to_string()), &mut s).unwrap();
        assert_eq!(s.current_state, GamePhase::Error);
        assert_eq!(s.extras.error_message.as_deref(), Some("jam"));
        apply(GameEvent::Recover, &mut s).unwrap();
        assert_eq!(s.current_state, GamePhase::Idle);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut s = SessionSnapshot::new("s1", "u1", 100, Utc::now());
        assert!(matches!(
            apply(GameEvent::StartSpin, &mut s),
            Err(TransitionError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn fire_persists_before_notifying_observer() {
        let store = Arc::new(InMemorySessionStore::new());
        let notified = Arc::new(parking_lot::Mutex::new(false));
        let notified_clone = notified.clone();
        let store_for_check = store.clone();
        let machine = StateMachine::new(
            store.clone(),
            crate::clock::system_clock(),
            Some(Arc::new(move |snap: &SessionSnapshot| {
                // By the time the observer runs, the snapshot must already
                // be visible through the store.
                let id = snap.session_id.clone();
                let store = store_for_check.clone();
                let flag = notified_clone.clone();
                tokio::spawn(async move {
                    assert!(store.load(&id).await.is_ok());
                    *flag.lock() = true;
                });
            })),
        );

        let mut snapshot = SessionSnapshot::new("s1", "u1", 100, Utc::now());
        machine.fire(&mut snapshot, GameEvent::InsertCoin).await.unwrap();
        assert_eq!(snapshot.current_state, GamePhase::Ready);
    }
}
