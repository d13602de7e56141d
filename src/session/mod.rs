//! Game session lifecycle: durable snapshots, the phase state machine,
//! crash recovery, and the session manager that bridges them to the
//! wallet and the slot engine (spec §4.4-§4.7).

pub mod manager;
pub mod recovery;
pub mod state_machine;
pub mod store;

pub use manager::{ManagerError, SessionManager};
pub use recovery::{RecoveryEngine, RecoveryError};
pub use state_machine::{GameEvent, GamePhase, StateMachine, TransitionError};
pub use store::{InMemorySessionStore, SessionSnapshot, SessionStore, SqliteSessionStore, StoreError, TwoTierSessionStore};
