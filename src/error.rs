//! Crate-wide error taxonomy.
//!
//! Each subsystem owns its own error enum next to its code (the pattern
//! the teacher uses for `ArtifactStoreError` in `backtest_v2/artifact_store.rs`):
//! a hand-written `Display`, a `std::error::Error` impl, and `From` impls
//! for the library errors it wraps. This module only re-exports them so
//! callers outside the crate have one place to look.

pub use crate::device::ControllerError;
pub use crate::protocol::frame::FrameError;
pub use crate::session::recovery::RecoveryError;
pub use crate::session::manager::ManagerError;
pub use crate::session::state_machine::TransitionError;
pub use crate::session::store::StoreError;
pub use crate::transport::TransportError;
pub use crate::wallet::WalletError;
