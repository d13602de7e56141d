//! Control plane for a slot/coin-pusher arcade cabinet: the game-session
//! state machine with crash recovery, the framed serial protocol to the
//! peripheral microcontroller, and the device controller that keeps it
//! all durable under abrupt power loss.

pub mod algo;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod protocol;
pub mod session;
pub mod slot;
pub mod transport;
pub mod wallet;
