//! Device controller: command dispatch, echo acknowledgement, resource
//! mutual exclusion, sensor policy, and durable statistics (spec §4.3).

mod controller;
mod sensors;
mod stats;

pub use controller::{Callbacks, ControllerError, DeviceController};
pub use sensors::{evaluate, SensorOutcome, SensorSideEffect};
pub use stats::{DeviceStatistics, StatsError, StatsStore};
