//! Framed binary wire protocol shared by the transport and the device
//! controller (spec §4.1, §6).

pub mod commands;
pub mod events;
pub mod frame;

pub use commands::{dispense_plan, CommandValidationError, DispensePlan, HostCommand, PushAction, ResourceId};
pub use events::{DeviceEvent, EventParseError, FaultCode, FaultLevel, ReturnDirection, SensorKind};
pub use frame::{Frame, FrameError};
