//! Device-originated event codes and payload parsing (spec §4.3, §6).

use super::frame::Frame;

pub const EVT_COIN_INSERTED: u8 = 0x11;
pub const EVT_COIN_RETURNED: u8 = 0x12;
pub const EVT_BUTTON_PRESSED: u8 = 0x13;
pub const EVT_SENSOR_TRIGGERED: u8 = 0x14;
pub const EVT_STATUS_REPORT: u8 = 0x22;
pub const EVT_FAULT_REPORT: u8 = 0x23;
pub const EVT_PROGRESS: u8 = 0x24;

/// Coin return direction, carried in a coin-returned event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnDirection {
    Front,
    Left,
    Right,
}

impl ReturnDirection {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Front),
            1 => Some(Self::Left),
            2 => Some(Self::Right),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    CoinLevel,
    TicketLevel,
    Temperature,
    Vibration,
    Door,
}

impl SensorKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::CoinLevel),
            1 => Some(Self::TicketLevel),
            2 => Some(Self::Temperature),
            3 => Some(Self::Vibration),
            4 => Some(Self::Door),
            _ => None,
        }
    }
}

/// A fault code the device (or the controller's own sensor policy) can
/// raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCode {
    NoResource,
    TicketNoPaper,
    OverTemperature,
    SensorAbnormal,
    /// Any fault code reported by the device that this controller does
    /// not recognize; carried through unchanged rather than dropped.
    Unknown(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultLevel {
    Info,
    Warning,
    Critical,
}

/// A parsed inbound event, independent of its wire representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    CoinInserted { count: u16 },
    CoinReturned { direction: ReturnDirection, count: u16 },
    ButtonPressed { button_id: u8 },
    SensorTriggered { kind: SensorKind, value: u16 },
    StatusReport { raw: Vec<u8> },
    FaultReport { code: FaultCode, level: FaultLevel },
    Progress { percent: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventParseError {
    UnknownCommand(u8),
    TruncatedPayload,
    UnknownDirection(u8),
    UnknownSensorKind(u8),
    UnknownFaultLevel(u8),
}

impl std::fmt::Display for EventParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownCommand(c) => write!(f, "unrecognized event command 0x{c:02X}"),
            Self::TruncatedPayload => write!(f, "event payload shorter than expected"),
            Self::UnknownDirection(b) => write!(f, "unrecognized coin-return direction byte {b}"),
            Self::UnknownSensorKind(b) => write!(f, "unrecognized sensor kind byte {b}"),
            Self::UnknownFaultLevel(b) => write!(f, "unrecognized fault level byte {b}"),
        }
    }
}

impl std::error::Error for EventParseError {}

fn fault_code_from_byte(b: u8) -> FaultCode {
    match b {
        1 => FaultCode::NoResource,
        2 => FaultCode::TicketNoPaper,
        3 => FaultCode::OverTemperature,
        4 => FaultCode::SensorAbnormal,
        other => FaultCode::Unknown(other),
    }
}

fn fault_level_from_byte(b: u8) -> Result<FaultLevel, EventParseError> {
    match b {
        0 => Ok(FaultLevel::Info),
        1 => Ok(FaultLevel::Warning),
        2 => Ok(FaultLevel::Critical),
        other => Err(EventParseError::UnknownFaultLevel(other)),
    }
}

pub fn parse(frame: &Frame) -> Result<DeviceEvent, EventParseError> {
    let data = &frame.data;
    match frame.command {
        EVT_COIN_INSERTED => {
            let count = read_u16(data, 0)?;
            Ok(DeviceEvent::CoinInserted { count })
        }
        EVT_COIN_RETURNED => {
            if data.is_empty() {
                return Err(EventParseError::TruncatedPayload);
            }
            let direction = ReturnDirection::from_byte(data[0])
                .ok_or(EventParseError::UnknownDirection(data[0]))?;
            let count = read_u16(data, 1)?;
            Ok(DeviceEvent::CoinReturned { direction, count })
        }
        EVT_BUTTON_PRESSED => {
            let button_id = *data.first().ok_or(EventParseError::TruncatedPayload)?;
            Ok(DeviceEvent::ButtonPressed { button_id })
        }
        EVT_SENSOR_TRIGGERED => {
            if data.is_empty() {
                return Err(EventParseError::TruncatedPayload);
            }
            let kind = SensorKind::from_byte(data[0])
                .ok_or(EventParseError::UnknownSensorKind(data[0]))?;
            let value = read_u16(data, 1)?;
            Ok(DeviceEvent::SensorTriggered { kind, value })
        }
        EVT_STATUS_REPORT => Ok(DeviceEvent::StatusReport { raw: data.clone() }),
        EVT_FAULT_REPORT => {
            if data.len() < 2 {
                return Err(EventParseError::TruncatedPayload);
            }
            let code = fault_code_from_byte(data[0]);
            let level = fault_level_from_byte(data[1])?;
            Ok(DeviceEvent::FaultReport { code, level })
        }
        EVT_PROGRESS => {
            let percent = *data.first().ok_or(EventParseError::TruncatedPayload)?;
            Ok(DeviceEvent::Progress { percent })
        }
        other => Err(EventParseError::UnknownCommand(other)),
    }
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, EventParseError> {
    let bytes = data
        .get(offset..offset + 2)
        .ok_or(EventParseError::TruncatedPayload)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_coin_returned_front() {
        let frame = Frame::new(EVT_COIN_RETURNED, 2, vec![0, 3, 0]);
        assert_eq!(
            parse(&frame).unwrap(),
            DeviceEvent::CoinReturned {
                direction: ReturnDirection::Front,
                count: 3
            }
        );
    }

    #[test]
    fn parses_temperature_sensor() {
        // value 460 -> 46.0 C
        let frame = Frame::new(EVT_SENSOR_TRIGGERED, 4, vec![2, 460u16.to_le_bytes()[0], 460u16.to_le_bytes()[1]]);
        assert_eq!(
            parse(&frame).unwrap(),
            DeviceEvent::SensorTriggered {
                kind: SensorKind::Temperature,
                value: 460
            }
        );
    }

    #[test]
    fn truncated_sensor_payload_rejected() {
        let frame = Frame::new(EVT_SENSOR_TRIGGERED, 4, vec![2]);
        assert_eq!(parse(&frame), Err(EventParseError::TruncatedPayload));
    }

    #[test]
    fn unknown_command_rejected() {
        let frame = Frame::new(0x99, 0, vec![]);
        assert_eq!(parse(&frame), Err(EventParseError::UnknownCommand(0x99)));
    }
}
