//! Host-originated command codes, payload encoding, and the resource-id
//! / argument-validation rules from spec §4.3.

use super::frame::FrameError;

pub const CMD_DISPENSE: u8 = 0x01;
pub const CMD_REFUND: u8 = 0x02;
pub const CMD_TICKET_PRINT: u8 = 0x03;
pub const CMD_PUSH_CONTROL: u8 = 0x04;
pub const CMD_LIGHT: u8 = 0x05;
pub const CMD_STATUS_QUERY: u8 = 0x21;
pub const CMD_FAULT_RECOVERY: u8 = 0x25;
pub const CMD_HEARTBEAT: u8 = 0x31;

pub const PROTOCOL_VERSION: u8 = 1;

/// Abstract identifier for a physical actuator that cannot be driven by
/// two concurrent commands (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceId {
    CoinDispense,
    CoinRefund,
    TicketPrint,
    Push,
}

impl ResourceId {
    pub fn numeric(self) -> u8 {
        match self {
            Self::CoinDispense => 1,
            Self::CoinRefund => 2,
            Self::TicketPrint => 3,
            Self::Push => 4,
        }
    }
}

/// Every resource-holding command maps to exactly one [`ResourceId`];
/// light and heartbeat are non-exclusive (`None`).
fn resource_for(command: u8) -> Option<ResourceId> {
    match command {
        CMD_DISPENSE => Some(ResourceId::CoinDispense),
        CMD_REFUND => Some(ResourceId::CoinRefund),
        CMD_TICKET_PRINT => Some(ResourceId::TicketPrint),
        CMD_PUSH_CONTROL => Some(ResourceId::Push),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushAction {
    Continuous,
    Stop,
    Single(u16),
    SetSpeed(u8),
}

impl PushAction {
    fn opcode(self) -> u8 {
        match self {
            Self::Continuous => 0,
            Self::Stop => 1,
            Self::Single(_) => 2,
            Self::SetSpeed(_) => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandValidationError {
    CountOutOfRange { value: u16 },
}

impl std::fmt::Display for CommandValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CountOutOfRange { value } => {
                write!(f, "count {value} outside the valid range 1..=9999")
            }
        }
    }
}

fn clamp_speed(speed: u8) -> u8 {
    speed.clamp(1, 10)
}

fn validate_count(count: u16) -> Result<(), CommandValidationError> {
    if (1..=9999).contains(&count) {
        Ok(())
    } else {
        Err(CommandValidationError::CountOutOfRange { value: count })
    }
}

/// A fully-built host command, ready to be framed and sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub code: u8,
    pub payload: Vec<u8>,
    pub resource: Option<ResourceId>,
}

impl HostCommand {
    pub fn dispense(count: u16, speed: u8) -> Result<Self, CommandValidationError> {
        validate_count(count)?;
        let speed = clamp_speed(speed);
        let mut payload = count.to_le_bytes().to_vec();
        payload.push(speed);
        Ok(Self {
            code: CMD_DISPENSE,
            payload,
            resource: resource_for(CMD_DISPENSE),
        })
    }

    pub fn refund(count: u16) -> Result<Self, CommandValidationError> {
        validate_count(count)?;
        Ok(Self {
            code: CMD_REFUND,
            payload: count.to_le_bytes().to_vec(),
            resource: resource_for(CMD_REFUND),
        })
    }

    pub fn ticket_print(count: u16) -> Result<Self, CommandValidationError> {
        validate_count(count)?;
        Ok(Self {
            code: CMD_TICKET_PRINT,
            payload: count.to_le_bytes().to_vec(),
            resource: resource_for(CMD_TICKET_PRINT),
        })
    }

    pub fn push(action: PushAction) -> Self {
        let mut payload = vec![action.opcode()];
        match action {
            PushAction::Single(n) => payload.extend_from_slice(&n.to_le_bytes()),
            PushAction::SetSpeed(s) => payload.push(clamp_speed(s)),
            PushAction::Continuous | PushAction::Stop => {}
        }
        Self {
            code: CMD_PUSH_CONTROL,
            payload,
            resource: resource_for(CMD_PUSH_CONTROL),
        }
    }

    pub fn light(pattern: u8) -> Self {
        Self {
            code: CMD_LIGHT,
            payload: vec![pattern],
            resource: None,
        }
    }

    pub fn status_query() -> Self {
        Self {
            code: CMD_STATUS_QUERY,
            payload: Vec::new(),
            resource: None,
        }
    }

    pub fn fault_recovery() -> Self {
        Self {
            code: CMD_FAULT_RECOVERY,
            payload: Vec::new(),
            resource: None,
        }
    }

    pub fn heartbeat(unix_ts: u32) -> Self {
        let mut payload = unix_ts.to_le_bytes().to_vec();
        payload.push(PROTOCOL_VERSION);
        Self {
            code: CMD_HEARTBEAT,
            payload,
            resource: None,
        }
    }
}

/// Derived `(coins, force, duration_ms)` parameters for converting a
/// monetary payout into a physical coin dispense (spec §4.7, scenario S7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispensePlan {
    pub coins: u32,
    pub force: u32,
    pub duration_ms: u32,
}

pub fn dispense_plan(payout_minor_units: i64) -> DispensePlan {
    let coins = (payout_minor_units.max(0) / 100) as u32;
    if coins < 1 {
        return DispensePlan {
            coins: 0,
            force: 0,
            duration_ms: 0,
        };
    }
    let force = (50 + 10 * coins).min(100);
    let duration_ms = coins * 500;
    DispensePlan {
        coins,
        force,
        duration_ms,
    }
}

/// Force `encode` to see a resource-aware [`FrameError`] conversion point
/// so command builders and the frame codec share one error surface at the
/// controller layer.
pub fn encode_command(command: &HostCommand, sequence: u16) -> Result<Vec<u8>, FrameError> {
    super::frame::encode(command.code, sequence, &command.payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispense_plan_matches_spec_s7() {
        assert_eq!(
            dispense_plan(50),
            DispensePlan {
                coins: 0,
                force: 0,
                duration_ms: 0
            }
        );
        assert_eq!(
            dispense_plan(100),
            DispensePlan {
                coins: 1,
                force: 60,
                duration_ms: 500
            }
        );
        assert_eq!(
            dispense_plan(500),
            DispensePlan {
                coins: 5,
                force: 100,
                duration_ms: 2500
            }
        );
        assert_eq!(
            dispense_plan(1050),
            DispensePlan {
                coins: 10,
                force: 100,
                duration_ms: 5000
            }
        );
    }

    #[test]
    fn speed_clamped_to_one_through_ten() {
        let cmd = HostCommand::dispense(1, 0).unwrap();
        assert_eq!(cmd.payload[2], 1);
        let cmd = HostCommand::dispense(1, 200).unwrap();
        assert_eq!(cmd.payload[2], 10);
    }

    #[test]
    fn count_out_of_range_rejected() {
        assert!(HostCommand::dispense(0, 5).is_err());
        assert!(HostCommand::dispense(10_000, 5).is_err());
        assert!(HostCommand::dispense(9_999, 5).is_ok());
    }

    #[test]
    fn each_resource_holding_command_maps_to_distinct_id() {
        assert_eq!(
            HostCommand::dispense(1, 5).unwrap().resource,
            Some(ResourceId::CoinDispense)
        );
        assert_eq!(
            HostCommand::refund(1).unwrap().resource,
            Some(ResourceId::CoinRefund)
        );
        assert_eq!(
            HostCommand::ticket_print(1).unwrap().resource,
            Some(ResourceId::TicketPrint)
        );
        assert_eq!(
            HostCommand::push(PushAction::Stop).resource,
            Some(ResourceId::Push)
        );
        assert_eq!(HostCommand::light(1).resource, None);
    }
}
