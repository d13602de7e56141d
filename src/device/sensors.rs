//! Sensor threshold policy (spec §4.3 sensor table).

use crate::protocol::{FaultCode, FaultLevel, SensorKind};

/// Side effect a critical crossing asks the controller to perform
/// beyond emitting the fault itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorSideEffect {
    None,
    PushStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorOutcome {
    pub code: FaultCode,
    pub level: FaultLevel,
    pub side_effect: SensorSideEffect,
    pub door_open: bool,
}

/// Evaluate one sensor reading against the threshold table. Returns
/// `None` when the value crosses no threshold at all.
pub fn evaluate(kind: SensorKind, value: u16) -> Option<SensorOutcome> {
    match kind {
        SensorKind::CoinLevel => {
            if value <= 5 {
                Some(critical(FaultCode::NoResource))
            } else if value <= 10 {
                Some(warn(FaultCode::NoResource))
            } else {
                None
            }
        }
        SensorKind::TicketLevel => {
            if value <= 10 {
                Some(critical(FaultCode::TicketNoPaper))
            } else if value <= 50 {
                Some(warn(FaultCode::TicketNoPaper))
            } else {
                None
            }
        }
        SensorKind::Temperature => {
            // value is tenths of a degree C.
            if value >= 550 {
                Some(SensorOutcome {
                    code: FaultCode::OverTemperature,
                    level: FaultLevel::Critical,
                    side_effect: SensorSideEffect::PushStop,
                    door_open: false,
                })
            } else if value >= 450 {
                Some(warn(FaultCode::OverTemperature))
            } else {
                None
            }
        }
        SensorKind::Vibration => {
            if value >= 500 {
                // Table names this a "warning" despite crossing the
                // sole (critical) threshold for vibration.
                Some(warn(FaultCode::SensorAbnormal))
            } else {
                None
            }
        }
        SensorKind::Door => {
            if value != 0 {
                Some(SensorOutcome {
                    code: FaultCode::SensorAbnormal,
                    level: FaultLevel::Critical,
                    side_effect: SensorSideEffect::None,
                    door_open: true,
                })
            } else {
                None
            }
        }
    }
}

fn warn(code: FaultCode) -> SensorOutcome {
    SensorOutcome {
        code,
        level: FaultLevel::Warning,
        side_effect: SensorSideEffect::None,
        door_open: false,
    }
}

fn critical(code: FaultCode) -> SensorOutcome {
    SensorOutcome {
        code,
        level: FaultLevel::Critical,
        side_effect: SensorSideEffect::None,
        door_open: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coin_level_thresholds() {
        assert_eq!(evaluate(SensorKind::CoinLevel, 11), None);
        assert_eq!(evaluate(SensorKind::CoinLevel, 10).unwrap().level, FaultLevel::Warning);
        assert_eq!(evaluate(SensorKind::CoinLevel, 5).unwrap().level, FaultLevel::Critical);
    }

    #[test]
    fn temperature_critical_triggers_push_stop() {
        let outcome = evaluate(SensorKind::Temperature, 560).unwrap();
        assert_eq!(outcome.level, FaultLevel::Critical);
        assert_eq!(outcome.side_effect, SensorSideEffect::PushStop);
    }

    #[test]
    fn vibration_critical_threshold_reports_as_warning() {
        let outcome = evaluate(SensorKind::Vibration, 500).unwrap();
        assert_eq!(outcome.level, FaultLevel::Warning);
        assert_eq!(outcome.code, FaultCode::SensorAbnormal);
    }

    #[test]
    fn door_open_is_critical_with_marker() {
        let outcome = evaluate(SensorKind::Door, 1).unwrap();
        assert_eq!(outcome.level, FaultLevel::Critical);
        assert!(outcome.door_open);
        assert!(evaluate(SensorKind::Door, 0).is_none());
    }
}
