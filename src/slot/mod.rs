//! Slot engine: the RNG / payline-evaluation collaborator (spec §1
//! Non-goals — "the slot-reel RNG and payline-evaluation engine" is out
//! of scope). Expressed as a trait so the session manager never depends
//! on a concrete implementation; only a deterministic test double lives
//! in this crate (design note §9: "cyclic references avoided").

use async_trait::async_trait;

/// Outcome of one spin. Opaque beyond the payout the wallet needs and a
/// digest for audit trails; reel layout and payline detail belong to
/// the external engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpinResult {
    pub total_payout: i64,
    pub digest: String,
}

#[async_trait]
pub trait SlotEngine: Send + Sync {
    async fn spin(&self, bet_amount: i64) -> SpinResult;
}

/// Deterministic test double: always pays out `bet_amount * multiplier`
/// (rounded down), never touches any RNG. Exists for tests only.
pub struct FixedPayoutEngine {
    pub multiplier_numerator: i64,
    pub multiplier_denominator: i64,
}

impl FixedPayoutEngine {
    pub fn always_win(multiplier_numerator: i64, multiplier_denominator: i64) -> Self {
        Self {
            multiplier_numerator,
            multiplier_denominator,
        }
    }

    pub fn always_lose() -> Self {
        Self {
            multiplier_numerator: 0,
            multiplier_denominator: 1,
        }
    }
}

#[async_trait]
impl SlotEngine for FixedPayoutEngine {
    async fn spin(&self, bet_amount: i64) -> SpinResult {
        let total_payout = (bet_amount * self.multiplier_numerator) / self.multiplier_denominator;
        SpinResult {
            total_payout,
            digest: format!("fixed:{}/{}", self.multiplier_numerator, self.multiplier_denominator),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn always_win_pays_the_configured_multiple() {
        let engine = FixedPayoutEngine::always_win(5, 1);
        let result = engine.spin(100).await;
        assert_eq!(result.total_payout, 500);
    }

    #[tokio::test]
    async fn always_lose_pays_nothing() {
        let engine = FixedPayoutEngine::always_lose();
        let result = engine.spin(100).await;
        assert_eq!(result.total_payout, 0);
    }
}
