//! Proportional copy sizing with advisory thresholds.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::models::{Warning, WarningKind};

/// Inputs for sizing one copied order.
#[derive(Debug, Clone, Copy)]
pub struct SizingInput {
    /// Quote value of the leader's fill
    pub fill_notional: Decimal,
    pub leader_equity: Decimal,
    pub follower_equity: Decimal,
    pub follower_available: Decimal,
    pub leverage: u32,
}

/// Result of sizing one order.
#[derive(Debug, Clone)]
pub enum SizeOutcome {
    /// Order value to send, with any advisory warnings raised on the way.
    Sized { size_usd: Decimal, warnings: Vec<Warning> },
    /// Nothing can be sent.
    Abandoned { reason: String, warning: Option<Warning> },
}

/// Calculator for follower order values.
///
/// `copy size = ratio × fill notional / leader equity × follower equity`,
/// rounded to cents. The min and max thresholds never block an order: a
/// small order is raised to the minimum, a large one only warns. The one
/// hard limit is the follower's available balance.
#[derive(Debug, Clone)]
pub struct CopySizer {
    copy_ratio: Decimal,
    min_copy_size: Decimal,
    max_copy_size: Option<Decimal>,
}

impl CopySizer {
    pub fn new(copy_ratio: Decimal, min_copy_size: Decimal, max_copy_size: Option<Decimal>) -> Self {
        Self {
            copy_ratio,
            min_copy_size,
            max_copy_size,
        }
    }

    /// Raw proportional size before thresholds, rounded to 2 decimals.
    pub fn proportional(&self, fill_notional: Decimal, leader_equity: Decimal, follower_equity: Decimal) -> Decimal {
        (self.copy_ratio * fill_notional / leader_equity * follower_equity)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
    }

    pub fn size(&self, input: SizingInput) -> SizeOutcome {
        if input.follower_equity <= Decimal::ZERO {
            return SizeOutcome::Abandoned {
                reason: format!("follower equity is {}", input.follower_equity),
                warning: Some(Warning::new(
                    WarningKind::ZeroBalance,
                    format!("Follower equity {} is not positive, order skipped", input.follower_equity),
                    input.fill_notional,
                    Decimal::ZERO,
                )),
            };
        }
        if input.leader_equity <= Decimal::ZERO {
            return SizeOutcome::Abandoned {
                reason: format!("leader equity is {}", input.leader_equity),
                warning: None,
            };
        }

        let mut warnings = Vec::new();
        let mut size = self.proportional(input.fill_notional, input.leader_equity, input.follower_equity);

        if size < self.min_copy_size {
            warnings.push(Warning::new(
                WarningKind::SizeBoosted,
                format!("Copy size {} below minimum, raised to {}", size, self.min_copy_size),
                input.fill_notional,
                self.min_copy_size,
            ));
            size = self.min_copy_size;
        }

        if let Some(max) = self.max_copy_size {
            if size > max {
                warnings.push(Warning::new(
                    WarningKind::HighValue,
                    format!("Copy size {} above maximum {}", size, max),
                    input.fill_notional,
                    size,
                ));
            }
        }

        let leverage = Decimal::from(input.leverage.max(1));
        let available = input.follower_available.max(Decimal::ZERO);
        if size / leverage > available {
            let clamped = (available * leverage).round_dp_with_strategy(2, RoundingStrategy::ToZero);
            let warning = Warning::new(
                WarningKind::BalanceClamped,
                format!(
                    "Margin for {} at {}x exceeds available balance {}, clamped to {}",
                    size, leverage, available, clamped
                ),
                input.fill_notional,
                clamped,
            );
            if clamped <= Decimal::ZERO {
                return SizeOutcome::Abandoned {
                    reason: "no available balance".to_string(),
                    warning: Some(warning),
                };
            }
            warnings.push(warning);
            size = clamped;
        }

        SizeOutcome::Sized { size_usd: size, warnings }
    }
}
