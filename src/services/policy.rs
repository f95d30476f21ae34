//! Fee and refund policy
//!
//! Pure functions over integer minor units. Each fee component is rounded
//! half-up on its own before the net is derived.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::PolicyConfig;
use crate::models::{Cents, Role};

/// Split of one captured payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeBreakdown {
    pub amount: Cents,
    pub platform_fee: Cents,
    pub processor_fee: Cents,
    pub tutor_net: Cents,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("fees ({platform_fee} + {processor_fee}) exceed payment amount {amount}")]
pub struct FeesExceedAmount {
    pub amount: Cents,
    pub platform_fee: Cents,
    pub processor_fee: Cents,
}

/// `platform = amount × rate`, `processor = amount × 2.9% + 30`,
/// `net = amount − platform − processor`
pub fn compute_fees(amount: Cents, policy: &PolicyConfig) -> Result<FeeBreakdown, FeesExceedAmount> {
    let platform_fee = amount.apply_bps(policy.platform_fee_bps);
    let processor_fee = Cents(
        amount
            .apply_bps(policy.processor_fee_bps)
            .get()
            .saturating_add(policy.processor_fee_fixed_cents),
    );

    let tutor_net = amount
        .checked_sub(platform_fee)
        .and_then(|rest| rest.checked_sub(processor_fee))
        .filter(|net| net.get() >= 0)
        .ok_or(FeesExceedAmount {
            amount,
            platform_fee,
            processor_fee,
        })?;

    Ok(FeeBreakdown {
        amount,
        platform_fee,
        processor_fee,
        tutor_net,
    })
}

/// Platform application fee on a direct charge
pub fn application_fee(amount: Cents, policy: &PolicyConfig) -> Cents {
    amount.apply_bps(policy.platform_fee_bps)
}

/// Whole hours between `now` and the session start, never negative
pub fn hours_before_session(start: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (start - now).num_seconds().div_euclid(3600).max(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefundSplit {
    pub refund: Cents,
    pub tutor_payout: Cents,
}

/// Refund table applied to the amount actually paid.
///
/// | cancelled by | hours before | student refund | tutor payout |
/// |---|---|---|---|
/// | student | >= 24 | 100% | 0% |
/// | student | 2..24 | 50% | 50% |
/// | student | < 2 | 0% | 100% |
/// | tutor | any | 100% | 0% |
pub fn refund_split(cancelled_by: Role, hours_before: i64, paid: Cents) -> RefundSplit {
    let refund = match cancelled_by {
        Role::Tutor => paid,
        Role::Student if hours_before >= 24 => paid,
        Role::Student if hours_before >= 2 => paid.percent(50),
        Role::Student => Cents::ZERO,
    };
    RefundSplit {
        refund,
        // The remainder goes to the tutor so the two always sum to `paid`
        tutor_payout: Cents(paid.get() - refund.get()),
    }
}
