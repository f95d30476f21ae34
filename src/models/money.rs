//! Money types
//!
//! All amounts are carried as integer minor currency units (`Cents`).
//! Callers that hold a decimal major-unit amount must say so explicitly
//! through `AmountInput`; the unit is never inferred from magnitude.

use serde::{Deserialize, Serialize};

/// Amount in minor currency units (cents)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Cents(pub i64);

impl Cents {
    pub const ZERO: Cents = Cents(0);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn checked_sub(self, other: Cents) -> Option<Cents> {
        self.0.checked_sub(other.0).map(Cents)
    }

    pub fn checked_add(self, other: Cents) -> Option<Cents> {
        self.0.checked_add(other.0).map(Cents)
    }

    /// Portion of this amount at a basis-point rate, rounded half up
    pub fn apply_bps(self, bps: i64) -> Cents {
        Cents(ratio_half_up(self.0, bps, 10_000))
    }

    /// Portion of this amount at a whole percentage, rounded half up
    pub fn percent(self, pct: i64) -> Cents {
        Cents(ratio_half_up(self.0, pct, 100))
    }
}

impl std::fmt::Display for Cents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Cents {
    fn from(value: i64) -> Self {
        Cents(value)
    }
}

/// `value * numerator / denominator` rounded half up, computed in i128.
///
/// Negative values round half away from zero so that the result is
/// symmetric with the positive case.
pub fn ratio_half_up(value: i64, numerator: i64, denominator: i64) -> i64 {
    let product = value as i128 * numerator as i128;
    let denominator = denominator as i128;
    let half = denominator / 2;
    let rounded = if product >= 0 {
        (product + half) / denominator
    } else {
        -((-product + half) / denominator)
    };
    rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Error returned when an amount cannot be normalised to positive cents
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid amount: {0}")]
pub struct InvalidAmount(pub String);

/// Caller-supplied amount with an explicit unit tag
///
/// Serialized as `{"minor_units": 5000}` or `{"major_units": 50.0}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountInput {
    MinorUnits(i64),
    MajorUnits(f64),
}

impl AmountInput {
    /// Normalise to minor units, rejecting non-positive and non-finite values
    pub fn to_cents(self) -> Result<Cents, InvalidAmount> {
        let cents = match self {
            AmountInput::MinorUnits(v) => v,
            AmountInput::MajorUnits(v) => {
                if !v.is_finite() {
                    return Err(InvalidAmount(format!("{} is not a finite number", v)));
                }
                // Settle float noise (0.285 * 100 = 28.4999...) before rounding to cents
                let scaled = ((v * 100.0) * 1_000_000.0).round() / 1_000_000.0;
                let rounded = scaled.round();
                if rounded >= i64::MAX as f64 || rounded <= i64::MIN as f64 {
                    return Err(InvalidAmount(format!("{} is out of range", v)));
                }
                rounded as i64
            }
        };

        if cents <= 0 {
            return Err(InvalidAmount(format!(
                "amount must be positive, got {} minor units",
                cents
            )));
        }
        Ok(Cents(cents))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_bps_rounds_half_up() {
        assert_eq!(Cents(10_000).apply_bps(1500), Cents(1500));
        assert_eq!(Cents(10_000).apply_bps(290), Cents(290));
        // 1 * 5000 / 10000 = 0.5 -> 1
        assert_eq!(Cents(1).apply_bps(5000), Cents(1));
        // 3 * 1500 / 10000 = 0.45 -> 0
        assert_eq!(Cents(3).apply_bps(1500), Cents(0));
    }

    #[test]
    fn test_percent() {
        assert_eq!(Cents(10_000).percent(50), Cents(5000));
        assert_eq!(Cents(101).percent(50), Cents(51));
        assert_eq!(Cents(10_000).percent(0), Cents::ZERO);
        assert_eq!(Cents(10_000).percent(100), Cents(10_000));
    }

    #[test]
    fn test_ratio_half_up_negative_is_symmetric() {
        assert_eq!(ratio_half_up(-1, 1, 2), -1);
        assert_eq!(ratio_half_up(1, 1, 2), 1);
    }

    #[test]
    fn test_amount_input_minor_units() {
        assert_eq!(AmountInput::MinorUnits(5000).to_cents(), Ok(Cents(5000)));
        assert!(AmountInput::MinorUnits(0).to_cents().is_err());
        assert!(AmountInput::MinorUnits(-10).to_cents().is_err());
    }

    #[test]
    fn test_amount_input_major_units() {
        assert_eq!(AmountInput::MajorUnits(50.0).to_cents(), Ok(Cents(5000)));
        assert_eq!(AmountInput::MajorUnits(0.285).to_cents(), Ok(Cents(29)));
        assert_eq!(AmountInput::MajorUnits(19.99).to_cents(), Ok(Cents(1999)));
        assert!(AmountInput::MajorUnits(0.004).to_cents().is_err());
        assert!(AmountInput::MajorUnits(f64::NAN).to_cents().is_err());
        assert!(AmountInput::MajorUnits(f64::INFINITY).to_cents().is_err());
        assert!(AmountInput::MajorUnits(1e30).to_cents().is_err());
    }

    #[test]
    fn test_amount_input_small_values_are_not_reinterpreted() {
        // A small minor-unit amount stays minor units; no magnitude guessing.
        assert_eq!(AmountInput::MinorUnits(50).to_cents(), Ok(Cents(50)));
        assert_eq!(AmountInput::MajorUnits(5000.0).to_cents(), Ok(Cents(500_000)));
    }

    #[test]
    fn test_amount_input_json_shape() {
        let minor: AmountInput = serde_json::from_str(r#"{"minor_units":5000}"#).unwrap();
        assert_eq!(minor, AmountInput::MinorUnits(5000));

        let major: AmountInput = serde_json::from_str(r#"{"major_units":12.5}"#).unwrap();
        assert_eq!(major, AmountInput::MajorUnits(12.5));

        assert!(serde_json::from_str::<AmountInput>("5000").is_err());
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Whole major units always convert exactly.
        #[test]
        fn whole_major_units_convert_exactly(dollars in 1i64..1_000_000) {
            let cents = AmountInput::MajorUnits(dollars as f64).to_cents().unwrap();
            prop_assert_eq!(cents, Cents(dollars * 100));
        }

        /// Basis-point share never exceeds the amount for rates up to 100%.
        #[test]
        fn bps_share_bounded(amount in 0i64..10_000_000, bps in 0i64..=10_000) {
            let share = Cents(amount).apply_bps(bps);
            prop_assert!(share.get() >= 0);
            prop_assert!(share.get() <= amount);
        }
    }
}
