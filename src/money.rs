//! Money Module
//!
//! Exact fixed-point monetary amounts with currency-aware precision.
//! All arithmetic goes through checked integer operations on minor units;
//! binary floating point is never used. `rust_decimal` is used only at the
//! parse/format/convert boundaries.
//!
//! ## Internal Representation
//! - Amounts are stored as `i64` minor units (cents for USD, whole units
//!   for zero-decimal currencies like VND/JPY)
//! - The scale factor is `10^decimals`, fixed per currency
//! - Cross-currency conversion uses a static USD rate table, rounding
//!   half-up at the target currency's scale

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Money conversion and arithmetic errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("amount must be positive")]
    InvalidAmount,

    #[error("precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("amount too large, would overflow")]
    Overflow,

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("currency mismatch: expected {expected}, got {got}")]
    CurrencyMismatch { expected: Currency, got: Currency },

    #[error("unsupported currency: {0}")]
    UnsupportedCurrency(String),
}

/// Supported ISO 4217 currencies.
///
/// Closed set: the decimal scale and the demo exchange-rate table below are
/// fixed per currency. VND and JPY are zero-decimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    USD,
    EUR,
    GBP,
    VND,
    JPY,
    SGD,
    AUD,
    CAD,
}

impl Currency {
    /// Decimal places for this currency (0 for zero-decimal currencies).
    pub const fn decimals(self) -> u32 {
        match self {
            Currency::VND | Currency::JPY => 0,
            _ => 2,
        }
    }

    /// Scale factor `10^decimals`.
    pub const fn scale_factor(self) -> i64 {
        match self.decimals() {
            0 => 1,
            _ => 100,
        }
    }

    /// Static exchange rate: 1 USD = rate units of this currency.
    ///
    /// Fixed lookup table for demonstration; a real deployment would plug in
    /// a rate provider here.
    fn rate_from_usd(self) -> Decimal {
        match self {
            Currency::USD => Decimal::ONE,
            Currency::EUR => Decimal::new(85, 2),     // 0.85
            Currency::GBP => Decimal::new(73, 2),     // 0.73
            Currency::VND => Decimal::new(24_000, 0), // 24000
            Currency::JPY => Decimal::new(110, 0),    // 110
            Currency::SGD => Decimal::new(135, 2),    // 1.35
            Currency::AUD => Decimal::new(138, 2),    // 1.38
            Currency::CAD => Decimal::new(125, 2),    // 1.25
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::GBP => "GBP",
            Currency::VND => "VND",
            Currency::JPY => "JPY",
            Currency::SGD => "SGD",
            Currency::AUD => "AUD",
            Currency::CAD => "CAD",
        })
    }
}

impl FromStr for Currency {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "USD" => Ok(Currency::USD),
            "EUR" => Ok(Currency::EUR),
            "GBP" => Ok(Currency::GBP),
            "VND" => Ok(Currency::VND),
            "JPY" => Ok(Currency::JPY),
            "SGD" => Ok(Currency::SGD),
            "AUD" => Ok(Currency::AUD),
            "CAD" => Ok(Currency::CAD),
            other => Err(MoneyError::UnsupportedCurrency(other.to_string())),
        }
    }
}

/// An exact monetary amount in a single currency.
///
/// # Invariants (enforced by private fields):
/// - `minor` is scaled by exactly `currency.decimals()` places
/// - All arithmetic is checked; overflow surfaces as `MoneyError::Overflow`
/// - Mixed-currency arithmetic and comparison are rejected, never coerced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    minor: i64,
    currency: Currency,
}

impl Money {
    /// Zero in the given currency.
    pub const fn zero(currency: Currency) -> Self {
        Self { minor: 0, currency }
    }

    /// Construct from minor units (e.g. cents). The caller is responsible
    /// for the scale matching the currency; stores use this for decoding.
    pub const fn from_minor(minor: i64, currency: Currency) -> Self {
        Self { minor, currency }
    }

    /// Parse a client-facing decimal string (e.g. `"1500.00"`, `"2400"`).
    ///
    /// # Errors
    /// - `InvalidFormat` on malformed input
    /// - `PrecisionOverflow` if more decimals than the currency allows
    /// - `Overflow` if the scaled value does not fit an `i64`
    pub fn parse(input: &str, currency: Currency) -> Result<Self, MoneyError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(MoneyError::InvalidFormat("empty string".into()));
        }

        let decimal =
            Decimal::from_str(input).map_err(|e| MoneyError::InvalidFormat(e.to_string()))?;
        Self::from_decimal(decimal, currency)
    }

    /// Convert a `Decimal` (e.g. from JSON deserialization) to `Money`.
    ///
    /// Precision beyond the currency scale is rejected, never silently
    /// truncated.
    pub fn from_decimal(decimal: Decimal, currency: Currency) -> Result<Self, MoneyError> {
        let decimal = decimal.normalize();
        let decimals = currency.decimals();
        if decimal.scale() > decimals {
            return Err(MoneyError::PrecisionOverflow {
                provided: decimal.scale(),
                max: decimals,
            });
        }

        let scaled = decimal
            .checked_mul(Decimal::from(currency.scale_factor()))
            .ok_or(MoneyError::Overflow)?;
        let minor = scaled.to_i64().ok_or(MoneyError::Overflow)?;
        Ok(Self { minor, currency })
    }

    /// Minor units (cents for 2-decimal currencies).
    pub const fn minor(&self) -> i64 {
        self.minor
    }

    pub const fn currency(&self) -> Currency {
        self.currency
    }

    pub const fn is_zero(&self) -> bool {
        self.minor == 0
    }

    pub const fn is_positive(&self) -> bool {
        self.minor > 0
    }

    /// Reject the amount unless it is strictly positive.
    pub fn require_positive(&self) -> Result<(), MoneyError> {
        if self.is_positive() {
            Ok(())
        } else {
            Err(MoneyError::InvalidAmount)
        }
    }

    /// Reject the amount unless it is denominated in `expected`.
    pub fn require_currency(&self, expected: Currency) -> Result<(), MoneyError> {
        if self.currency == expected {
            Ok(())
        } else {
            Err(MoneyError::CurrencyMismatch {
                expected,
                got: self.currency,
            })
        }
    }

    /// Exact addition; fails on currency mismatch or overflow.
    pub fn checked_add(self, other: Money) -> Result<Money, MoneyError> {
        other.require_currency(self.currency)?;
        let minor = self
            .minor
            .checked_add(other.minor)
            .ok_or(MoneyError::Overflow)?;
        Ok(Self {
            minor,
            currency: self.currency,
        })
    }

    /// Exact subtraction; fails on currency mismatch or overflow.
    pub fn checked_sub(self, other: Money) -> Result<Money, MoneyError> {
        other.require_currency(self.currency)?;
        let minor = self
            .minor
            .checked_sub(other.minor)
            .ok_or(MoneyError::Overflow)?;
        Ok(Self {
            minor,
            currency: self.currency,
        })
    }

    /// Same-currency ordering; `None` when currencies differ.
    pub fn partial_cmp_amount(&self, other: &Money) -> Option<std::cmp::Ordering> {
        if self.currency == other.currency {
            Some(self.minor.cmp(&other.minor))
        } else {
            None
        }
    }

    /// `self < other`, defined only for the same currency.
    pub fn lt(&self, other: &Money) -> Result<bool, MoneyError> {
        other.require_currency(self.currency)?;
        Ok(self.minor < other.minor)
    }

    /// Convert to the target currency via the static USD rate table,
    /// rounding half-up at the target currency's scale.
    pub fn convert_to(self, target: Currency) -> Result<Money, MoneyError> {
        if self.currency == target {
            return Ok(self);
        }

        let amount = self.to_decimal();
        // amount -> USD -> target
        let in_usd = amount
            .checked_div(self.currency.rate_from_usd())
            .ok_or(MoneyError::Overflow)?;
        let converted = in_usd
            .checked_mul(target.rate_from_usd())
            .ok_or(MoneyError::Overflow)?;

        let rounded = converted
            .round_dp_with_strategy(target.decimals(), RoundingStrategy::MidpointAwayFromZero);
        Money::from_decimal(rounded, target)
    }

    /// Full-precision decimal value (for display and conversion).
    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.minor, self.currency.decimals())
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let decimals = self.currency.decimals() as usize;
        write!(
            f,
            "{:.prec$} {}",
            self.to_decimal(),
            self.currency,
            prec = decimals
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn usd(s: &str) -> Money {
        Money::parse(s, Currency::USD).unwrap()
    }

    #[test]
    fn parse_standard_currency() {
        assert_eq!(usd("1.23").minor(), 123);
        assert_eq!(usd("1500.00").minor(), 150_000);
        assert_eq!(usd("0.01").minor(), 1);
        assert_eq!(usd("-5.00").minor(), -500);
        // Trailing zeros beyond scale are normalized away before the check
        assert_eq!(usd("1.2300").minor(), 123);
    }

    #[test]
    fn parse_zero_decimal_currency() {
        let vnd = Money::parse("24000", Currency::VND).unwrap();
        assert_eq!(vnd.minor(), 24_000);

        assert_eq!(
            Money::parse("100.5", Currency::JPY),
            Err(MoneyError::PrecisionOverflow {
                provided: 1,
                max: 0
            })
        );
    }

    #[test]
    fn parse_rejects_excess_precision() {
        assert_eq!(
            Money::parse("1.234", Currency::USD),
            Err(MoneyError::PrecisionOverflow {
                provided: 3,
                max: 2
            })
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        for bad in ["", "1,000.00", "1.2.3", "abc", "1e2 USD"] {
            assert!(Money::parse(bad, Currency::USD).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn require_positive_rejects_zero_and_negative() {
        assert!(usd("0.00").require_positive().is_err());
        assert!(usd("-1.00").require_positive().is_err());
        assert!(usd("0.01").require_positive().is_ok());
    }

    #[test]
    fn checked_arithmetic_is_exact() {
        let a = usd("0.10");
        let b = usd("0.20");
        assert_eq!(a.checked_add(b).unwrap(), usd("0.30"));
        assert_eq!(b.checked_sub(a).unwrap(), usd("0.10"));
    }

    #[test]
    fn mixed_currency_arithmetic_rejected() {
        let a = usd("1.00");
        let b = Money::parse("1.00", Currency::EUR).unwrap();
        assert!(matches!(
            a.checked_add(b),
            Err(MoneyError::CurrencyMismatch { .. })
        ));
        assert_eq!(a.partial_cmp_amount(&b), None);
    }

    #[test]
    fn overflow_detected() {
        let max = Money::from_minor(i64::MAX, Currency::USD);
        assert_eq!(max.checked_add(usd("0.01")), Err(MoneyError::Overflow));
    }

    #[test]
    fn convert_rounds_half_up_at_target_scale() {
        // 1.00 USD -> 0.85 EUR
        let eur = usd("1.00").convert_to(Currency::EUR).unwrap();
        assert_eq!(eur, Money::parse("0.85", Currency::EUR).unwrap());

        // 1.00 USD -> 24000 VND (zero-decimal target)
        let vnd = usd("1.00").convert_to(Currency::VND).unwrap();
        assert_eq!(vnd.minor(), 24_000);

        // 0.05 * 110 = 5.5 JPY -> rounds half-up to 6
        let jpy = usd("0.05").convert_to(Currency::JPY).unwrap();
        assert_eq!(jpy.minor(), 6);
    }

    #[test]
    fn convert_same_currency_is_identity() {
        let m = usd("12.34");
        assert_eq!(m.convert_to(Currency::USD).unwrap(), m);
    }

    #[test]
    fn display_uses_currency_scale() {
        assert_eq!(usd("1500.00").to_string(), "1500.00 USD");
        assert_eq!(
            Money::parse("2400", Currency::JPY).unwrap().to_string(),
            "2400 JPY"
        );
    }

    proptest! {
        #[test]
        fn add_then_sub_roundtrips(a in -1_000_000_000i64..1_000_000_000,
                                   b in -1_000_000_000i64..1_000_000_000) {
            let x = Money::from_minor(a, Currency::USD);
            let y = Money::from_minor(b, Currency::USD);
            let sum = x.checked_add(y).unwrap();
            prop_assert_eq!(sum.checked_sub(y).unwrap(), x);
        }

        #[test]
        fn parse_display_roundtrips(minor in -1_000_000_000i64..1_000_000_000) {
            let m = Money::from_minor(minor, Currency::USD);
            let rendered = m.to_string();
            let amount = rendered.strip_suffix(" USD").unwrap();
            prop_assert_eq!(Money::parse(amount, Currency::USD).unwrap(), m);
        }
    }
}
