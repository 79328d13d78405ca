//! Money handling
//!
//! Amounts are `rust_decimal::Decimal` in major units everywhere inside the
//! wallet. Two rules keep the arithmetic honest:
//!
//! 1. Client amounts are rejected (not truncated) when they carry more than
//!    [`MONETARY_SCALE`] fractional digits.
//! 2. Derived amounts (exchange proceeds) are rounded once, with
//!    [`round_money`], at the point where they are written to the journal.
//!
//! Minor units (cents) only exist at the payment-processor edge, see
//! [`to_minor_units`] / [`from_minor_units`].

use rust_decimal::prelude::*;
use thiserror::Error;

/// Fractional digits kept for every recorded amount
pub const MONETARY_SCALE: u32 = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Amount must be positive")]
    NotPositive,

    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Amount too large, would overflow")]
    Overflow,
}

/// Validate a client-supplied amount: strictly positive, at most two decimals.
pub fn validate_amount(amount: Decimal) -> Result<Decimal, MoneyError> {
    if amount <= Decimal::ZERO {
        return Err(MoneyError::NotPositive);
    }
    let normalized = amount.normalize();
    if normalized.scale() > MONETARY_SCALE {
        return Err(MoneyError::PrecisionOverflow {
            provided: normalized.scale(),
            max: MONETARY_SCALE,
        });
    }
    Ok(with_scale(normalized))
}

/// Parse and validate an amount string (e.g. `"12.50"`)
pub fn parse_amount(s: &str) -> Result<Decimal, MoneyError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(MoneyError::InvalidFormat("empty amount".to_string()));
    }
    let amount = Decimal::from_str(s).map_err(|_| MoneyError::InvalidFormat(s.to_string()))?;
    validate_amount(amount)
}

/// Round half away from zero to [`MONETARY_SCALE`] digits, padding the scale.
pub fn round_money(amount: Decimal) -> Decimal {
    with_scale(amount.round_dp_with_strategy(MONETARY_SCALE, RoundingStrategy::MidpointAwayFromZero))
}

fn with_scale(mut amount: Decimal) -> Decimal {
    amount.rescale(MONETARY_SCALE);
    amount
}

/// Major units → processor minor units (`12.34` → `1234`)
pub fn to_minor_units(amount: Decimal) -> Result<i64, MoneyError> {
    let scaled = round_money(amount) * Decimal::from(10i64.pow(MONETARY_SCALE));
    scaled.to_i64().ok_or(MoneyError::Overflow)
}

/// Processor minor units → major units (`1234` → `12.34`)
pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, MONETARY_SCALE)
}
