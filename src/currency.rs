//! Currency & Rate Table
//!
//! The wallet supports a fixed, closed set of currencies. Rates are a static
//! nested table (not a live FX feed) that operators may override from config
//! or at runtime. Exchanges stamp the rate they executed at onto the journal
//! row, so later table changes never rewrite history.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unsupported currency: {0}")]
pub struct UnknownCurrency(pub String);

/// Supported currencies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
    Gbp,
}

impl Currency {
    pub const ALL: [Currency; 3] = [Currency::Usd, Currency::Eur, Currency::Gbp];

    pub fn code(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = UnknownCurrency;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            "GBP" => Ok(Currency::Gbp),
            other => Err(UnknownCurrency(other.to_string())),
        }
    }
}

/// Pairwise conversion rates, `FROM -> TO -> rate`
pub type RateOverrides = HashMap<Currency, HashMap<Currency, f64>>;

/// Conversion rate table
pub struct RateTable {
    rates: RwLock<HashMap<(Currency, Currency), Decimal>>,
}

impl RateTable {
    /// Table seeded with the default demo rates
    pub fn new() -> Self {
        let defaults = [
            (Currency::Usd, Currency::Eur, Decimal::new(93, 2)),
            (Currency::Usd, Currency::Gbp, Decimal::new(79, 2)),
            (Currency::Eur, Currency::Usd, Decimal::new(108, 2)),
            (Currency::Eur, Currency::Gbp, Decimal::new(85, 2)),
            (Currency::Gbp, Currency::Usd, Decimal::new(127, 2)),
            (Currency::Gbp, Currency::Eur, Decimal::new(117, 2)),
        ];
        let rates = defaults
            .into_iter()
            .map(|(from, to, rate)| ((from, to), rate))
            .collect();
        Self {
            rates: RwLock::new(rates),
        }
    }

    /// Default table with config-supplied overrides applied on top
    pub fn with_overrides(overrides: &RateOverrides) -> Self {
        let table = Self::new();
        for (from, row) in overrides {
            for (to, rate) in row {
                match Decimal::from_f64(*rate) {
                    Some(rate) if rate > Decimal::ZERO => table.set_rate(*from, *to, rate),
                    _ => tracing::warn!(%from, %to, rate, "Ignoring invalid rate override"),
                }
            }
        }
        table
    }

    /// Replace a single pair's rate
    pub fn set_rate(&self, from: Currency, to: Currency, rate: Decimal) {
        let mut rates = self.rates.write().unwrap_or_else(|e| e.into_inner());
        rates.insert((from, to), rate);
    }

    /// Strict lookup: `None` when the pair is not configured.
    ///
    /// Same-currency lookups are always `1`.
    pub fn try_rate(&self, from: Currency, to: Currency) -> Option<Decimal> {
        if from == to {
            return Some(Decimal::ONE);
        }
        let rates = self.rates.read().unwrap_or_else(|e| e.into_inner());
        rates.get(&(from, to)).copied()
    }

    /// Lenient lookup: a missing pair yields the identity rate `1`.
    pub fn rate(&self, from: Currency, to: Currency) -> Decimal {
        self.try_rate(from, to).unwrap_or(Decimal::ONE)
    }

    /// `amount * rate(from, to)`, unrounded
    pub fn convert(&self, amount: Decimal, from: Currency, to: Currency) -> Decimal {
        amount * self.rate(from, to)
    }
}

impl Default for RateTable {
    fn default() -> Self {
        Self::new()
    }
}
