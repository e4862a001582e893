//! Fixed-point monetary amounts
//!
//! Values travel on the wire as JSON decimal numbers but are held as a
//! signed count of 1e-8 units so that fee and change arithmetic is exact.
//! Negative amounts are representable on purpose: a peer can send one and
//! validation has to be able to see it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};
use std::str::FromStr;
use thiserror::Error;

/// Units per whole coin (8 decimal places)
pub const UNITS_PER_COIN: i64 = 100_000_000;

/// Amount conversion errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AmountError {
    #[error("Amount is not a finite number")]
    NotFinite,
    #[error("Amount out of range: {0}")]
    OutOfRange(f64),
    #[error("Invalid amount: {0}")]
    Invalid(String),
}

/// A monetary amount in 1e-8 units
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "f64", into = "f64")]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_units(units: i64) -> Self {
        Self(units)
    }

    pub const fn units(self) -> i64 {
        self.0
    }

    /// Convert a decimal coin value, rounding to the nearest unit
    pub fn from_coins(coins: f64) -> Result<Self, AmountError> {
        if !coins.is_finite() {
            return Err(AmountError::NotFinite);
        }
        let units = (coins * UNITS_PER_COIN as f64).round();
        if units > i64::MAX as f64 || units < i64::MIN as f64 {
            return Err(AmountError::OutOfRange(coins));
        }
        Ok(Self(units as i64))
    }

    pub fn to_coins(self) -> f64 {
        self.0 as f64 / UNITS_PER_COIN as f64
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Amount {
    type Output = Amount;

    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_sub(rhs.0))
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, |acc, value| acc + value)
    }
}

impl<'a> Sum<&'a Amount> for Amount {
    fn sum<I: Iterator<Item = &'a Amount>>(iter: I) -> Amount {
        iter.copied().sum()
    }
}

impl TryFrom<f64> for Amount {
    type Error = AmountError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Amount::from_coins(value)
    }
}

impl From<Amount> for f64 {
    fn from(amount: Amount) -> f64 {
        amount.to_coins()
    }
}

/// Always eight decimals, which is also the form hashed into transaction IDs
impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let magnitude = self.0.unsigned_abs();
        let per_coin = UNITS_PER_COIN as u64;
        write!(
            f,
            "{}{}.{:08}",
            sign,
            magnitude / per_coin,
            magnitude % per_coin
        )
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let coins: f64 = s
            .trim()
            .parse()
            .map_err(|_| AmountError::Invalid(s.to_string()))?;
        Amount::from_coins(coins)
    }
}
