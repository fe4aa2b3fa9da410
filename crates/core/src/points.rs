use std::{fmt, str::FromStr};

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const SCALE: i64 = 100;

/// Balance and price amount with two decimal places, stored as hundredths.
///
/// Arithmetic stays in integers so debits are exact: `150.00 - 100.00` is
/// always `50.00`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Points(i64);

impl Points {
    pub const ZERO: Points = Points(0);

    /// Builds an amount from its hundredths representation (`15000` is `150.00`).
    pub const fn from_hundredths(value: i64) -> Self {
        Self(value)
    }

    /// Builds an amount from whole points (`150` is `150.00`).
    pub const fn whole(value: i64) -> Self {
        Self(value * SCALE)
    }

    /// Returns the amount as hundredths, the representation persisted in storage.
    pub const fn hundredths(self) -> i64 {
        self.0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_sub(self, other: Points) -> Option<Points> {
        self.0.checked_sub(other.0).map(Points)
    }

    pub fn checked_add(self, other: Points) -> Option<Points> {
        self.0.checked_add(other.0).map(Points)
    }

    /// Returns `true` when the amount fits a decimal column of `max_digits`
    /// total digits with two decimal places.
    pub fn fits_digits(self, max_digits: u32) -> bool {
        match 10u64.checked_pow(max_digits) {
            Some(limit) => self.0.unsigned_abs() < limit,
            None => true,
        }
    }
}

impl fmt::Display for Points {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let scale = SCALE as u64;
        write!(f, "{sign}{}.{:02}", abs / scale, abs % scale)
    }
}

/// Errors produced while parsing a textual amount.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParsePointsError {
    #[error("amount is empty")]
    Empty,
    #[error("amount contains invalid characters: {0}")]
    InvalidFormat(String),
    #[error("amount has more than two decimal places: {0}")]
    TooPrecise(String),
    #[error("amount is out of range: {0}")]
    Overflow(String),
}

impl FromStr for Points {
    type Err = ParsePointsError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(ParsePointsError::Empty);
        }

        let (negative, unsigned) = match value.as_bytes()[0] {
            b'-' => (true, &value[1..]),
            b'+' => (false, &value[1..]),
            _ => (false, value),
        };

        let (int_part, frac_part) = match unsigned.split_once('.') {
            Some((int_part, frac_part)) => (int_part, Some(frac_part)),
            None => (unsigned, None),
        };

        let all_digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
        if !all_digits(int_part) || frac_part.is_some_and(|frac| !all_digits(frac)) {
            return Err(ParsePointsError::InvalidFormat(value.to_string()));
        }

        let frac_digits = frac_part.unwrap_or("");
        if frac_digits.len() > 2 {
            return Err(ParsePointsError::TooPrecise(value.to_string()));
        }

        let overflow = || ParsePointsError::Overflow(value.to_string());
        let whole: i64 = int_part.parse().map_err(|_| overflow())?;
        let mut cents: i64 = if frac_digits.is_empty() {
            0
        } else {
            frac_digits.parse().map_err(|_| overflow())?
        };
        if frac_digits.len() == 1 {
            cents *= 10;
        }

        let hundredths = whole
            .checked_mul(SCALE)
            .and_then(|value| value.checked_add(cents))
            .ok_or_else(overflow)?;

        Ok(Self(if negative { -hundredths } else { hundredths }))
    }
}

impl Serialize for Points {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Points {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(PointsVisitor)
    }
}

struct PointsVisitor;

impl<'de> Visitor<'de> for PointsVisitor {
    type Value = Points;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a decimal string such as \"150.00\" or a whole number")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        value.parse().map_err(E::custom)
    }

    fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        value
            .checked_mul(SCALE)
            .map(Points)
            .ok_or_else(|| E::custom("amount is out of range"))
    }

    fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        let value = i64::try_from(value).map_err(|_| E::custom("amount is out of range"))?;
        self.visit_i64(value)
    }
}
