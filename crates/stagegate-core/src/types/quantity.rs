//! Fixed-point material quantities.
//!
//! Quantities are stored as signed thousandths of a unit so that stock and
//! demand arithmetic stays in integers. Human-readable formats (JSON, TOML)
//! see a decimal string such as `"2.5"` and also accept bare integers;
//! binary formats (postcard) see the raw thousandths.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;
use thiserror::Error;

const SCALE: i64 = 1000;
const FRACTION_DIGITS: usize = 3;

/// A material quantity in thousandths of its unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Quantity(i64);

/// Failure to parse a decimal quantity string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid quantity '{input}': {reason}")]
pub struct QuantityParseError {
    pub input: String,
    pub reason: &'static str,
}

impl Quantity {
    pub const ZERO: Self = Self(0);

    /// Whole units.
    #[must_use]
    pub const fn from_units(units: i64) -> Self {
        Self(units.saturating_mul(SCALE))
    }

    /// Raw thousandths.
    #[must_use]
    pub const fn from_milli(milli: i64) -> Self {
        Self(milli)
    }

    #[must_use]
    pub const fn milli(self) -> i64 {
        self.0
    }

    #[must_use]
    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    #[must_use]
    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    #[must_use]
    pub const fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    /// How much of `self` cannot be covered by `available`: `max(0, self - available)`.
    #[must_use]
    pub fn shortage_against(self, available: Self) -> Self {
        Self(self.0.saturating_sub(available.0).max(0))
    }

    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let whole = abs / SCALE as u64;
        let frac = abs % SCALE as u64;
        if frac == 0 {
            return write!(f, "{sign}{whole}");
        }
        let digits = format!("{frac:03}");
        write!(f, "{sign}{whole}.{}", digits.trim_end_matches('0'))
    }
}

impl FromStr for Quantity {
    type Err = QuantityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| QuantityParseError {
            input: s.to_string(),
            reason,
        };
        let trimmed = s.trim();
        let (negative, body) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        if body.is_empty() {
            return Err(err("empty"));
        }
        let (whole_part, frac_part) = match body.split_once('.') {
            Some((w, f)) => (w, f),
            None => (body, ""),
        };
        if whole_part.is_empty() || !whole_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err("expected digits before the decimal point"));
        }
        if !frac_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err("expected digits after the decimal point"));
        }
        if frac_part.len() > FRACTION_DIGITS {
            return Err(err("at most three decimal places are supported"));
        }
        let whole: i64 = whole_part.parse().map_err(|_| err("out of range"))?;
        let mut frac: i64 = if frac_part.is_empty() {
            0
        } else {
            frac_part.parse().map_err(|_| err("out of range"))?
        };
        for _ in frac_part.len()..FRACTION_DIGITS {
            frac = frac.saturating_mul(10);
        }
        let milli = whole
            .checked_mul(SCALE)
            .and_then(|w| w.checked_add(frac))
            .ok_or_else(|| err("out of range"))?;
        Ok(Self(if negative { -milli } else { milli }))
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            serializer.serialize_i64(self.0)
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HumanQuantity {
    Units(i64),
    Decimal(String),
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            match HumanQuantity::deserialize(deserializer)? {
                HumanQuantity::Units(units) => Ok(Self::from_units(units)),
                HumanQuantity::Decimal(s) => s.parse().map_err(serde::de::Error::custom),
            }
        } else {
            i64::deserialize(deserializer).map(Self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_integers_and_decimals() {
        assert_eq!("10".parse::<Quantity>(), Ok(Quantity::from_units(10)));
        assert_eq!("2.5".parse::<Quantity>(), Ok(Quantity::from_milli(2500)));
        assert_eq!("0.125".parse::<Quantity>(), Ok(Quantity::from_milli(125)));
        assert_eq!("-1.2".parse::<Quantity>(), Ok(Quantity::from_milli(-1200)));
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Quantity>().is_err());
        assert!("1.2345".parse::<Quantity>().is_err());
        assert!("abc".parse::<Quantity>().is_err());
        assert!(".5".parse::<Quantity>().is_err());
        assert!("1.x".parse::<Quantity>().is_err());
    }

    #[test]
    fn display_trims_trailing_zeros() {
        assert_eq!(Quantity::from_milli(2500).to_string(), "2.5");
        assert_eq!(Quantity::from_units(6).to_string(), "6");
        assert_eq!(Quantity::from_milli(-50).to_string(), "-0.05");
    }

    #[test]
    fn shortage_never_negative() {
        let required = Quantity::from_units(10);
        assert_eq!(
            required.shortage_against(Quantity::from_units(6)),
            Quantity::from_units(4)
        );
        assert_eq!(
            required.shortage_against(Quantity::from_units(12)),
            Quantity::ZERO
        );
    }

    #[test]
    fn json_accepts_number_or_string() {
        let a: Quantity = serde_json::from_str("5").expect("int");
        let b: Quantity = serde_json::from_str("\"5.25\"").expect("str");
        assert_eq!(a, Quantity::from_units(5));
        assert_eq!(b, Quantity::from_milli(5250));
        assert_eq!(serde_json::to_string(&b).expect("ser"), "\"5.25\"");
    }

    #[test]
    fn postcard_uses_raw_thousandths() {
        let q = Quantity::from_milli(1750);
        let bytes = postcard::to_allocvec(&q).expect("ser");
        let back: Quantity = postcard::from_bytes(&bytes).expect("de");
        assert_eq!(back, q);
    }
}
