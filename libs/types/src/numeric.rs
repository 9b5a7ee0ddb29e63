//! Fixed-point decimal types for prices and volumes
//!
//! Uses rust_decimal for deterministic arithmetic (no floating-point errors),
//! so summing volumes across merged bars is exact and order-independent.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::ValueError;

/// A strictly positive price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Price(Decimal);

impl Price {
    /// Create a price, rejecting zero and negative values
    pub fn try_new(value: Decimal) -> Result<Self, ValueError> {
        if value <= Decimal::ZERO {
            return Err(ValueError::NonPositivePrice(value.to_string()));
        }
        Ok(Self(value))
    }

    /// Create a price from a whole number of units
    ///
    /// # Panics
    /// Panics if `value` is zero
    pub fn from_u64(value: u64) -> Self {
        assert!(value > 0, "Price must be positive");
        Self(Decimal::from(value))
    }

    /// Parse a price from its decimal string form
    pub fn from_str(s: &str) -> Result<Self, ValueError> {
        let value = Decimal::from_str(s).map_err(|_| ValueError::Unparseable(s.to_string()))?;
        Self::try_new(value)
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Price {
    type Error = ValueError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::try_new(value)
    }
}

impl From<Price> for Decimal {
    fn from(price: Price) -> Self {
        price.0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A non-negative traded volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Volume(Decimal);

impl Volume {
    pub const ZERO: Volume = Volume(Decimal::ZERO);

    /// Create a volume, rejecting negative values
    pub fn try_new(value: Decimal) -> Result<Self, ValueError> {
        if value < Decimal::ZERO {
            return Err(ValueError::NegativeVolume(value.to_string()));
        }
        Ok(Self(value))
    }

    pub fn from_u64(value: u64) -> Self {
        Self(Decimal::from(value))
    }

    /// Parse a volume from its decimal string form
    pub fn from_str(s: &str) -> Result<Self, ValueError> {
        let value = Decimal::from_str(s).map_err(|_| ValueError::Unparseable(s.to_string()))?;
        Self::try_new(value)
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Sum two volumes, or `None` if the result exceeds `Decimal::MAX`.
    pub fn checked_add(self, rhs: Volume) -> Option<Volume> {
        self.0.checked_add(rhs.0).map(Volume)
    }
}

impl TryFrom<Decimal> for Volume {
    type Error = ValueError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::try_new(value)
    }
}

impl From<Volume> for Decimal {
    fn from(volume: Volume) -> Self {
        volume.0
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_rejects_non_positive() {
        assert!(Price::try_new(Decimal::ZERO).is_err());
        assert!(Price::try_new(Decimal::from(-5)).is_err());
        assert!(Price::try_new(Decimal::from(5)).is_ok());
    }

    #[test]
    fn test_price_from_str() {
        let price = Price::from_str("189.25").unwrap();
        assert_eq!(price.as_decimal(), Decimal::from_str("189.25").unwrap());
        assert!(matches!(Price::from_str("abc"), Err(ValueError::Unparseable(_))));
    }

    #[test]
    fn test_volume_allows_zero_rejects_negative() {
        assert_eq!(Volume::try_new(Decimal::ZERO).unwrap(), Volume::ZERO);
        assert!(Volume::try_new(Decimal::from(-1)).is_err());
    }

    #[test]
    fn test_volume_addition_is_exact() {
        let a = Volume::from_str("0.1").unwrap();
        let b = Volume::from_str("0.2").unwrap();
        assert_eq!(a.checked_add(b), Some(Volume::from_str("0.3").unwrap()));
    }

    #[test]
    fn test_volume_addition_overflow_is_none() {
        let max = Volume::try_new(Decimal::MAX).unwrap();
        assert_eq!(max.checked_add(Volume::from_u64(1)), None);
        assert_eq!(max.checked_add(Volume::ZERO), Some(max));
    }

    #[test]
    fn test_price_serializes_as_string() {
        let price = Price::from_str("100.5").unwrap();
        assert_eq!(serde_json::to_string(&price).unwrap(), "\"100.5\"");
    }

    #[test]
    fn test_deserialization_validates() {
        assert!(serde_json::from_str::<Price>("\"0\"").is_err());
        assert!(serde_json::from_str::<Volume>("\"-3\"").is_err());
        assert_eq!(serde_json::from_str::<Volume>("\"12\"").unwrap(), Volume::from_u64(12));
    }
}
