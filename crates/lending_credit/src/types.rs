//! Fixed-width hex identifiers and the amount serde adapter.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use primitive_types::U256;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TypesError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    #[error("expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
}

macro_rules! fixed_hex {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; $len]);

        impl FromStr for $name {
            type Err = TypesError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = s.trim();
                let digits = raw
                    .strip_prefix("0x")
                    .or_else(|| raw.strip_prefix("0X"))
                    .unwrap_or(raw);
                let bytes =
                    hex::decode(digits).map_err(|_| TypesError::InvalidHex(s.to_string()))?;
                let got = bytes.len();
                let arr: [u8; $len] = bytes.try_into().map_err(|_| TypesError::InvalidLength {
                    expected: $len,
                    got,
                })?;
                Ok(Self(arr))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(self, f)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

fixed_hex!(
    /// 20-byte account / contract address.
    Address,
    20
);

fixed_hex!(
    /// 32-byte market identifier (Morpho Blue `Id`).
    MarketId,
    32
);

/// Parse an amount from a decimal string or a `0x`-prefixed hex string.
pub fn parse_amount(s: &str) -> Result<U256, TypesError> {
    let t = s.trim();
    let parsed = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        Some(digits) => U256::from_str_radix(digits, 16).ok(),
        None => U256::from_dec_str(t).ok(),
    };
    parsed.ok_or_else(|| TypesError::InvalidAmount(s.to_string()))
}

/// Serde adapter for `U256` fields: writes decimal strings, reads decimal
/// strings, hex strings or JSON integers.
pub mod amount {
    use super::{parse_amount, U256};
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        struct AmountVisitor;

        impl Visitor<'_> for AmountVisitor {
            type Value = U256;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a decimal or 0x-hex amount string, or an unsigned integer")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<U256, E> {
                Ok(U256::from(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<U256, E> {
                parse_amount(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}
