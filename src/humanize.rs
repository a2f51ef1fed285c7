//! Human-readable byte size parsing for configuration values

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid size format: {0}")]
    InvalidFormat(String),

    #[error("Invalid number: {0}")]
    InvalidNumber(#[from] std::num::ParseIntError),

    #[error("Invalid unit: {0}")]
    InvalidUnit(String),
}

/// Byte count accepting `"8MB"`, `"5GB"`, or a plain integer in config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ByteSize(pub u64);

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

impl ByteSize {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl FromStr for ByteSize {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_uppercase();

        if let Ok(plain) = s.parse::<u64>() {
            return Ok(ByteSize(plain));
        }

        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| ParseError::InvalidFormat(s.clone()))?;
        if split == 0 {
            return Err(ParseError::InvalidFormat(s));
        }
        let value: u64 = s[..split].parse()?;
        let multiplier = match s[split..].trim() {
            "B" => 1,
            "K" | "KB" | "KIB" => KIB,
            "M" | "MB" | "MIB" => MIB,
            "G" | "GB" | "GIB" => GIB,
            "T" | "TB" | "TIB" => TIB,
            unit => return Err(ParseError::InvalidUnit(unit.to_string())),
        };
        Ok(ByteSize(value * multiplier))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (divisor, unit) = match self.0 {
            n if n >= TIB => (TIB, "TB"),
            n if n >= GIB => (GIB, "GB"),
            n if n >= MIB => (MIB, "MB"),
            n if n >= KIB => (KIB, "KB"),
            _ => (1, "B"),
        };
        if self.0 % divisor == 0 {
            write!(f, "{}{}", self.0 / divisor, unit)
        } else {
            write!(f, "{:.1}{}", self.0 as f64 / divisor as f64, unit)
        }
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct ByteSizeVisitor;

        impl serde::de::Visitor<'_> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a byte size as string (e.g. \"8MB\") or integer")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(ByteSize(v))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                v.parse::<ByteSize>().map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units_and_plain_numbers() {
        assert_eq!("4096".parse::<ByteSize>().unwrap().as_u64(), 4096);
        assert_eq!("8MB".parse::<ByteSize>().unwrap().as_u64(), 8 * MIB);
        assert_eq!("5GiB".parse::<ByteSize>().unwrap().as_u64(), 5 * GIB);
        assert_eq!("1 K".parse::<ByteSize>().unwrap().as_u64(), KIB);
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<ByteSize>().is_err());
        assert!("MB".parse::<ByteSize>().is_err());
        assert!("8XB".parse::<ByteSize>().is_err());
    }

    #[test]
    fn displays_round_values() {
        assert_eq!(ByteSize(8 * MIB).to_string(), "8MB");
        assert_eq!(ByteSize(5 * GIB).to_string(), "5GB");
        assert_eq!(ByteSize(512).to_string(), "512B");
    }

    #[test]
    fn deserializes_both_forms() {
        #[derive(Deserialize)]
        struct Wrapper {
            size: ByteSize,
        }
        let from_str: Wrapper = serde_json::from_str(r#"{"size":"5GB"}"#).unwrap();
        assert_eq!(from_str.size.as_u64(), 5 * GIB);
        let from_int: Wrapper = serde_json::from_str(r#"{"size":1024}"#).unwrap();
        assert_eq!(from_int.size.as_u64(), 1024);
    }
}
