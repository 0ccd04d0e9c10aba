//! Engine configuration.
//!
//! Defines the retention window, calendar reference offset, input validation
//! rules and sharding parameters.

use std::fs;
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::UtcOffset;

use crate::error::{Error, Result};

/// Hard ceiling on a single transaction amount, whatever the config says.
pub const AMOUNT_CEILING: i64 = 1_000_000_000_000_000;

/// [`AMOUNT_CEILING`] as a `Decimal`.
pub fn amount_ceiling() -> Decimal {
    Decimal::from(AMOUNT_CEILING)
}

/// Configuration for an [`AggregationEngine`](crate::engine::AggregationEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Length of the trailing window in calendar days.
    /// Default: 30
    pub window_days: u32,

    /// Offset (minutes east of UTC) used to assign events to calendar days.
    /// Default: 0 (UTC)
    pub reference_offset_minutes: i16,

    /// Accepted shape of `customer_id`.
    /// Default: any non-empty id without surrounding whitespace
    pub customer_id_format: CustomerIdFormat,

    /// Largest single transaction amount accepted.
    /// Default: 1 000 000 000 000
    pub max_amount: Decimal,

    /// Worker threads used by the sharded driver.
    /// Default: 4
    pub workers: usize,

    /// Bounded channel capacity per worker.
    /// Default: 1000
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_days: 30,
            reference_offset_minutes: 0,
            customer_id_format: CustomerIdFormat::Any,
            max_amount: Decimal::from(1_000_000_000_000_i64),
            workers: 4,
            channel_capacity: 1000,
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read(path.as_ref())?;
        let config: EngineConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_days == 0 {
            return Err(Error::Config("window_days must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        if self.channel_capacity == 0 {
            return Err(Error::Config("channel_capacity must be at least 1".into()));
        }
        if self.max_amount <= Decimal::ZERO {
            return Err(Error::Config("max_amount must be positive".into()));
        }
        if self.max_amount > amount_ceiling() {
            return Err(Error::Config(format!(
                "max_amount must not exceed {}",
                AMOUNT_CEILING
            )));
        }
        if let CustomerIdFormat::PrefixDigits { digits: 0, .. } = self.customer_id_format {
            return Err(Error::Config("customer_id_format digits must be at least 1".into()));
        }
        self.reference_offset()?;
        Ok(())
    }

    /// The calendar offset as a `time::UtcOffset`.
    pub fn reference_offset(&self) -> Result<UtcOffset> {
        UtcOffset::from_whole_seconds(i32::from(self.reference_offset_minutes) * 60).map_err(
            |err| {
                Error::Config(format!(
                    "reference_offset_minutes {} out of range: {err}",
                    self.reference_offset_minutes
                ))
            },
        )
    }
}

/// Accepted `customer_id` shapes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CustomerIdFormat {
    /// Any non-empty id without leading or trailing whitespace.
    #[default]
    Any,
    /// A fixed prefix followed by exactly `digits` ASCII digits (e.g. `C042`).
    PrefixDigits { prefix: String, digits: usize },
}

impl CustomerIdFormat {
    pub fn matches(&self, customer_id: &str) -> bool {
        if customer_id.is_empty() || customer_id.trim() != customer_id {
            return false;
        }
        match self {
            CustomerIdFormat::Any => true,
            CustomerIdFormat::PrefixDigits { prefix, digits } => {
                match customer_id.strip_prefix(prefix.as_str()) {
                    Some(rest) => rest.len() == *digits && rest.bytes().all(|b| b.is_ascii_digit()),
                    None => false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.window_days, 30);
        assert_eq!(config.reference_offset_minutes, 0);
        assert_eq!(config.customer_id_format, CustomerIdFormat::Any);
        assert_eq!(config.workers, 4);
        assert_eq!(config.channel_capacity, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"window_days": 7, "max_amount": "500.25"}"#).unwrap();
        assert_eq!(config.window_days, 7);
        assert_eq!(config.max_amount, "500.25".parse::<Decimal>().unwrap());
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn test_customer_id_format_serialization() {
        let format = CustomerIdFormat::PrefixDigits {
            prefix: "C".into(),
            digits: 3,
        };
        let json = serde_json::to_string(&format).unwrap();
        assert!(json.contains("\"type\":\"PrefixDigits\""));
        let back: CustomerIdFormat = serde_json::from_str(&json).unwrap();
        assert_eq!(back, format);
    }

    #[test]
    fn test_prefix_digits_matching() {
        let format = CustomerIdFormat::PrefixDigits {
            prefix: "C".into(),
            digits: 3,
        };
        assert!(format.matches("C001"));
        assert!(!format.matches("C01"));
        assert!(!format.matches("C0001"));
        assert!(!format.matches("D001"));
        assert!(!format.matches("C0a1"));
    }

    #[test]
    fn test_any_rejects_blank_and_padded() {
        let format = CustomerIdFormat::Any;
        assert!(format.matches("customer-7"));
        assert!(!format.matches(""));
        assert!(!format.matches(" C1"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.window_days = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.workers = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.reference_offset_minutes = 26 * 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_caps_max_amount() {
        let mut config = EngineConfig::default();
        config.max_amount = Decimal::MAX;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.max_amount = amount_ceiling();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_id_format_defaults_to_any() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.customer_id_format, CustomerIdFormat::default());
        assert_eq!(CustomerIdFormat::default(), CustomerIdFormat::Any);
    }

    #[test]
    fn test_reference_offset() {
        let mut config = EngineConfig::default();
        config.reference_offset_minutes = -300;
        let offset = config.reference_offset().unwrap();
        assert_eq!(offset.whole_hours(), -5);
    }
}
