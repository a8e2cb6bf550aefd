//! Probe policy shared by every attempt of a job.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest ICMP echo payload that fits in a single IPv4 datagram
/// (65535 minus a 20 byte IPv4 header and an 8 byte ICMP header).
pub const MAX_PACKET_SIZE: usize = 65_507;

/// Probe policy
///
/// Copied into every request at creation time and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of attempts per request; negative means unbounded
    pub count: i64,

    /// Cadence between the starts of successive attempts
    #[serde(rename = "interval_ms", with = "millis")]
    pub interval: Duration,

    /// How long a single attempt waits for its reply
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,

    /// IPv4 type-of-service byte applied to outgoing probes
    pub type_of_service: u8,

    /// IPv4 time-to-live applied to outgoing probes
    pub time_to_live: u8,

    /// ICMP payload size in bytes
    pub packet_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            count: 3,
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(3),
            type_of_service: 0,
            time_to_live: 64,
            packet_size: 56,
        }
    }
}

impl Config {
    /// Parse a config from TOML; missing fields take their defaults
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Reject policies no probe could honour
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::invalid("timeout must be greater than zero"));
        }
        if self.time_to_live == 0 {
            return Err(Error::invalid("time to live must be greater than zero"));
        }
        if self.packet_size > MAX_PACKET_SIZE {
            return Err(Error::invalid(format!(
                "packet size {} exceeds maximum of {} bytes",
                self.packet_size, MAX_PACKET_SIZE
            )));
        }
        Ok(())
    }

    /// True when requests built from this config never stop on their own
    pub fn is_unbounded(&self) -> bool {
        self.count < 0
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(!config.is_unbounded());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            count = -1
            interval_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.count, -1);
        assert!(config.is_unbounded());
        assert_eq!(config.interval, Duration::from_millis(250));
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(config.time_to_live, 64);
    }

    #[test]
    fn rejects_zero_timeout() {
        let result = Config::from_toml_str("timeout_ms = 0");
        match result {
            Err(Error::Invalid(msg)) => assert!(msg.contains("timeout")),
            other => panic!("Expected Invalid error, got {:?}", other),
        }
    }

    #[test]
    fn rejects_oversized_payload() {
        let config = Config {
            packet_size: MAX_PACKET_SIZE + 1,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Invalid(_))));
    }

    #[test]
    fn rejects_malformed_toml() {
        let result = Config::from_toml_str("count = \"many\"");
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[test]
    fn toml_round_trip_uses_milliseconds() {
        let config = Config {
            interval: Duration::from_millis(1500),
            ..Config::default()
        };
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("interval_ms = 1500"));
        assert_eq!(Config::from_toml_str(&text).unwrap(), config);
    }
}
