//! Receiver configuration from environment variables
//!
//! | Variable | Default |
//! |---|---|
//! | `BLESNAP_IMAGE_VALIDATION` | `strict` |
//! | `BLESNAP_IDLE_TIMEOUT_MS` | `5000` |
//! | `BLESNAP_MTU` | `512` |
//! | `BLESNAP_SCAN_SECONDS` | `3` |
//! | `BLESNAP_OUTPUT_DIR` | unset |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::image_validation::ValidationLevel;
use crate::protocol::{notify_payload_len, PREFERRED_MTU};

const ENV_VALIDATION: &str = "BLESNAP_IMAGE_VALIDATION";
const ENV_IDLE_TIMEOUT_MS: &str = "BLESNAP_IDLE_TIMEOUT_MS";
const ENV_MTU: &str = "BLESNAP_MTU";
const ENV_SCAN_SECONDS: &str = "BLESNAP_SCAN_SECONDS";
const ENV_OUTPUT_DIR: &str = "BLESNAP_OUTPUT_DIR";

const DEFAULT_IDLE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_SCAN_SECONDS: u64 = 3;

/// Settings of a capture session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Check applied to every completed image
    pub validation: ValidationLevel,
    /// Silence after which a partial image is abandoned; 0 disables the
    /// watchdog
    pub idle_timeout_ms: u64,
    /// MTU requested before triggering a capture
    pub mtu: u16,
    /// Scan window length
    pub scan_seconds: u64,
    /// Where completed images are written, if anywhere
    pub output_dir: Option<PathBuf>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            validation: ValidationLevel::default(),
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            mtu: PREFERRED_MTU,
            scan_seconds: DEFAULT_SCAN_SECONDS,
            output_dir: None,
        }
    }
}

impl ReceiverConfig {
    /// Read the configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let validation = lookup(ENV_VALIDATION)
            .map(|v| ValidationLevel::from_env_str(&v))
            .unwrap_or(defaults.validation);

        let output_dir = lookup(ENV_OUTPUT_DIR)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let idle_timeout_ms = parse_or(&lookup, ENV_IDLE_TIMEOUT_MS, defaults.idle_timeout_ms);
        let idle_timeout_ms = match idle_timeout_ms {
            0 => {
                log::warn!(
                    "{}=0 would abandon every image, using default {}",
                    ENV_IDLE_TIMEOUT_MS,
                    defaults.idle_timeout_ms
                );
                defaults.idle_timeout_ms
            }
            ms => ms,
        };

        Self {
            validation,
            idle_timeout_ms,
            mtu: parse_or(&lookup, ENV_MTU, defaults.mtu),
            scan_seconds: parse_or(&lookup, ENV_SCAN_SECONDS, defaults.scan_seconds),
            output_dir,
        }
    }

    /// Idle timeout as a `Duration`
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Largest notification payload at the configured MTU
    pub fn max_fragment_len(&self) -> usize {
        notify_payload_len(self.mtu)
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("Invalid {}='{}', using default {}", key, raw, default);
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ReceiverConfig::from_lookup(|_| None);
        assert_eq!(config, ReceiverConfig::default());
        assert_eq!(config.validation, ValidationLevel::Strict);
        assert_eq!(config.idle_timeout(), Duration::from_secs(5));
        assert_eq!(config.mtu, 512);
        assert_eq!(config.scan_seconds, 3);
        assert_eq!(config.max_fragment_len(), 509);
        assert!(config.output_dir.is_none());
    }

    #[test]
    fn test_all_variables() {
        let config = ReceiverConfig::from_lookup(lookup_from(&[
            ("BLESNAP_IMAGE_VALIDATION", "minimal"),
            ("BLESNAP_IDLE_TIMEOUT_MS", "250"),
            ("BLESNAP_MTU", "185"),
            ("BLESNAP_SCAN_SECONDS", "10"),
            ("BLESNAP_OUTPUT_DIR", "/tmp/images"),
        ]));

        assert_eq!(config.validation, ValidationLevel::Minimal);
        assert_eq!(config.idle_timeout_ms, 250);
        assert_eq!(config.mtu, 185);
        assert_eq!(config.max_fragment_len(), 182);
        assert_eq!(config.scan_seconds, 10);
        assert_eq!(config.output_dir, Some(PathBuf::from("/tmp/images")));
    }

    #[test]
    fn test_invalid_numbers_fall_back() {
        let config = ReceiverConfig::from_lookup(lookup_from(&[
            ("BLESNAP_IDLE_TIMEOUT_MS", "soon"),
            ("BLESNAP_MTU", "70000"),
            ("BLESNAP_SCAN_SECONDS", "-1"),
        ]));

        assert_eq!(config.idle_timeout_ms, 5000);
        assert_eq!(config.mtu, 512);
        assert_eq!(config.scan_seconds, 3);
    }

    #[test]
    fn test_zero_idle_timeout_falls_back() {
        let config =
            ReceiverConfig::from_lookup(lookup_from(&[("BLESNAP_IDLE_TIMEOUT_MS", "0")]));
        assert_eq!(config.idle_timeout_ms, 5000);
    }

    #[test]
    fn test_blank_output_dir_is_unset() {
        let config = ReceiverConfig::from_lookup(lookup_from(&[("BLESNAP_OUTPUT_DIR", "  ")]));
        assert!(config.output_dir.is_none());
    }

    #[test]
    fn test_serde_defaults_for_missing_fields() {
        let config: ReceiverConfig = serde_json::from_str(r#"{"mtu":247}"#).unwrap();
        assert_eq!(config.mtu, 247);
        assert_eq!(config.idle_timeout_ms, 5000);

        let json = serde_json::to_string(&ReceiverConfig::default()).unwrap();
        assert!(json.contains("\"validation\":\"strict\""));
    }
}
