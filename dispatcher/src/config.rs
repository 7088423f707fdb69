//! Configuration loaded from environment variables
//!
//! | variable | default |
//! |---|---|
//! | `CSI_PLUGINS` | empty |
//! | `CSI_ENDPOINT` | `tcp://127.0.0.1:8080` |
//! | `CSI_PROVIDER` | `mock` |
//! | `MODCSI_DIAL_TIMEOUT_MS` | `5000` |
//! | `MODCSI_LOG_LEVEL` | `info` |
//! | `MODCSI_LOG_FORMAT` | `pretty` |
//! | `MODCSI_METRICS_ADDR` | unset (metrics server disabled) |

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DispatchError, RegistryError, Result};

/// Module locations to load at start-up
pub const ENV_PLUGINS: &str = "CSI_PLUGINS";
/// Address the host listens on
pub const ENV_ENDPOINT: &str = "CSI_ENDPOINT";
/// Provider the host exposes
pub const ENV_PROVIDER: &str = "CSI_PROVIDER";
pub const ENV_DIAL_TIMEOUT_MS: &str = "MODCSI_DIAL_TIMEOUT_MS";
pub const ENV_LOG_LEVEL: &str = "MODCSI_LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "MODCSI_LOG_FORMAT";
pub const ENV_METRICS_ADDR: &str = "MODCSI_METRICS_ADDR";

pub const DEFAULT_ENDPOINT: &str = "tcp://127.0.0.1:8080";
pub const DEFAULT_PROVIDER: &str = "mock";
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(5000);

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(DispatchError::Config(format!(
                "{ENV_LOG_FORMAT}: unknown format {other:?}"
            ))),
        }
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Module locations, in load order
    pub plugins: Vec<String>,
    /// `scheme://address` the host listens on
    pub endpoint: String,
    pub provider: String,
    /// Upper bound on setting up an in-memory connection to a plugin
    pub dial_timeout: Duration,
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plugins: Vec::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            provider: DEFAULT_PROVIDER.to_string(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_addr: None,
        }
    }
}

impl Config {
    /// Load from the process environment
    #[allow(clippy::result_large_err)]
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    ///
    /// Unset and empty values fall back to defaults.
    #[allow(clippy::result_large_err)]
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let plugins = match get(ENV_PLUGINS) {
            Some(raw) => parse_plugin_list(&raw)?,
            None => Vec::new(),
        };

        let dial_timeout = match get(ENV_DIAL_TIMEOUT_MS) {
            Some(raw) => {
                let ms: u64 = raw.trim().parse().map_err(|e| {
                    DispatchError::Config(format!("{ENV_DIAL_TIMEOUT_MS}: {raw:?}: {e}"))
                })?;
                if ms == 0 {
                    return Err(DispatchError::Config(format!(
                        "{ENV_DIAL_TIMEOUT_MS} must be greater than zero"
                    )));
                }
                Duration::from_millis(ms)
            }
            None => defaults.dial_timeout,
        };

        let log_format = match get(ENV_LOG_FORMAT) {
            Some(raw) => raw.trim().parse()?,
            None => defaults.log_format,
        };

        let metrics_addr = match get(ENV_METRICS_ADDR) {
            Some(raw) => Some(raw.trim().parse().map_err(|e| {
                DispatchError::Config(format!("{ENV_METRICS_ADDR}: {raw:?}: {e}"))
            })?),
            None => None,
        };

        Ok(Self {
            plugins,
            endpoint: get(ENV_ENDPOINT).unwrap_or(defaults.endpoint),
            provider: get(ENV_PROVIDER).unwrap_or(defaults.provider),
            dial_timeout,
            log_level: get(ENV_LOG_LEVEL).unwrap_or(defaults.log_level),
            log_format,
            metrics_addr,
        })
    }
}

/// Parse a comma-separated module list using CSV quoting rules
///
/// Only the first record is read and an empty input yields an empty list.
///
/// Unlike a plain CSV read, surrounding whitespace is trimmed from every
/// field and blank fields are dropped, so `"a, ,b "` and `"a,,b"` both give
/// `["a", "b"]` rather than passing `" "` or `""` on to the module loader.
pub fn parse_plugin_list(raw: &str) -> std::result::Result<Vec<String>, RegistryError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(raw.as_bytes());

    let mut record = csv::StringRecord::new();
    let found = reader
        .read_record(&mut record)
        .map_err(|e| RegistryError::Config(e.to_string()))?;
    if !found {
        return Ok(Vec::new());
    }

    Ok(record
        .iter()
        .filter(|field| !field.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert!(config.plugins.is_empty());
        assert_eq!(config.endpoint, "tcp://127.0.0.1:8080");
        assert_eq!(config.provider, "mock");
        assert_eq!(config.dial_timeout, Duration::from_secs(5));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(config.metrics_addr.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("CSI_PLUGINS", "mock,csi-lvm"),
            ("CSI_ENDPOINT", "unix:///run/csi.sock"),
            ("CSI_PROVIDER", "LVM"),
            ("MODCSI_DIAL_TIMEOUT_MS", "250"),
            ("MODCSI_LOG_LEVEL", "debug"),
            ("MODCSI_LOG_FORMAT", "JSON"),
            ("MODCSI_METRICS_ADDR", "127.0.0.1:9090"),
        ]))
        .unwrap();

        assert_eq!(config.plugins, vec!["mock", "csi-lvm"]);
        assert_eq!(config.endpoint, "unix:///run/csi.sock");
        assert_eq!(config.provider, "LVM");
        assert_eq!(config.dial_timeout, Duration::from_millis(250));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.metrics_addr, Some("127.0.0.1:9090".parse().unwrap()));
    }

    #[test]
    fn test_empty_values_use_defaults() {
        let config =
            Config::from_lookup(lookup(&[("CSI_PLUGINS", ""), ("CSI_ENDPOINT", "  ")])).unwrap();
        assert!(config.plugins.is_empty());
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn test_malformed_values_rejected() {
        for pairs in [
            [("MODCSI_DIAL_TIMEOUT_MS", "soon")],
            [("MODCSI_DIAL_TIMEOUT_MS", "0")],
            [("MODCSI_LOG_FORMAT", "xml")],
            [("MODCSI_METRICS_ADDR", "not-an-addr")],
        ] {
            let err = Config::from_lookup(lookup(&pairs)).unwrap_err();
            assert!(matches!(err, DispatchError::Config(_)), "{pairs:?}: {err}");
        }
    }

    #[test]
    fn test_plugin_list_quoting() {
        let list = parse_plugin_list(r#"mock,"/opt/csi/a,b.so",,"x""y", lvm "#).unwrap();
        assert_eq!(list, vec!["mock", "/opt/csi/a,b.so", "x\"y", "lvm"]);
    }

    #[test]
    fn test_plugin_list_trims_and_skips_blanks() {
        assert_eq!(parse_plugin_list("a,,b").unwrap(), vec!["a", "b"]);
        assert_eq!(parse_plugin_list(" a , ,b ").unwrap(), vec!["a", "b"]);
        assert!(parse_plugin_list(" , ").unwrap().is_empty());
    }

    #[test]
    fn test_plugin_list_empty() {
        assert!(parse_plugin_list("").unwrap().is_empty());
    }
}
