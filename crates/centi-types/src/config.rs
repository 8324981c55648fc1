//! Per-instance microservice configuration, applied by `init_microservice`.
//!
//! The control plane sends loosely typed values (`"true"`, `"1"`, `"4"`,
//! real JSON booleans and numbers all occur). Anything that cannot be
//! interpreted is replaced by its default and logged; configuration errors
//! are never fatal.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Default stream channel selector.
pub const DEFAULT_CHANNEL: u16 = 4;

/// Default connection-attempt budget (path polls per candidate).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Configuration of one microservice instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicroserviceConfig {
    /// Register the announce listener / run the discovery loop.
    pub autodiscovery: bool,
    /// Accept inbound connections and announce ourselves.
    pub run_as_server: bool,
    /// Channel (stream backend) or port selector.
    pub channel_no: u16,
    /// Path polls before a connection attempt is abandoned.
    pub max_attempts: u32,
    /// Opaque path handed to the transport collaborator.
    pub config_path: Option<String>,
}

impl Default for MicroserviceConfig {
    fn default() -> Self {
        Self {
            autodiscovery: false,
            run_as_server: false,
            channel_no: DEFAULT_CHANNEL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            config_path: None,
        }
    }
}

impl MicroserviceConfig {
    /// Build a configuration from `init_microservice` arguments, substituting
    /// defaults for missing or malformed fields.
    pub fn from_args(args: &Value) -> Self {
        let defaults = Self::default();
        let get = |name: &str| args.as_object().and_then(|m| m.get(name));

        Self {
            autodiscovery: lenient(get("autodiscovery"), defaults.autodiscovery, |v| {
                parse_bool("autodiscovery", v)
            }),
            run_as_server: lenient(get("run_as_server"), defaults.run_as_server, |v| {
                parse_bool("run_as_server", v)
            }),
            channel_no: lenient(get("channel_no"), defaults.channel_no, |v| {
                parse_uint("channel_no", v)
                    .and_then(|n| u16::try_from(n).map_err(|_| invalid("channel_no", v)))
            }),
            max_attempts: lenient(get("max_attempts"), defaults.max_attempts, |v| {
                parse_uint("max_attempts", v).and_then(|n| match u32::try_from(n) {
                    Ok(0) | Err(_) => Err(invalid("max_attempts", v)),
                    Ok(n) => Ok(n),
                })
            }),
            config_path: get("config_path")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from),
        }
    }
}

fn lenient<T>(
    value: Option<&Value>,
    default: T,
    parse: impl FnOnce(&Value) -> Result<T, ConfigError>,
) -> T {
    match value {
        None | Some(Value::Null) => default,
        Some(v) => parse(v).unwrap_or_else(|e| {
            warn!(error = %e, "Ignoring configuration value, using default");
            default
        }),
    }
}

fn invalid(field: &'static str, value: &Value) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        value: value.to_string(),
    }
}

/// Interpret a loosely typed boolean.
///
/// `true`, `"true"` and `"1"` (trimmed, any case) are true; other strings and
/// `false` are false. Non-string, non-boolean values are errors.
pub fn parse_bool(field: &'static str, value: &Value) -> Result<bool, ConfigError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => {
            let s = s.trim().to_lowercase();
            Ok(s == "true" || s == "1")
        }
        Value::Number(n) => Ok(n.as_u64() == Some(1)),
        _ => Err(invalid(field, value)),
    }
}

/// Interpret a loosely typed unsigned integer.
pub fn parse_uint(field: &'static str, value: &Value) -> Result<u64, ConfigError> {
    match value {
        Value::Number(n) => n.as_u64().ok_or_else(|| invalid(field, value)),
        Value::String(s) => s.trim().parse::<u64>().map_err(|_| invalid(field, value)),
        _ => Err(invalid(field, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_when_empty() {
        assert_eq!(
            MicroserviceConfig::from_args(&json!({})),
            MicroserviceConfig::default()
        );
        assert_eq!(
            MicroserviceConfig::from_args(&Value::Null),
            MicroserviceConfig::default()
        );
    }

    #[test]
    fn test_string_and_native_values() {
        let cfg = MicroserviceConfig::from_args(&json!({
            "autodiscovery": " True ",
            "run_as_server": true,
            "channel_no": "7",
            "max_attempts": 3,
            "config_path": "/etc/overlay",
        }));
        assert!(cfg.autodiscovery);
        assert!(cfg.run_as_server);
        assert_eq!(cfg.channel_no, 7);
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.config_path.as_deref(), Some("/etc/overlay"));
    }

    #[test]
    fn test_malformed_values_fall_back() {
        let cfg = MicroserviceConfig::from_args(&json!({
            "autodiscovery": ["yes"],
            "channel_no": "seven",
            "max_attempts": 0,
        }));
        assert!(!cfg.autodiscovery);
        assert_eq!(cfg.channel_no, DEFAULT_CHANNEL);
        assert_eq!(cfg.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn test_out_of_range_channel() {
        let cfg = MicroserviceConfig::from_args(&json!({"channel_no": 70000}));
        assert_eq!(cfg.channel_no, DEFAULT_CHANNEL);
    }

    #[test]
    fn test_parse_bool_variants() {
        assert!(parse_bool("x", &json!("1")).unwrap());
        assert!(!parse_bool("x", &json!("no")).unwrap());
        assert!(!parse_bool("x", &json!(false)).unwrap());
        assert!(parse_bool("x", &json!({})).is_err());
    }
}
