//! Node configuration, parsed the way the teacher's config module does:
//! dispatch on the leading byte to pick JSON or YAML (§SPEC_FULL
//! "ambient" §2.10).

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scale::ScalingCurve;

#[derive(Debug)]
pub struct ConfigError(String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ConfigError {}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> ConfigError {
        ConfigError(e.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> ConfigError {
        ConfigError(e.to_string())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct NodeConfig {
    pub name: Option<String>,
    pub control_addr: SocketAddr,
    pub flow_addr: SocketAddr,
    #[serde(default)]
    pub neighbours: Vec<SocketAddr>,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_doctor_period_secs")]
    pub doctor_period_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_max_malformed_frames")]
    pub max_malformed_frames: u32,
    #[serde(default)]
    pub backoff_curve: ScalingCurve,
}

fn default_queue_size() -> usize {
    128
}

fn default_doctor_period_secs() -> u64 {
    5
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_max_malformed_frames() -> u32 {
    3
}

impl NodeConfig {
    pub fn doctor_period(&self) -> Duration {
        Duration::from_secs(self.doctor_period_secs)
    }
}

impl std::str::FromStr for NodeConfig {
    type Err = ConfigError;

    /// Parses a JSON- or YAML-formatted configuration document,
    /// dispatching on whether the trimmed text opens with `{`.
    fn from_str(txt: &str) -> Result<NodeConfig, ConfigError> {
        let trimmed = txt.trim_start();
        if trimmed.starts_with('{') {
            Ok(serde_json::from_str(trimmed)?)
        } else {
            Ok(serde_yaml::from_str(trimmed)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parses_simple_yaml() {
        let yaml = "
controlAddr: 127.0.0.1:7001
flowAddr: 127.0.0.1:7001
neighbours:
  - 127.0.0.1:7002
";
        let cfg = NodeConfig::from_str(yaml).unwrap();
        assert_eq!(cfg.neighbours.len(), 1);
        assert_eq!(cfg.queue_size, 128);
    }

    #[test]
    fn parses_simple_json() {
        let json = r#"{"controlAddr": "127.0.0.1:7001", "flowAddr": "127.0.0.1:7001"}"#;
        let cfg = NodeConfig::from_str(json).unwrap();
        assert!(cfg.neighbours.is_empty());
    }
}
