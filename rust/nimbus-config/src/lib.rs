//! Node configuration
//!
//! Every Nimbus process is configured through environment variables:
//!
//!   MY_IP              this node's address
//!   MGMT_IP            the cluster manager's address
//!   ROUTE_ADDR         the KVS routing layer's address
//!   SCHED_IPS          space-separated scheduler addresses
//!   SYSTEM_FUNC        scheduler | executor | benchmark
//!   THREAD_ID          executor thread id (default 0)
//!   EXECUTOR_ISOLATION normal | strong (default normal)

use serde::{Deserialize, Serialize};
use std::env;
use thiserror::Error;

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while reading the environment
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required variable is absent
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    /// A variable holds an unparseable value
    #[error("invalid value {value} for {var}")]
    Invalid { var: &'static str, value: String },
}

/// Which server this process runs
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemRole {
    Scheduler,
    Executor,
    Benchmark,
}

/// Function pin isolation level of an executor thread
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationMode {
    /// Any number of functions may be pinned
    #[default]
    Normal,
    /// One function per thread; unpin restarts the process
    Strong,
}

/// Fully-resolved node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub my_ip: String,
    pub mgmt_ip: String,
    pub route_addr: String,
    pub scheduler_ips: Vec<String>,
    pub role: SystemRole,
    pub thread_id: u32,
    pub isolation: IsolationMode,
}

impl NodeConfig {
    /// Read the configuration from the process environment
    pub fn from_env() -> ConfigResult<Self> {
        let my_ip = required("MY_IP")?;
        let mgmt_ip = required("MGMT_IP")?;
        let route_addr = required("ROUTE_ADDR")?;

        let scheduler_ips = env::var("SCHED_IPS")
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let role = match required("SYSTEM_FUNC")?.to_lowercase().as_str() {
            "scheduler" => SystemRole::Scheduler,
            "executor" => SystemRole::Executor,
            "benchmark" => SystemRole::Benchmark,
            other => {
                return Err(ConfigError::Invalid {
                    var: "SYSTEM_FUNC",
                    value: other.to_string(),
                })
            }
        };

        let thread_id = match env::var("THREAD_ID") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                var: "THREAD_ID",
                value: raw,
            })?,
            Err(_) => 0,
        };

        let isolation = match env::var("EXECUTOR_ISOLATION") {
            Ok(raw) => match raw.to_lowercase().as_str() {
                "normal" => IsolationMode::Normal,
                "strong" => IsolationMode::Strong,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "EXECUTOR_ISOLATION",
                        value: raw,
                    })
                }
            },
            Err(_) => IsolationMode::Normal,
        };

        Ok(NodeConfig {
            my_ip,
            mgmt_ip,
            route_addr,
            scheduler_ips,
            role,
            thread_id,
            isolation,
        })
    }
}

fn required(var: &'static str) -> ConfigResult<String> {
    env::var(var).map_err(|_| ConfigError::Missing(var))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn set_base_env() {
        env::set_var("MY_IP", "10.0.0.1");
        env::set_var("MGMT_IP", "10.0.0.2");
        env::set_var("ROUTE_ADDR", "10.0.0.3:6350");
        env::set_var("SCHED_IPS", "10.0.0.4 10.0.0.5");
        env::set_var("SYSTEM_FUNC", "executor");
        env::remove_var("THREAD_ID");
        env::remove_var("EXECUTOR_ISOLATION");
    }

    #[test]
    #[serial]
    fn test_full_config_parses() {
        set_base_env();
        env::set_var("THREAD_ID", "2");
        env::set_var("EXECUTOR_ISOLATION", "strong");

        let config = NodeConfig::from_env().unwrap();
        assert_eq!(config.my_ip, "10.0.0.1");
        assert_eq!(config.scheduler_ips.len(), 2);
        assert_eq!(config.role, SystemRole::Executor);
        assert_eq!(config.thread_id, 2);
        assert_eq!(config.isolation, IsolationMode::Strong);
    }

    #[test]
    #[serial]
    fn test_defaults_apply() {
        set_base_env();
        let config = NodeConfig::from_env().unwrap();
        assert_eq!(config.thread_id, 0);
        assert_eq!(config.isolation, IsolationMode::Normal);
    }

    #[test]
    #[serial]
    fn test_missing_required_var_is_an_error() {
        set_base_env();
        env::remove_var("MGMT_IP");
        assert!(matches!(
            NodeConfig::from_env(),
            Err(ConfigError::Missing("MGMT_IP"))
        ));
    }

    #[test]
    #[serial]
    fn test_bad_role_is_rejected() {
        set_base_env();
        env::set_var("SYSTEM_FUNC", "router");
        assert!(matches!(
            NodeConfig::from_env(),
            Err(ConfigError::Invalid { var: "SYSTEM_FUNC", .. })
        ));
    }
}
