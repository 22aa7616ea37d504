use std::fs;
use std::net::SocketAddr;
use std::{collections::BTreeMap, collections::HashSet};

use log::{debug, trace};
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::{policy::RoutingPolicy, registry::InstanceSpec};

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Config::validate_export_window"))]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    #[validate(nested)]
    pub registry: Registry,
    #[validate(nested)]
    pub balancer: Balancer,
    #[validate(nested)]
    #[serde(default)]
    pub stats: Stats,
    #[validate(nested)]
    pub export: Option<Export>,

    pub admin: Option<Admin>,
    pub status: Option<Status>,
    pub prometheus: Option<Prometheus>,
    pub log: Option<Log>,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    // config file load entry point
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");

        conf.validate()
            .or_err_with(FileReadError, || "Conf file valid failed")?;

        Ok(conf)
    }

    #[allow(dead_code)]
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }

    fn validate_export_window(&self) -> Result<(), ValidationError> {
        if let Some(export) = &self.export {
            let window = export.window_seconds.unwrap_or(self.stats.default_window());
            if !self.stats.windows_seconds.contains(&window) {
                let mut err = ValidationError::new("export_window_not_configured");
                err.add_param("window_seconds".into(), &window);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Window used by the billing export.
    pub fn export_window(&self) -> u64 {
        self.export
            .as_ref()
            .and_then(|e| e.window_seconds)
            .unwrap_or(self.stats.default_window())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Registry {
    pub address: SocketAddr,
    #[serde(default = "Registry::default_ttl_seconds")]
    #[validate(range(min = 1))]
    pub default_ttl_seconds: u64,
    #[serde(default = "Registry::default_sweep_interval_ms")]
    #[validate(range(min = 10))]
    pub sweep_interval_ms: u64,
    #[serde(default = "Registry::default_expired_grace_seconds")]
    pub expired_grace_seconds: u64,

    /// Records registered at startup, like any owner-registered instance.
    #[serde(default)]
    #[validate(nested)]
    pub instances: Vec<InstanceSpec>,
}

impl Registry {
    fn default_ttl_seconds() -> u64 {
        30
    }

    fn default_sweep_interval_ms() -> u64 {
        1000
    }

    fn default_expired_grace_seconds() -> u64 {
        60
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 9180)),
            default_ttl_seconds: Self::default_ttl_seconds(),
            sweep_interval_ms: Self::default_sweep_interval_ms(),
            expired_grace_seconds: Self::default_expired_grace_seconds(),
            instances: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Balancer::validate_policies"))]
pub struct Balancer {
    pub address: SocketAddr,
    pub proxy_address: Option<SocketAddr>,
    #[serde(default = "Balancer::default_least_conn_decay_ms")]
    #[validate(range(min = 1))]
    pub least_conn_decay_ms: u64,

    /// Policies applied at startup, keyed by image.
    #[serde(default)]
    pub policies: BTreeMap<String, RoutingPolicy>,
}

impl Balancer {
    fn default_least_conn_decay_ms() -> u64 {
        30_000
    }

    fn validate_policies(&self) -> Result<(), ValidationError> {
        for (image, policy) in &self.policies {
            if policy.validate().is_err() {
                let mut err = ValidationError::new("invalid_routing_policy");
                err.add_param("image".into(), image);
                return Err(err);
            }
        }
        Ok(())
    }
}

impl Default for Balancer {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            proxy_address: None,
            least_conn_decay_ms: Self::default_least_conn_decay_ms(),
            policies: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Stats::validate_windows"))]
pub struct Stats {
    #[serde(default = "Stats::default_windows_seconds")]
    #[validate(length(min = 1))]
    pub windows_seconds: Vec<u64>,
    #[serde(default = "Stats::default_archive_depth")]
    pub archive_depth: usize,
}

impl Stats {
    /// One year.
    pub const MAX_WINDOW_SECONDS: u64 = 366 * 24 * 3600;

    fn default_windows_seconds() -> Vec<u64> {
        vec![60, 300, 3600]
    }

    fn default_archive_depth() -> usize {
        16
    }

    fn validate_windows(&self) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for window in &self.windows_seconds {
            if *window == 0 {
                return Err(ValidationError::new("window_must_be_positive"));
            }
            if *window > Self::MAX_WINDOW_SECONDS {
                return Err(ValidationError::new("window_too_large"));
            }
            if !seen.insert(window) {
                return Err(ValidationError::new("duplicate_window"));
            }
        }
        Ok(())
    }

    /// Smallest configured window.
    pub fn default_window(&self) -> u64 {
        self.windows_seconds.iter().copied().min().unwrap_or(60)
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            windows_seconds: Self::default_windows_seconds(),
            archive_depth: Self::default_archive_depth(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Export {
    #[serde(default = "Export::default_interval_seconds")]
    #[validate(range(min = 1))]
    pub interval_seconds: u64,
    /// Defaults to the smallest stats window.
    pub window_seconds: Option<u64>,
    /// Exports are written here when set, otherwise only logged.
    pub directory: Option<String>,
}

impl Export {
    fn default_interval_seconds() -> u64 {
        300
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Admin {
    pub api_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Status {
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Prometheus {
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Log {
    pub path: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Algorithm;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn not_a_test_i_cannot_write_yaml_by_hand() {
        init_log();
        let conf = Config::default();
        // cargo test -- --nocapture not_a_test_i_cannot_write_yaml_by_hand
        println!("{}", conf.to_yaml());
    }

    #[test]
    fn test_load_file() {
        init_log();
        let conf_str = r#"
---
pingora:
  version: 1
  threads: 2

registry:
  address: 0.0.0.0:9180
  default_ttl_seconds: 10
  sweep_interval_ms: 500
  instances:
    - instance_id: demo-1
      name: web
      image: demo-app
      host: 127.0.0.1
      port: 9001
      metadata:
        weight: "2"

balancer:
  address: 0.0.0.0:8080
  proxy_address: 0.0.0.0:8081
  policies:
    demo-app:
      algorithm: weighted_rr
      weights:
        demo-1: 2
      sticky_key: cookie_session

stats:
  windows_seconds: [60, 300]
  archive_depth: 4

export:
  interval_seconds: 60
  window_seconds: 300
  directory: /tmp/pingmesh

admin:
  api_key: secret

status:
  address: 0.0.0.0:7085

prometheus:
  address: 0.0.0.0:9091

log:
  path: /var/log/pingmesh.log
        "#;
        let conf = Config::from_yaml(conf_str).unwrap();
        assert_eq!(2, conf.pingora.threads);
        assert_eq!(10, conf.registry.default_ttl_seconds);
        assert_eq!(60, conf.registry.expired_grace_seconds);
        assert_eq!(1, conf.registry.instances.len());
        assert_eq!(30_000, conf.balancer.least_conn_decay_ms);
        assert_eq!(
            Algorithm::WeightedRr,
            conf.balancer.policies["demo-app"].algorithm
        );
        assert_eq!(300, conf.export_window());
        assert_eq!("secret", conf.admin.unwrap().api_key);
        print!("{}", conf.to_yaml());
    }

    #[test]
    fn test_defaults() {
        init_log();
        let conf_str = r#"
---
registry:
  address: 127.0.0.1:9180
balancer:
  address: 127.0.0.1:8080
        "#;
        let conf = Config::from_yaml(conf_str).unwrap();
        assert_eq!(30, conf.registry.default_ttl_seconds);
        assert_eq!(1000, conf.registry.sweep_interval_ms);
        assert_eq!(vec![60, 300, 3600], conf.stats.windows_seconds);
        assert_eq!(16, conf.stats.archive_depth);
        assert!(conf.export.is_none());
        assert!(conf.admin.is_none());
        assert_eq!(60, conf.export_window());
    }

    #[test]
    fn test_valid_ttl_and_sweep_interval() {
        init_log();
        let conf_str = r#"
---
registry:
  address: 127.0.0.1:9180
  default_ttl_seconds: 0
balancer:
  address: 127.0.0.1:8080
        "#;
        assert!(Config::from_yaml(conf_str).is_err());

        let conf_str = r#"
---
registry:
  address: 127.0.0.1:9180
  sweep_interval_ms: 1
balancer:
  address: 127.0.0.1:8080
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_valid_seed_instance() {
        init_log();
        let conf_str = r#"
---
registry:
  address: 127.0.0.1:9180
  instances:
    - name: web
      image: demo-app
      host: "not a host"
      port: 9001
balancer:
  address: 127.0.0.1:8080
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_valid_seed_policy() {
        init_log();
        let conf_str = r#"
---
registry:
  address: 127.0.0.1:9180
balancer:
  address: 127.0.0.1:8080
  policies:
    demo-app:
      algorithm: weighted_rr
        "#;
        assert!(Config::from_yaml(conf_str).is_err());

        let conf_str = r#"
---
registry:
  address: 127.0.0.1:9180
balancer:
  address: 127.0.0.1:8080
  policies:
    demo-app:
      algorithm: random
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_valid_stats_windows() {
        init_log();
        let conf_str = r#"
---
registry:
  address: 127.0.0.1:9180
balancer:
  address: 127.0.0.1:8080
stats:
  windows_seconds: [60, 60]
        "#;
        assert!(Config::from_yaml(conf_str).is_err());

        let conf_str = r#"
---
registry:
  address: 127.0.0.1:9180
balancer:
  address: 127.0.0.1:8080
stats:
  windows_seconds: []
        "#;
        assert!(Config::from_yaml(conf_str).is_err());

        let conf_str = r#"
---
registry:
  address: 127.0.0.1:9180
balancer:
  address: 127.0.0.1:8080
stats:
  windows_seconds: [60, 18446744073709551615]
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_valid_export_window() {
        init_log();
        let conf_str = r#"
---
registry:
  address: 127.0.0.1:9180
balancer:
  address: 127.0.0.1:8080
stats:
  windows_seconds: [60]
export:
  window_seconds: 300
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }
}
