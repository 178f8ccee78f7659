//! Configuration for the coordinator binary and its query-node fleet.
//!
//! The file is YAML with three sections (`data`, `task`, `querynode`) and can
//! be overridden with `WAGGLE_`-prefixed environment variables, e.g.
//! `WAGGLE_TASK__NUM_THREADS=8` maps to `task.num_threads`.

use std::collections::BTreeMap;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::Deserialize;
use thiserror::Error;
use waggle_error::{ErrorCodes, WaggleError};
use waggle_types::{BalanceMode, IvfPqParams, ParamsError, MAX_QUERYNODE_NUM};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Figment(#[from] figment::Error),
    #[error(transparent)]
    Params(#[from] ParamsError),
    #[error("querynode count {0} exceeds the maximum of {MAX_QUERYNODE_NUM}")]
    TooManyQueryNodes(usize),
    #[error("querynode section is missing key `{0}`")]
    MissingQueryNodeKey(String),
    #[error("querynode key `{key}` holds an invalid value: {value}")]
    InvalidQueryNodeValue { key: String, value: String },
}

impl WaggleError for ConfigError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::InvalidArgument
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    #[serde(rename = "D")]
    pub d: usize,
    pub nb: usize,
    pub mp: usize,
    pub ncentroids: usize,
    pub index_path: String,
    pub db_path: String,
    pub query_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    pub nq: usize,
    pub nprobe: usize,
    pub k: usize,
    pub batch_size: usize,
    pub num_threads: usize,
    #[serde(default)]
    pub global_caches: usize,
    #[serde(default)]
    pub balance_mode: BalanceMode,
}

/// Raw `querynode` section. Endpoints are keyed `a<i>` (host) and `p<i>`
/// (port), indexed from zero up to `num_querynodes`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryNodeConfig {
    pub num_querynodes: usize,
    #[serde(flatten)]
    entries: BTreeMap<String, ConfigScalar>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ConfigScalar {
    Int(i64),
    Str(String),
}

impl ConfigScalar {
    fn as_host(&self) -> String {
        match self {
            ConfigScalar::Int(i) => i.to_string(),
            ConfigScalar::Str(s) => s.clone(),
        }
    }

    fn as_port(&self) -> Option<u16> {
        match self {
            ConfigScalar::Int(i) => u16::try_from(*i).ok(),
            ConfigScalar::Str(s) => s.parse().ok(),
        }
    }
}

/// Host and port of one query node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryNodeEndpoint {
    pub host: String,
    pub port: u16,
}

impl QueryNodeEndpoint {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for QueryNodeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl QueryNodeConfig {
    pub fn endpoints(&self) -> Result<Vec<QueryNodeEndpoint>, ConfigError> {
        if self.num_querynodes > MAX_QUERYNODE_NUM {
            return Err(ConfigError::TooManyQueryNodes(self.num_querynodes));
        }
        let mut endpoints = Vec::with_capacity(self.num_querynodes);
        for i in 0..self.num_querynodes {
            let host_key = format!("a{}", i);
            let port_key = format!("p{}", i);
            let host = self
                .entries
                .get(&host_key)
                .ok_or(ConfigError::MissingQueryNodeKey(host_key))?
                .as_host();
            let port_value = self
                .entries
                .get(&port_key)
                .ok_or_else(|| ConfigError::MissingQueryNodeKey(port_key.clone()))?;
            let port = port_value
                .as_port()
                .ok_or_else(|| ConfigError::InvalidQueryNodeValue {
                    key: port_key,
                    value: port_value.as_host(),
                })?;
            endpoints.push(QueryNodeEndpoint { host, port });
        }
        Ok(endpoints)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RootConfig {
    pub data: DataConfig,
    pub task: TaskConfig,
    pub querynode: QueryNodeConfig,
}

impl RootConfig {
    pub fn load_from_path(path: &str) -> Result<Self, ConfigError> {
        // Figment does not support environment variables with underscores in
        // key names, so `__` stands in for the section separator.
        let env = Env::prefixed("WAGGLE_").map(|k| k.as_str().replace("__", ".").into());
        let config: RootConfig = Figment::from(Yaml::file(path)).merge(env).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn params(&self) -> IvfPqParams {
        IvfPqParams::from_dataset(self.data.nb, self.data.d, self.data.mp, self.data.ncentroids)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.params().validate()?;
        self.querynode.endpoints()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
data:
  D: 128
  nb: 10000
  mp: 16
  ncentroids: 64
  index_path: /tmp/waggle/index
  db_path: /tmp/waggle/db
  query_path: /tmp/waggle/query
task:
  nq: 100
  nprobe: 8
  k: 10
  batch_size: 50
  num_threads: 4
  global_caches: 2
  balance_mode: best_fit_hybrid
querynode:
  num_querynodes: 2
  a0: "10.0.0.1"
  p0: 50051
  a1: "10.0.0.2"
  p1: 50052
"#;

    #[test]
    fn test_load_config() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("waggle.yaml", CONFIG)?;
            let config = RootConfig::load_from_path("waggle.yaml").unwrap();
            assert_eq!(config.data.d, 128);
            assert_eq!(config.task.balance_mode, BalanceMode::BestFitHybrid);
            assert_eq!(config.task.global_caches, 2);
            let endpoints = config.querynode.endpoints().unwrap();
            assert_eq!(
                endpoints,
                vec![
                    QueryNodeEndpoint {
                        host: "10.0.0.1".to_string(),
                        port: 50051
                    },
                    QueryNodeEndpoint {
                        host: "10.0.0.2".to_string(),
                        port: 50052
                    },
                ]
            );
            assert_eq!(endpoints[0].base_url(), "http://10.0.0.1:50051");

            let params = config.params();
            assert_eq!(params.kc, 64);
            assert_eq!(params.dp, 8);
            assert!(params.validate().is_ok());
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("waggle.yaml", CONFIG)?;
            jail.set_env("WAGGLE_TASK__NUM_THREADS", "9");
            let config = RootConfig::load_from_path("waggle.yaml").unwrap();
            assert_eq!(config.task.num_threads, 9);
            Ok(())
        });
    }

    #[test]
    fn test_missing_endpoint_key_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "waggle.yaml",
                &CONFIG.replace("  a1: \"10.0.0.2\"\n", ""),
            )?;
            let err = RootConfig::load_from_path("waggle.yaml").unwrap_err();
            assert!(matches!(err, ConfigError::MissingQueryNodeKey(k) if k == "a1"));
            Ok(())
        });
    }

    #[test]
    fn test_indivisible_dimension_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("waggle.yaml", &CONFIG.replace("mp: 16", "mp: 27"))?;
            let err = RootConfig::load_from_path("waggle.yaml").unwrap_err();
            assert!(matches!(err, ConfigError::Params(_)));
            Ok(())
        });
    }

    #[test]
    fn test_balance_mode_defaults_to_normal() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "waggle.yaml",
                &CONFIG.replace("  balance_mode: best_fit_hybrid\n", ""),
            )?;
            let config = RootConfig::load_from_path("waggle.yaml").unwrap();
            assert_eq!(config.task.balance_mode, BalanceMode::Normal);
            Ok(())
        });
    }
}
