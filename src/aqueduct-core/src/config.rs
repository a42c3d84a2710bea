use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::Error;

/// Default server endpoint.
pub const DEFAULT_URL: &str = "http://127.0.0.1:8529";

/// Default database name.
pub const DEFAULT_DATABASE: &str = "_system";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Base URLs of every known server, in preference order
    #[serde(default = "default_urls")]
    pub url: Vec<String>,

    #[serde(default = "default_database")]
    pub database_name: String,

    #[serde(default)]
    pub load_balancing_strategy: LoadBalancingStrategy,

    /// Total attempts per request on network failure. `None` tries each known host once.
    #[serde(default)]
    pub max_retries: Option<usize>,

    /// Maximum number of requests in flight at once
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Capacity of the server queue-time sample buffer
    #[serde(default = "default_queue_time_samples")]
    pub response_queue_time_samples: usize,

    /// Per-request timeout in milliseconds (none by default)
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Limit on connection setup in milliseconds, granted on top of `timeout_ms`
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default)]
    pub auth: Option<Auth>,

    /// Headers sent with every request
    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default)]
    pub ca_cert_path: String,
}

/// How requests are spread across known hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancingStrategy {
    /// Stay on the first host until failover moves on
    #[default]
    None,
    /// Pick one host at random on first use, then behave like `None`
    OneRandom,
    /// Move to the next host on every request
    RoundRobin,
}

/// Credential attached to every request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Auth {
    Basic { username: String, password: String },
    Bearer { token: String },
}

fn default_urls() -> Vec<String> {
    vec![DEFAULT_URL.to_string()]
}

fn default_database() -> String {
    DEFAULT_DATABASE.to_string()
}

fn default_pool_size() -> usize {
    3
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_queue_time_samples() -> usize {
    10
}

impl Config {
    /// Create a configuration for a single server.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: vec![url.into()],
            ..Self::default()
        }
    }

    pub fn load(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path))?;
        let config: Config = serde_json::from_str(&contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.url = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_database(mut self, name: impl Into<String>) -> Self {
        self.database_name = name.into();
        self
    }

    pub fn with_load_balancing(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.load_balancing_strategy = strategy;
        self
    }

    pub fn with_max_retries(mut self, attempts: usize) -> Self {
        self.max_retries = Some(attempts);
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn with_queue_time_samples(mut self, samples: usize) -> Self {
        self.response_queue_time_samples = samples;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(Auth::Basic {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_bearer_auth(mut self, token: impl Into<String>) -> Self {
        self.auth = Some(Auth::Bearer {
            token: token.into(),
        });
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.url.is_empty() {
            return Err(Error::Config("at least one server url is required".to_string()));
        }
        if self.pool_size == 0 {
            return Err(Error::Config("pool_size must be at least 1".to_string()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(Error::Config("connect_timeout_ms must be at least 1".to_string()));
        }
        if self.database_name.is_empty() {
            return Err(Error::Config("database_name must not be empty".to_string()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: default_urls(),
            database_name: default_database(),
            load_balancing_strategy: LoadBalancingStrategy::default(),
            max_retries: None,
            pool_size: default_pool_size(),
            response_queue_time_samples: default_queue_time_samples(),
            timeout_ms: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            auth: None,
            headers: HashMap::new(),
            insecure_skip_verify: false,
            ca_cert_path: String::new(),
        }
    }
}
