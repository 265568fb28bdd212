//! Session configuration.
//!
//! A [`SessionConfig`] is built in code with the `with_*` builders or loaded
//! from a TOML file:
//!
//! ```toml
//! host = "hv-node-01"
//! namespace = 'root\virtualization\v2'
//! call_timeout_ms = 30000
//! job_timeout_secs = 300
//!
//! [credentials]
//! domain = "CORP"
//! username = "svc-hyperv"
//! password = "..."
//!
//! [poll]
//! initial_interval_ms = 100
//! max_interval_ms = 2000
//! multiplier = 2
//! max_transport_retries = 3
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::error::{Error, Result};

/// Hyper-V WMI namespace.
pub const HYPERV_NAMESPACE: &str = r"root\virtualization\v2";

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default job timeout.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300); // 5 minutes

/// Default first polling interval for job status.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default ceiling for the polling interval.
pub const DEFAULT_MAX_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Credentials for a remote WMI connection.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    /// Domain (optional).
    #[serde(default)]
    pub domain: Option<String>,
    /// Username.
    pub username: String,
    password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            domain: None,
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn with_domain(
        domain: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            domain: Some(domain.into()),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Full username (`domain\user` or just `user`).
    pub fn full_username(&self) -> String {
        match self.domain {
            Some(ref domain) => format!("{}\\{}", domain, self.username),
            None => self.username.clone(),
        }
    }

    #[cfg_attr(not(windows), allow(dead_code))]
    pub(crate) fn password_str(&self) -> &str {
        &self.password
    }
}

/// Job polling cadence.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PollPolicy {
    /// Delay before the second poll; the first poll is immediate.
    #[serde(
        default = "default_poll_interval",
        rename = "initial_interval_ms",
        deserialize_with = "millis"
    )]
    pub initial_interval: Duration,

    /// Growth factor applied after every pending poll.
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,

    /// Ceiling for the polling interval.
    #[serde(
        default = "default_max_poll_interval",
        rename = "max_interval_ms",
        deserialize_with = "millis"
    )]
    pub max_interval: Duration,

    /// Consecutive transport failures tolerated while polling one job.
    #[serde(default = "default_transport_retries")]
    pub max_transport_retries: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: default_poll_interval(),
            multiplier: default_multiplier(),
            max_interval: default_max_poll_interval(),
            max_transport_retries: default_transport_retries(),
        }
    }
}

impl PollPolicy {
    /// Fixed interval with no growth.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_interval: interval,
            multiplier: 1,
            max_interval: interval,
            ..Default::default()
        }
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_transport_retries(mut self, retries: u32) -> Self {
        self.max_transport_retries = retries;
        self
    }

    /// Interval that follows `current`, capped at the ceiling.
    pub(crate) fn next_interval(&self, current: Duration) -> Duration {
        current
            .checked_mul(self.multiplier)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }

    fn validate(&self) -> Result<()> {
        if self.initial_interval.is_zero() {
            return Err(Error::validation(
                "poll.initial_interval",
                "must be greater than zero",
            ));
        }
        if self.max_interval < self.initial_interval {
            return Err(Error::validation(
                "poll.max_interval",
                "must not be smaller than the initial interval",
            ));
        }
        if self.multiplier == 0 {
            return Err(Error::validation("poll.multiplier", "must be at least 1"));
        }
        Ok(())
    }
}

/// Connection and job settings for a [`Session`](crate::Session).
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Target host (`None` for the local machine).
    #[serde(default)]
    pub host: Option<String>,

    /// Credentials for a remote connection.
    #[serde(default)]
    pub credentials: Option<Credentials>,

    /// WMI namespace.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Timeout applied to every transport call.
    #[serde(
        default = "default_call_timeout",
        rename = "call_timeout_ms",
        deserialize_with = "millis"
    )]
    pub call_timeout: Duration,

    /// Upper bound for waiting on a single job (and on state settling).
    #[serde(
        default = "default_job_timeout",
        rename = "job_timeout_secs",
        deserialize_with = "secs"
    )]
    pub job_timeout: Duration,

    #[serde(default)]
    pub poll: PollPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: None,
            credentials: None,
            namespace: default_namespace(),
            call_timeout: default_call_timeout(),
            job_timeout: default_job_timeout(),
            poll: PollPolicy::default(),
        }
    }
}

impl SessionConfig {
    /// Local connection config.
    pub fn local() -> Self {
        Self::default()
    }

    /// Remote connection config.
    pub fn remote(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Full namespace path (e.g. `\\server\root\virtualization\v2`).
    pub fn namespace_path(&self) -> String {
        match self.host {
            Some(ref host) => format!(r"\\{}\{}", host, self.namespace),
            None => self.namespace.clone(),
        }
    }

    /// Host name for logging.
    pub fn host_label(&self) -> &str {
        self.host.as_deref().unwrap_or("localhost")
    }

    /// Load configuration from a TOML file.
    ///
    /// If the file doesn't exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> core::result::Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.display().to_string(), e.to_string()))?;

        Self::from_toml(&content)
            .map_err(|e| ConfigError::ParseError(path.display().to_string(), e.to_string()))
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> core::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(Error::validation("namespace", "cannot be empty"));
        }
        if self.call_timeout.is_zero() {
            return Err(Error::validation("call_timeout", "must be greater than zero"));
        }
        if self.job_timeout.is_zero() {
            return Err(Error::validation("job_timeout", "must be greater than zero"));
        }
        if let Some(ref host) = self.host {
            if host.trim().is_empty() {
                return Err(Error::validation("host", "cannot be empty when set"));
            }
        }
        self.poll.validate()
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{0}': {1}")]
    ReadError(String, String),
    #[error("Failed to parse config file '{0}': {1}")]
    ParseError(String, String),
}

fn default_namespace() -> String {
    HYPERV_NAMESPACE.to_string()
}

fn default_call_timeout() -> Duration {
    DEFAULT_CALL_TIMEOUT
}

fn default_job_timeout() -> Duration {
    DEFAULT_JOB_TIMEOUT
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_max_poll_interval() -> Duration {
    DEFAULT_MAX_POLL_INTERVAL
}

fn default_multiplier() -> u32 {
    2
}

fn default_transport_retries() -> u32 {
    3
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn secs<'de, D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}
