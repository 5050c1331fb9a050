//! Session and runtime configuration
//!
//! `SessionConfig` is what the session consumes. `RuntimeConfig` adds logging
//! and can be loaded from JSON or from `SHUTTERSYNC_*` environment variables.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use shutter_core::{PeerIdentity, ServiceNamespace, ShutterError};

/// Default connection-invitation timeout
pub const DEFAULT_INVITE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default capacity of the session event stream
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid namespace: {0}")]
    Namespace(#[source] ShutterError),

    #[error("invalid duration for {key}: {value:?}")]
    Duration {
        key: &'static str,
        value: String,
        #[source]
        source: humantime::DurationError,
    },

    #[error("invalid number for {key}: {value:?}")]
    Number { key: &'static str, value: String },

    #[error("invalid log format: {0:?}")]
    LogFormat(String),

    #[error("invalid log filter: {0}")]
    LogFilter(String),

    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Which peers the session connects with
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Accept every invitation and invite every discovered peer
    #[default]
    AcceptAll,
    /// Only peers whose display name is listed
    AllowList { names: BTreeSet<String> },
}

impl AdmissionPolicy {
    pub fn allow_list<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AdmissionPolicy::AllowList {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn permits(&self, peer: &PeerIdentity) -> bool {
        match self {
            AdmissionPolicy::AcceptAll => true,
            AdmissionPolicy::AllowList { names } => names.contains(peer.display_name()),
        }
    }
}

/// PeerBroadcastSession configuration
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Discovery namespace
    pub namespace: ServiceNamespace,
    /// How long an outgoing invitation stays open
    pub invite_timeout: Duration,
    pub admission: AdmissionPolicy,
    /// Cap on connecting + connected peers, `None` for unbounded
    pub max_peers: Option<usize>,
    /// Capacity of the event stream before slow subscribers lag
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            namespace: ServiceNamespace::default(),
            invite_timeout: DEFAULT_INVITE_TIMEOUT,
            admission: AdmissionPolicy::AcceptAll,
            max_peers: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// Log output format
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(ConfigError::LogFormat(s.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, overridden by `RUST_LOG` when set
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Session plus logging configuration
#[derive(Clone, Debug, Default)]
pub struct RuntimeConfig {
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

/// Serialized shape of `RuntimeConfig`
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RuntimeConfigFile {
    namespace: Option<String>,
    invite_timeout: Option<String>,
    admission: AdmissionPolicy,
    max_peers: Option<usize>,
    event_buffer: Option<usize>,
    logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Parse from JSON. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let file: RuntimeConfigFile = serde_json::from_str(json)?;
        let mut config = RuntimeConfig::default();

        if let Some(namespace) = file.namespace {
            config.session.namespace =
                ServiceNamespace::new(namespace).map_err(ConfigError::Namespace)?;
        }
        if let Some(timeout) = file.invite_timeout {
            config.session.invite_timeout = parse_duration("invite_timeout", &timeout)?;
        }
        config.session.admission = file.admission;
        config.session.max_peers = file.max_peers;
        if let Some(buffer) = file.event_buffer {
            config.session.event_buffer = buffer.max(1);
        }
        config.logging = file.logging;
        Ok(config)
    }

    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup, using the `SHUTTERSYNC_*` keys
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = RuntimeConfig::default();

        if let Some(namespace) = lookup("SHUTTERSYNC_NAMESPACE") {
            config.session.namespace =
                ServiceNamespace::new(namespace.trim()).map_err(ConfigError::Namespace)?;
        }
        if let Some(timeout) = lookup("SHUTTERSYNC_INVITE_TIMEOUT") {
            config.session.invite_timeout =
                parse_duration("SHUTTERSYNC_INVITE_TIMEOUT", &timeout)?;
        }
        if let Some(max) = lookup("SHUTTERSYNC_MAX_PEERS") {
            let parsed = max.trim().parse().map_err(|_| ConfigError::Number {
                key: "SHUTTERSYNC_MAX_PEERS",
                value: max.clone(),
            })?;
            config.session.max_peers = Some(parsed);
        }
        if let Some(allow) = lookup("SHUTTERSYNC_ALLOW") {
            let names: Vec<&str> = allow
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .collect();
            if !names.is_empty() {
                config.session.admission = AdmissionPolicy::allow_list(names);
            }
        }
        if let Some(filter) = lookup("SHUTTERSYNC_LOG") {
            config.logging.filter = filter;
        }
        if let Some(format) = lookup("SHUTTERSYNC_LOG_FORMAT") {
            config.logging.format = format.parse()?;
        }
        Ok(config)
    }
}

fn parse_duration(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim()).map_err(|source| ConfigError::Duration {
        key,
        value: value.to_string(),
        source,
    })
}
