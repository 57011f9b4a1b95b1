//! Configuration for the parley binary.
//!
//! Settings come from an optional YAML file, then environment variables,
//! then command line flags (applied by `main`). Durations are written the
//! humantime way, e.g. `5s` or `250ms`.

use anyhow::{bail, Context, Result};
use parley_naming::Name;
use parley_session::{Endpoint, MIN_SECRET_LEN};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// File read when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "parley.yaml";
/// Overlay node endpoint used by both roles
pub const DEFAULT_SERVER: &str = "http://localhost:46357";
/// Demo secret shared by the node and both roles
pub const DEFAULT_SECRET: &str = "demo-shared-secret-min-32-chars!!";

/// Environment variable overriding `server`
pub const ENV_SERVER: &str = "PARLEY_SERVER";
/// Environment variable overriding `shared_secret`
pub const ENV_SHARED_SECRET: &str = "PARLEY_SHARED_SECRET";
/// Environment variable overriding `node.listen`
pub const ENV_LISTEN: &str = "PARLEY_LISTEN";

/// Complete run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParleyConfig {
    /// Overlay node endpoint
    pub server: String,
    /// Secret clients prove to the node; also seeds session keys
    pub shared_secret: String,
    /// Overlay node settings
    pub node: NodeSection,
    /// Initiator settings
    pub initiator: InitiatorSection,
    /// Responder settings
    pub responder: ResponderSection,
}

/// `node:` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeSection {
    /// Listen address
    pub listen: String,
    /// Connection dropped after this long without traffic
    #[serde(with = "duration_str")]
    pub idle_timeout: Duration,
}

/// `initiator:` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InitiatorSection {
    /// Local identity
    pub identity: String,
    /// Identity sessions are opened to
    pub remote: String,
    /// Requests per run
    pub iterations: u32,
    /// Smallest random number sent
    pub min: i64,
    /// Largest random number sent
    pub max: i64,
    /// Seal payloads end to end
    pub encryption: bool,
    /// Bound on each reply wait
    #[serde(with = "duration_str")]
    pub reply_timeout: Duration,
    /// Pause between requests
    #[serde(with = "duration_str")]
    pub pacing: Duration,
    /// Pause between session creation and the first request
    #[serde(with = "duration_str")]
    pub settle_delay: Duration,
}

/// `responder:` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResponderSection {
    /// Local identity
    pub identity: String,
    /// Shown in the banner; the initiator picks each session's mode
    pub encryption: bool,
    /// Session closed after this long without a request
    #[serde(with = "duration_str")]
    pub liveness: Duration,
    /// Bound on each listen attempt
    #[serde(with = "duration_str")]
    pub listen_timeout: Duration,
    /// Pause after a failed listen
    #[serde(with = "duration_str")]
    pub listen_retry_delay: Duration,
}

impl Default for ParleyConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            shared_secret: DEFAULT_SECRET.to_string(),
            node: NodeSection::default(),
            initiator: InitiatorSection::default(),
            responder: ResponderSection::default(),
        }
    }
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            listen: parley_overlay::DEFAULT_LISTEN.to_string(),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for InitiatorSection {
    fn default() -> Self {
        Self {
            identity: "org/bob/v1".to_string(),
            remote: "org/alice/v1".to_string(),
            iterations: 10,
            min: 1,
            max: 100,
            encryption: true,
            reply_timeout: Duration::from_secs(5),
            pacing: Duration::from_secs(1),
            settle_delay: Duration::from_millis(100),
        }
    }
}

impl Default for ResponderSection {
    fn default() -> Self {
        Self {
            identity: "org/alice/v1".to_string(),
            encryption: false,
            liveness: Duration::from_secs(60),
            listen_timeout: Duration::from_secs(60),
            listen_retry_delay: Duration::from_secs(1),
        }
    }
}

impl ParleyConfig {
    /// Load `path`, or [`DEFAULT_CONFIG_FILE`] when it exists, then apply
    /// environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => {
                debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
                Self::default()
            }
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a YAML file; absent keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply `PARLEY_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(server) = lookup(ENV_SERVER) {
            info!("Server overridden by environment: {}", server);
            self.server = server;
        }
        if let Some(secret) = lookup(ENV_SHARED_SECRET) {
            info!("Shared secret overridden by environment");
            self.shared_secret = secret;
        }
        if let Some(listen) = lookup(ENV_LISTEN) {
            info!("Listen address overridden by environment: {}", listen);
            self.node.listen = listen;
        }
    }

    /// Check everything every role needs
    pub fn validate(&self) -> Result<()> {
        if self.shared_secret.chars().count() < MIN_SECRET_LEN {
            bail!(
                "shared secret must be at least {} characters",
                MIN_SECRET_LEN
            );
        }
        Endpoint::parse(&self.server).context("invalid server endpoint")?;
        self.listen_addr()?;

        Name::parse(&self.initiator.identity).context("invalid initiator identity")?;
        Name::parse(&self.initiator.remote).context("invalid initiator remote")?;
        Name::parse(&self.responder.identity).context("invalid responder identity")?;

        if self.initiator.min > self.initiator.max {
            bail!(
                "min ({}) must not exceed max ({})",
                self.initiator.min,
                self.initiator.max
            );
        }
        Ok(())
    }

    /// Parsed node listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.node
            .listen
            .parse()
            .with_context(|| format!("invalid listen address {}", self.node.listen))
    }
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
