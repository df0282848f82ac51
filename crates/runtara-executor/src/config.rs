// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for runtara-executor.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::storage::StorageConfig;

/// Default capacity of the runtime registry.
pub const DEFAULT_REGISTRY_CAPACITY: usize = 4096;

/// Process mode. Development exposes error locations in HTTP error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Error responses carry file, line and trace.
    Development,
    /// Error responses carry code and message only.
    #[default]
    Production,
}

impl Mode {
    /// Parse a mode name; anything other than `development` is production.
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("development") {
            Mode::Development
        } else {
            Mode::Production
        }
    }

    /// Whether this is development mode.
    pub fn is_development(self) -> bool {
        self == Mode::Development
    }
}

/// Container registry credentials.
#[derive(Debug, Clone, Default)]
pub struct RegistryCredentials {
    /// Registry user name.
    pub username: String,
    /// Registry password.
    pub password: String,
}

impl RegistryCredentials {
    /// True if both user name and password are set.
    pub fn is_configured(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

/// Executor configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Shared bearer secret checked on every request
    pub secret: String,
    /// Development or production
    pub mode: Mode,
    /// Version string echoed in error bodies
    pub version: String,
    /// HTTP listen address
    pub bind_addr: SocketAddr,
    /// Stable identifier of this host, used to name and label runtimes
    pub hostname: String,
    /// Image label of the executor's own container (for network attachment)
    pub executor_image: String,
    /// Networks runtimes are attached to
    pub networks: Vec<String>,
    /// Runtime images pulled at start-up
    pub warmup_images: Vec<String>,
    /// Interval between maintenance cycles
    pub maintenance_interval: Duration,
    /// Idle time after which a runtime is evicted
    pub inactive_threshold: Duration,
    /// Maximum number of tracked runtimes
    pub registry_capacity: usize,
    /// Root of the per-runtime scratch directories
    pub scratch_root: PathBuf,
    /// Port the runtime's HTTP listener binds inside the container
    pub runtime_port: u16,
    /// Container registry credentials
    pub registry_credentials: RegistryCredentials,
    /// Storage backend selection
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let secret = std::env::var("OPR_EXECUTOR_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingEnvVar("OPR_EXECUTOR_SECRET"))?;

        let port: u16 = std::env::var("OPR_EXECUTOR_PORT")
            .unwrap_or_else(|_| "80".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let runtime_port: u16 = std::env::var("OPR_EXECUTOR_RUNTIME_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let hostname = match std::env::var("OPR_EXECUTOR_HOSTNAME") {
            Ok(name) if !name.is_empty() => name,
            _ => nix::unistd::gethostname()
                .map_err(|e| ConfigError::Hostname(e.to_string()))?
                .to_string_lossy()
                .into_owned(),
        };

        let networks = parse_list(
            &std::env::var("OPR_EXECUTOR_NETWORK")
                .unwrap_or_else(|_| "executor_runtimes".to_string()),
        );
        if networks.is_empty() {
            return Err(ConfigError::NoNetworks);
        }

        // Older deployments spell the variable without the second "H"
        let inactive_threshold = std::env::var("OPR_EXECUTOR_INACTIVE_THRESHOLD")
            .or_else(|_| std::env::var("OPR_EXECUTOR_INACTIVE_TRESHOLD"))
            .ok();

        let config = Self {
            secret,
            mode: Mode::parse(&std::env::var("OPR_EXECUTOR_ENV").unwrap_or_default()),
            version: std::env::var("OPR_EXECUTOR_VERSION")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "UNKNOWN".to_string()),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            hostname,
            executor_image: std::env::var("OPR_EXECUTOR_IMAGE").unwrap_or_default(),
            networks,
            warmup_images: parse_list(&std::env::var("OPR_EXECUTOR_RUNTIMES").unwrap_or_default()),
            maintenance_interval: Duration::from_secs(parse_secs(
                "OPR_EXECUTOR_MAINTENANCE_INTERVAL",
                std::env::var("OPR_EXECUTOR_MAINTENANCE_INTERVAL").ok(),
                3600,
            )?),
            inactive_threshold: Duration::from_secs(parse_secs(
                "OPR_EXECUTOR_INACTIVE_THRESHOLD",
                inactive_threshold,
                60,
            )?),
            registry_capacity: std::env::var("OPR_EXECUTOR_MAX_RUNTIMES")
                .ok()
                .map(|v| {
                    v.parse()
                        .map_err(|_| ConfigError::InvalidNumber("OPR_EXECUTOR_MAX_RUNTIMES"))
                })
                .transpose()?
                .unwrap_or(DEFAULT_REGISTRY_CAPACITY),
            scratch_root: PathBuf::from(
                std::env::var("OPR_EXECUTOR_TMP_DIR").unwrap_or_else(|_| "/tmp".to_string()),
            ),
            runtime_port,
            registry_credentials: RegistryCredentials {
                username: std::env::var("OPR_EXECUTOR_DOCKER_HUB_USERNAME").unwrap_or_default(),
                password: std::env::var("OPR_EXECUTOR_DOCKER_HUB_PASSWORD").unwrap_or_default(),
            },
            storage: StorageConfig::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that would otherwise surface per request.
    ///
    /// The registry capacity is a hard ceiling on tracked runtimes; a zero
    /// capacity would fail every build.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry_capacity == 0 {
            return Err(ConfigError::InvalidCapacity);
        }
        if self.networks.is_empty() {
            return Err(ConfigError::NoNetworks);
        }
        Ok(())
    }

    /// Configuration for tests and embedding: no environment access.
    pub fn new(secret: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            mode: Mode::Production,
            version: "UNKNOWN".to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            hostname: hostname.into(),
            executor_image: String::new(),
            networks: vec!["executor_runtimes".to_string()],
            warmup_images: Vec::new(),
            maintenance_interval: Duration::from_secs(3600),
            inactive_threshold: Duration::from_secs(60),
            registry_capacity: DEFAULT_REGISTRY_CAPACITY,
            scratch_root: PathBuf::from("/tmp"),
            runtime_port: 3000,
            registry_credentials: RegistryCredentials::default(),
            storage: StorageConfig::Local,
        }
    }

    /// Registry identifier of a runtime: `{hostname}-{runtime_id}`.
    pub fn runtime_name(&self, runtime_id: &str) -> String {
        format!("{}-{}", self.hostname, runtime_id)
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_secs(
    var: &'static str,
    value: Option<String>,
    default: u64,
) -> Result<u64, ConfigError> {
    match value {
        Some(v) => v.trim().parse().map_err(|_| ConfigError::InvalidNumber(var)),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// A numeric variable could not be parsed.
    #[error("Invalid number in environment variable: {0}")]
    InvalidNumber(&'static str),
    /// The network list is empty.
    #[error("OPR_EXECUTOR_NETWORK must name at least one network")]
    NoNetworks,
    /// The registry capacity is zero.
    #[error("OPR_EXECUTOR_MAX_RUNTIMES must be at least 1")]
    InvalidCapacity,
    /// The system hostname could not be read.
    #[error("Failed to read hostname: {0}")]
    Hostname(String),
}
