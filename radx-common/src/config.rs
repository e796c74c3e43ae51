//! # Cluster Configuration
//!
//! Purpose: Describe how to reach and authenticate against a cluster, and the
//! timeout/retry budgets every Connection derives its behavior from.
//!
//! ## Sources
//! - `ClusterConfig::default()` plus field assignment.
//! - `ClusterConfig::from_file` for TOML (`.toml`) or JSON (`.json`) files.
//! - `ClusterConfig::set` for string options, matching the names accepted in files.
//!
//! A Connection owns its config. It can still be adjusted while the connection
//! is Unconnected and is frozen from `connect` onwards.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RadxError, RadxResult};
use crate::types::DEFAULT_MAX_OBJECT_NAME_LEN;

/// Environment variable consulted when no keyring path is configured.
pub const KEYRING_ENV: &str = "RADX_KEYRING";

/// Connection configuration for a single cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    /// Cluster identity; must match the name the cluster reports.
    pub cluster_name: String,
    /// User id without the `client.` prefix.
    pub user_id: String,
    /// Monitor endpoints, e.g. "10.0.0.1:6789".
    #[serde(alias = "mon_host")]
    pub mon_hosts: Vec<String>,
    /// Overall budget for `connect`, including retries.
    pub connect_timeout_ms: u64,
    /// Keyring file holding the user's secret.
    pub keyring: Option<PathBuf>,
    /// Default per-operation deadline.
    pub op_timeout_ms: u64,
    /// Longest accepted object key in bytes.
    pub max_object_name_len: usize,
    /// Connect attempts before giving up on transient failures.
    pub connect_attempts: u32,
    /// Attempts per retryable operation.
    pub op_attempts: u32,
    /// First backoff wait between attempts.
    pub backoff_initial_ms: u64,
    /// Backoff cap.
    pub backoff_max_ms: u64,
    /// Operations the dispatcher runs concurrently; the rest wait in its queue.
    pub max_inflight_ops: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            cluster_name: "radx".to_string(),
            user_id: "admin".to_string(),
            mon_hosts: Vec::new(),
            connect_timeout_ms: 5_000,
            keyring: None,
            op_timeout_ms: 30_000,
            max_object_name_len: DEFAULT_MAX_OBJECT_NAME_LEN,
            connect_attempts: 3,
            op_attempts: 5,
            backoff_initial_ms: 10,
            backoff_max_ms: 1_000,
            max_inflight_ops: 1024,
        }
    }
}

impl ClusterConfig {
    /// Loads a config file; `.json` files are parsed as JSON, anything else as TOML.
    pub fn from_file(path: impl AsRef<Path>) -> RadxResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            RadxError::validation(format!("cannot read config {}: {}", path.display(), err))
        })?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let parsed = if is_json {
            serde_json::from_str(&raw).map_err(|err| err.to_string())
        } else {
            toml::from_str(&raw).map_err(|err| err.to_string())
        };
        parsed.map_err(|err| {
            RadxError::validation(format!("invalid config {}: {}", path.display(), err))
        })
    }

    /// Sets a single option by name.
    ///
    /// `mon_host` accepts a comma or whitespace separated list.
    pub fn set(&mut self, option: &str, value: &str) -> RadxResult<()> {
        let value = value.trim();
        match option {
            "cluster_name" => self.cluster_name = value.to_string(),
            "user_id" => self.user_id = value.to_string(),
            "mon_host" | "mon_hosts" => {
                self.mon_hosts = value
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|host| !host.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "keyring" => {
                self.keyring = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }
            "connect_timeout_ms" => self.connect_timeout_ms = parse_option(option, value)?,
            "op_timeout_ms" => self.op_timeout_ms = parse_option(option, value)?,
            "max_object_name_len" => self.max_object_name_len = parse_option(option, value)?,
            "connect_attempts" => self.connect_attempts = parse_option(option, value)?,
            "op_attempts" => self.op_attempts = parse_option(option, value)?,
            "backoff_initial_ms" => self.backoff_initial_ms = parse_option(option, value)?,
            "backoff_max_ms" => self.backoff_max_ms = parse_option(option, value)?,
            "max_inflight_ops" => self.max_inflight_ops = parse_option(option, value)?,
            _ => {
                return Err(RadxError::validation(format!(
                    "unknown config option '{}'",
                    option
                )))
            }
        }
        Ok(())
    }

    /// Checks the config is usable for a connect attempt.
    pub fn validate(&self) -> RadxResult<()> {
        if self.cluster_name.is_empty() {
            return Err(RadxError::validation("cluster_name must not be empty"));
        }
        if self.user_id.is_empty() {
            return Err(RadxError::validation("user_id must not be empty"));
        }
        if self.mon_hosts.is_empty() || self.mon_hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(RadxError::validation("at least one monitor host is required"));
        }
        if self.connect_timeout_ms == 0 || self.op_timeout_ms == 0 {
            return Err(RadxError::validation("timeouts must be greater than zero"));
        }
        if self.connect_attempts == 0 || self.op_attempts == 0 {
            return Err(RadxError::validation("attempt counts must be at least 1"));
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(RadxError::validation(
                "backoff_initial_ms must not exceed backoff_max_ms",
            ));
        }
        if self.max_inflight_ops == 0 {
            return Err(RadxError::validation("max_inflight_ops must be at least 1"));
        }
        if self.max_object_name_len == 0 {
            return Err(RadxError::validation("max_object_name_len must be positive"));
        }
        Ok(())
    }

    /// Entity name used for authentication, e.g. "client.admin".
    pub fn entity(&self) -> String {
        format!("client.{}", self.user_id)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Resolves the credentials for `user_id`.
    ///
    /// Uses the configured keyring, then `RADX_KEYRING`. With neither set the
    /// credentials carry no secret, which only auth-disabled clusters accept.
    pub fn resolve_credentials(&self) -> RadxResult<Credentials> {
        let from_env = env::var_os(KEYRING_ENV).map(PathBuf::from);
        self.resolve_credentials_with(from_env)
    }

    fn resolve_credentials_with(&self, env_keyring: Option<PathBuf>) -> RadxResult<Credentials> {
        let entity = self.entity();
        let path = match self.keyring.clone().or(env_keyring) {
            Some(path) => path,
            None => {
                tracing::debug!(entity = %entity, "no keyring configured, connecting without a secret");
                return Ok(Credentials {
                    entity,
                    secret: None,
                });
            }
        };

        let raw = fs::read_to_string(&path).map_err(|err| {
            RadxError::Connection(format!("cannot read keyring {}: {}", path.display(), err))
        })?;
        let secret = parse_keyring(&raw, &entity).ok_or_else(|| {
            RadxError::Connection(format!("no key for {} in {}", entity, path.display()))
        })?;

        Ok(Credentials {
            entity,
            secret: Some(secret),
        })
    }
}

/// Authentication material presented at connect time.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub entity: String,
    pub secret: Option<String>,
}

// Never print the secret.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("entity", &self.entity)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Extracts `key = ...` from the `[entity]` section of a keyring file.
fn parse_keyring(raw: &str, entity: &str) -> Option<String> {
    let mut in_section = false;
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_section = section.trim() == entity;
            continue;
        }
        if !in_section {
            continue;
        }
        if let Some((name, value)) = line.split_once('=') {
            if name.trim() == "key" {
                let value = value.trim();
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

fn parse_option<T: std::str::FromStr>(option: &str, value: &str) -> RadxResult<T> {
    value.parse().map_err(|_| {
        RadxError::validation(format!("invalid value '{}' for option '{}'", value, option))
    })
}
