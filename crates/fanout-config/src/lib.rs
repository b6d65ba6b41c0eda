// SPDX-License-Identifier: MIT OR Apache-2.0
//! Credential and runtime configuration loading.
//!
//! The signer (`fanout-sigv4`) and the remote dispatcher (`fanout-remote`)
//! need three environment variables — `AWS_REGION`, `AWS_ACCESS_KEY_ID`,
//! `AWS_SECRET_ACCESS_KEY` — plus a handful of operational knobs a real
//! deployment needs that the core specification leaves implicit.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use fanout_error::{DispatchError, ErrorCode};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::env::VarError;
use std::time::Duration;
use thiserror::Error;

/// Leaf error type for environment-variable loading, converted into
/// [`DispatchError`] at the crate boundary.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable was not set, or set to the empty string.
    #[error("{variable} is not set")]
    MissingVariable {
        /// The environment variable name.
        variable: String,
    },
    /// A required environment variable was set but is not valid Unicode.
    #[error("{variable} is not valid unicode")]
    InvalidUnicode {
        /// The environment variable name.
        variable: String,
    },
}

impl ConfigError {
    fn variable(&self) -> &str {
        match self {
            Self::MissingVariable { variable } | Self::InvalidUnicode { variable } => variable,
        }
    }
}

impl From<ConfigError> for DispatchError {
    fn from(err: ConfigError) -> Self {
        let variable = err.variable().to_string();
        DispatchError::new(ErrorCode::MissingCredentials, err.to_string())
            .with_context("variable", variable)
    }
}

/// Default build-time remote function name prefix.
pub const DEFAULT_FUNCTION_PREFIX: &str = "fanout-task";

/// Default local-dispatcher meta-file path, relative to the running
/// executable (mirrors `<executable>.json` from the original design).
pub const DEFAULT_LOCAL_META_SUFFIX: &str = ".json";

/// SigV4 credentials, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// AWS-style region, e.g. `"us-east-1"`.
    pub region: String,
    /// Access key id, used as the `Credential=` id in the Authorization header.
    pub access_key_id: String,
    /// Secret access key, the root of the derived signing key.
    pub secret_access_key: String,
}

impl Credentials {
    /// Load credentials from `AWS_REGION`, `AWS_ACCESS_KEY_ID`, and
    /// `AWS_SECRET_ACCESS_KEY`. Fails loudly (per spec §7) if any is absent.
    pub fn from_env() -> Result<Self, DispatchError> {
        let region = read_required("AWS_REGION")?;
        let access_key_id = read_required("AWS_ACCESS_KEY_ID")?;
        let secret_access_key = read_required("AWS_SECRET_ACCESS_KEY")?;
        Ok(Self {
            region,
            access_key_id,
            secret_access_key,
        })
    }
}

fn read_required(name: &str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        Ok(_) => Err(ConfigError::MissingVariable {
            variable: name.to_string(),
        }),
        Err(VarError::NotPresent) => Err(ConfigError::MissingVariable {
            variable: name.to_string(),
        }),
        Err(VarError::NotUnicode(_)) => Err(ConfigError::InvalidUnicode {
            variable: name.to_string(),
        }),
    }
}

/// Operational configuration for a dispatcher instance, independent of
/// credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RuntimeConfig {
    /// Prefix prepended to the SHA-256-derived remote function name suffix.
    pub function_prefix: String,
    /// Connect timeout for the HTTP/2 session.
    #[serde(with = "duration_millis")]
    #[schemars(with = "u64")]
    pub connect_timeout: Duration,
    /// Per-invocation request timeout.
    #[serde(with = "duration_millis")]
    #[schemars(with = "u64")]
    pub request_timeout: Duration,
    /// Override for the local dispatcher's entry-point metadata file path.
    /// When `None`, the local dispatcher derives `<executable>.json`.
    #[serde(default)]
    pub local_meta_path: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            function_prefix: DEFAULT_FUNCTION_PREFIX.to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(300),
            local_meta_path: None,
        }
    }
}

impl RuntimeConfig {
    /// Load overrides from `FANOUT_FUNCTION_PREFIX`, `FANOUT_LOCAL_META_PATH`,
    /// `FANOUT_CONNECT_TIMEOUT_MS`, and `FANOUT_REQUEST_TIMEOUT_MS`; any
    /// variable that is unset keeps the default.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(prefix) = std::env::var("FANOUT_FUNCTION_PREFIX") {
            if !prefix.is_empty() {
                cfg.function_prefix = prefix;
            }
        }
        if let Ok(path) = std::env::var("FANOUT_LOCAL_META_PATH") {
            if !path.is_empty() {
                cfg.local_meta_path = Some(path);
            }
        }
        if let Some(ms) = read_millis("FANOUT_CONNECT_TIMEOUT_MS") {
            cfg.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = read_millis("FANOUT_REQUEST_TIMEOUT_MS") {
            cfg.request_timeout = Duration::from_millis(ms);
        }
        cfg
    }
}

fn read_millis(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
