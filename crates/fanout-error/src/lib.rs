// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy for the task-dispatch core.
//!
//! Every error carries an [`ErrorCode`] (a stable, machine-readable tag), a
//! human-readable message, and arbitrary key-value context. Construct one
//! with [`DispatchError::new`] and attach context fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Broad family an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Credential / startup configuration problems.
    Config,
    /// Request signing failures.
    Signing,
    /// Serialization / deserialization failures.
    Wire,
    /// Remote invocation failures (non-200 responses, transport errors).
    Remote,
    /// Local subprocess invocation failures.
    Local,
    /// Dataflow graph construction or execution failures.
    Graph,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Signing => "signing",
            Self::Wire => "wire",
            Self::Remote => "remote",
            Self::Local => "local",
            Self::Graph => "graph",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Machine-readable, stable error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// One or more required credential environment variables are absent.
    MissingCredentials,
    /// The resource configuration on a task descriptor is invalid.
    InvalidResourceConfig,
    /// Canonical request construction failed (malformed URI, headers).
    SigningInputInvalid,
    /// A value could not be encoded into the wire format.
    SerializeFailed,
    /// Wire bytes could not be decoded into the expected type.
    DeserializeFailed,
    /// The remote backend responded with a non-200 status.
    RemoteRejected,
    /// The HTTP/2 session itself failed (connect, TLS, transport).
    TransportFailed,
    /// A local subprocess exited with a non-zero status.
    LocalExecFailed,
    /// The local dispatcher's entry-point metadata file is missing or
    /// malformed, or an identifier is absent from it.
    LocalMetaInvalid,
    /// A dataflow graph could not make progress (likely a cycle).
    GraphCycle,
    /// A graph node was executed with an input slot left unfilled.
    UnfilledSlot,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MissingCredentials | Self::InvalidResourceConfig => ErrorCategory::Config,
            Self::SigningInputInvalid => ErrorCategory::Signing,
            Self::SerializeFailed | Self::DeserializeFailed => ErrorCategory::Wire,
            Self::RemoteRejected | Self::TransportFailed => ErrorCategory::Remote,
            Self::LocalExecFailed | Self::LocalMetaInvalid => ErrorCategory::Local,
            Self::GraphCycle | Self::UnfilledSlot => ErrorCategory::Graph,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation (e.g. `"MISSING_CREDENTIALS"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "MISSING_CREDENTIALS",
            Self::InvalidResourceConfig => "INVALID_RESOURCE_CONFIG",
            Self::SigningInputInvalid => "SIGNING_INPUT_INVALID",
            Self::SerializeFailed => "SERIALIZE_FAILED",
            Self::DeserializeFailed => "DESERIALIZE_FAILED",
            Self::RemoteRejected => "REMOTE_REJECTED",
            Self::TransportFailed => "TRANSPORT_FAILED",
            Self::LocalExecFailed => "LOCAL_EXEC_FAILED",
            Self::LocalMetaInvalid => "LOCAL_META_INVALID",
            Self::GraphCycle => "GRAPH_CYCLE",
            Self::UnfilledSlot => "UNFILLED_SLOT",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified dispatch error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and structured context.
pub struct DispatchError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl DispatchError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Build a [`ErrorCode::RemoteRejected`] error from a status and body,
    /// the fix for the remote-rejection-leaves-future-uncompleted gap.
    pub fn remote_rejected(status: u16, body: impl Into<String>) -> Self {
        Self::new(ErrorCode::RemoteRejected, "remote invocation rejected")
            .with_context("status", status)
            .with_context("body", body.into())
    }
}

impl fmt::Debug for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("DispatchError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, DispatchError>;
