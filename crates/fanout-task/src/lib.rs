// SPDX-License-Identifier: MIT OR Apache-2.0
//! Task descriptors: the data a dispatcher needs to invoke one unit of
//! user work, without any compiler magic around closure capture.
//!
//! A task is a plain record implementing [`Task`], with a free-function
//! body in [`Task::call`]. The descriptor's [`identifier`](Task::identifier)
//! is derived from a source-location token plus the task and argument
//! type names — stable across runs of the same binary, distinct across
//! distinct callables or argument lists.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use fanout_error::{DispatchError, ErrorCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Resource configuration carried alongside a task descriptor: the
/// memory, ephemeral storage, and timeout requested for a remote
/// invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Memory allocated to the remote invocation, in megabytes.
    pub memory_mb: u32,
    /// Ephemeral (scratch) storage allocated to the invocation, in
    /// megabytes.
    pub ephemeral_storage_mb: u32,
    /// Invocation timeout, in seconds.
    pub timeout_s: u32,
    /// Optional human-readable description, surfaced in dashboards.
    pub description: String,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory_mb: 1024,
            ephemeral_storage_mb: 512,
            timeout_s: 300,
            description: String::new(),
        }
    }
}

impl ResourceConfig {
    /// Start building a [`ResourceConfig`] from the defaults.
    pub fn builder() -> ResourceConfigBuilder {
        ResourceConfigBuilder(Self::default())
    }

    /// Validate that every field is within a sane range.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.memory_mb == 0 || self.timeout_s == 0 {
            return Err(DispatchError::new(
                ErrorCode::InvalidResourceConfig,
                "memory_mb and timeout_s must be non-zero",
            )
            .with_context("memory_mb", self.memory_mb)
            .with_context("timeout_s", self.timeout_s));
        }
        Ok(())
    }
}

/// Fluent builder over [`ResourceConfig`], the supplemented equivalent of
/// `cppless::dispatcher::aws`'s `with_memory`/`with_timeout`/... template
/// modifiers — a runtime builder rather than a type-level mixin chain.
#[derive(Debug, Clone, Default)]
pub struct ResourceConfigBuilder(ResourceConfig);

impl ResourceConfigBuilder {
    /// Set the memory allocation, in megabytes.
    pub fn memory_mb(mut self, memory_mb: u32) -> Self {
        self.0.memory_mb = memory_mb;
        self
    }

    /// Set the ephemeral storage allocation, in megabytes.
    pub fn ephemeral_storage_mb(mut self, ephemeral_storage_mb: u32) -> Self {
        self.0.ephemeral_storage_mb = ephemeral_storage_mb;
        self
    }

    /// Set the invocation timeout, in seconds.
    pub fn timeout_s(mut self, timeout_s: u32) -> Self {
        self.0.timeout_s = timeout_s;
        self
    }

    /// Set the human-readable description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.0.description = description.into();
        self
    }

    /// Finish building.
    pub fn build(self) -> ResourceConfig {
        self.0
    }
}

/// A unit of user work that can be dispatched to a local or remote
/// backend.
///
/// Implementors are plain records, not captured closures: the compiler
/// gives us no reflection over a closure's environment, so the task's
/// state is exactly its fields, and the identifier is derived from the
/// struct's and its argument type's names rather than from introspecting
/// a captured lambda.
pub trait Task: Serialize + for<'de> Deserialize<'de> + Send + 'static {
    /// The task's positional argument tuple.
    type Args: Serialize + for<'de> Deserialize<'de> + Send + 'static;
    /// The task's return value.
    type Output: Serialize + for<'de> Deserialize<'de> + Send + 'static;

    /// A token identifying the source location this task is declared at.
    /// Combined with the type names, this must be stable across runs of
    /// the same binary and distinct across distinct callables. A
    /// reasonable default is the module path; override when two tasks
    /// share a module.
    const SOURCE_TOKEN: &'static str;

    /// The resource configuration this task requests. Defaults to
    /// [`ResourceConfig::default`].
    fn config() -> ResourceConfig {
        ResourceConfig::default()
    }

    /// Run the task body against the given arguments. This is what a
    /// local-subprocess entry point or an in-process test invokes;
    /// nothing in the core calls it directly over the wire.
    fn call(self, args: Self::Args) -> Self::Output;
}

/// The deterministic identifier for a task type: `<source-token>@<task
/// type name><args type name>`. Two descriptors built from the same
/// callable and argument types produce byte-identical identifiers.
pub fn identifier_of<T: Task>() -> String {
    format!(
        "{}@{}{}",
        T::SOURCE_TOKEN,
        std::any::type_name::<T>(),
        std::any::type_name::<T::Args>()
    )
}

/// The first 8 hex digits of SHA-256(identifier) — the remote function
/// name suffix.
pub fn identifier_digest(identifier: &str) -> String {
    let digest = Sha256::digest(identifier.as_bytes());
    hex::encode(digest)[..8].to_string()
}

/// The full remote function name: `<prefix>-<first-8-hex-of-sha256(identifier)>`.
pub fn remote_function_name(prefix: &str, identifier: &str) -> String {
    format!("{prefix}-{}", identifier_digest(identifier))
}

/// Everything a dispatcher needs to invoke one task: its identifier, its
/// resource configuration, and its pre-serialized captured state.
///
/// `capture_bytes` is computed once, at construction, from the task
/// value's fields — the same bytes are reused across every dispatch of
/// this descriptor (a task may be dispatched more than once, e.g. inside
/// a loop).
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    /// Stable identifier, unique per callable code location x argument
    /// type list.
    pub identifier: String,
    /// Resource configuration for a remote invocation.
    pub config: ResourceConfig,
    /// Serialized captured state (the task's own fields, without args).
    pub capture_bytes: Vec<u8>,
}

impl TaskDescriptor {
    /// Build a descriptor from a task value, using `encode` to serialize
    /// its captured state.
    pub fn new<T: Task>(
        task: &T,
        encode: impl FnOnce(&T) -> Result<Vec<u8>, DispatchError>,
    ) -> Result<Self, DispatchError> {
        T::config().validate()?;
        Ok(Self {
            identifier: identifier_of::<T>(),
            config: T::config(),
            capture_bytes: encode(task)?,
        })
    }

    /// The remote function name this descriptor would dispatch to, given
    /// a build-time prefix.
    pub fn remote_function_name(&self, prefix: &str) -> String {
        remote_function_name(prefix, &self.identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Double {
        factor: i64,
    }

    impl Task for Double {
        type Args = i64;
        type Output = i64;
        const SOURCE_TOKEN: &'static str = "fanout_task::tests::double";

        fn call(self, args: Self::Args) -> Self::Output {
            self.factor * args
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Triple {
        factor: i64,
    }

    impl Task for Triple {
        type Args = i64;
        type Output = i64;
        const SOURCE_TOKEN: &'static str = "fanout_task::tests::triple";

        fn call(self, args: Self::Args) -> Self::Output {
            self.factor * args * 3
        }
    }

    #[test]
    fn identifier_is_deterministic() {
        assert_eq!(identifier_of::<Double>(), identifier_of::<Double>());
    }

    #[test]
    fn distinct_tasks_have_distinct_identifiers() {
        assert_ne!(identifier_of::<Double>(), identifier_of::<Triple>());
    }

    #[test]
    fn digest_is_eight_lowercase_hex_chars() {
        let digest = identifier_digest(&identifier_of::<Double>());
        assert_eq!(digest.len(), 8);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn remote_function_name_is_stable() {
        let id = identifier_of::<Double>();
        assert_eq!(
            remote_function_name("fanout-task", &id),
            remote_function_name("fanout-task", &id)
        );
    }

    #[test]
    fn descriptor_carries_defaults() {
        let task = Double { factor: 2 };
        let descriptor = TaskDescriptor::new(&task, |t| {
            Ok(bincode::serialize(t).unwrap())
        })
        .unwrap();
        assert_eq!(descriptor.config, ResourceConfig::default());
        assert!(!descriptor.capture_bytes.is_empty());
    }

    #[test]
    fn resource_config_builder_overrides_defaults() {
        let cfg = ResourceConfig::builder()
            .memory_mb(2048)
            .timeout_s(60)
            .description("benchmark worker")
            .build();
        assert_eq!(cfg.memory_mb, 2048);
        assert_eq!(cfg.timeout_s, 60);
        assert_eq!(cfg.ephemeral_storage_mb, 512);
        assert_eq!(cfg.description, "benchmark worker");
    }

    #[test]
    fn zero_memory_fails_validation() {
        let cfg = ResourceConfig::builder().memory_mb(0).build();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn call_runs_the_task_body() {
        let task = Double { factor: 5 };
        assert_eq!(task.call(4), 20);
    }
}
