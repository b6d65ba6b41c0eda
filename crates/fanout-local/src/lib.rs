// SPDX-License-Identifier: MIT OR Apache-2.0
//! The local subprocess dispatcher (C7): runs each invocation as its own
//! child process, feeding it an encoded payload on stdin and reading its
//! encoded result back from stdout.
//!
//! Which executable answers for a given task identifier is resolved
//! through an entry-point metadata file — `<base-path>.json` next to the
//! running binary, or an explicit [`RuntimeConfig::local_meta_path`]
//! override — mapping each identifier to the executable a build step
//! produced for it.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use fanout_config::RuntimeConfig;
use fanout_error::{DispatchError, ErrorCode};
use fanout_queue::{DispatchSurface, Future, FutureRegistry, InvocationId};
use fanout_task::{Task, TaskDescriptor};
use fanout_trace::SpanRef;
use fanout_wire::{Archive, Payload};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::runtime::Runtime;
use tracing::warn;

/// One entry in the metadata file: which executable implements a given
/// task identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryPoint {
    /// The task identifier this executable was built from.
    pub original_function_name: String,
    /// Path to the built executable.
    pub filename: String,
    /// The key this entry is looked up by — identical to
    /// `original_function_name` today, kept distinct so a future build
    /// step can alias several identifiers onto one binary without a
    /// format change here.
    pub user_meta: String,
}

/// The entry-point metadata file: `{"entry_points": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LocalMeta {
    /// Every entry point this binary's build produced.
    pub entry_points: Vec<EntryPoint>,
}

/// Resolves task identifiers to executables. Shared, immutably, by every
/// instance created from it.
pub struct LocalDispatcherFactory {
    function_map: HashMap<String, PathBuf>,
}

impl LocalDispatcherFactory {
    /// Load the metadata file for `base_path` (typically `argv[0]`),
    /// with its extension replaced by `.json`, unless
    /// `runtime_cfg.local_meta_path` names an explicit path instead.
    pub fn load(
        base_path: impl AsRef<Path>,
        runtime_cfg: &RuntimeConfig,
    ) -> Result<Self, DispatchError> {
        let meta_path = match &runtime_cfg.local_meta_path {
            Some(path) => PathBuf::from(path),
            None => base_path.as_ref().with_extension("json"),
        };
        let text = std::fs::read_to_string(&meta_path).map_err(|e| {
            DispatchError::new(
                ErrorCode::LocalMetaInvalid,
                "could not read entry-point metadata file",
            )
            .with_context("path", meta_path.display().to_string())
            .with_source(e)
        })?;
        let meta: LocalMeta = serde_json::from_str(&text).map_err(|e| {
            DispatchError::new(
                ErrorCode::LocalMetaInvalid,
                "entry-point metadata file is malformed",
            )
            .with_context("path", meta_path.display().to_string())
            .with_source(e)
        })?;
        Ok(Self::from_entry_points(meta.entry_points))
    }

    /// Build a factory directly from a list of entry points, bypassing
    /// the filesystem.
    pub fn from_entry_points(entry_points: Vec<EntryPoint>) -> Self {
        let function_map = entry_points
            .into_iter()
            .map(|e| (e.user_meta, PathBuf::from(e.filename)))
            .collect();
        Self { function_map }
    }

    fn resolve(&self, identifier: &str) -> Result<&Path, DispatchError> {
        self.function_map
            .get(identifier)
            .map(PathBuf::as_path)
            .ok_or_else(|| {
                DispatchError::new(
                    ErrorCode::LocalMetaInvalid,
                    "no entry point registered for task identifier",
                )
                .with_context("identifier", identifier)
            })
    }

    /// Open a dispatcher instance bound to this factory's entry-point
    /// map.
    pub fn create_instance(self: &Arc<Self>) -> Result<LocalDispatcher, DispatchError> {
        LocalDispatcher::new(self.clone())
    }
}

/// A dispatcher instance that runs each invocation as its own child
/// process.
///
/// Mirrors [`fanout_remote::RemoteDispatcher`]'s shape exactly — a
/// dedicated background runtime, a synchronous `dispatch`/`wait_one`
/// surface — so the two backends are interchangeable behind
/// [`DispatchSurface`].
pub struct LocalDispatcher {
    runtime: Option<Runtime>,
    factory: Arc<LocalDispatcherFactory>,
    registry: Arc<FutureRegistry>,
    next_id: u32,
    root_span: Option<SpanRef>,
}

impl LocalDispatcher {
    fn new(factory: Arc<LocalDispatcherFactory>) -> Result<Self, DispatchError> {
        let runtime = Runtime::new().map_err(|e| {
            DispatchError::new(ErrorCode::Internal, "failed to start dispatcher runtime")
                .with_source(e)
        })?;
        Ok(Self {
            runtime: Some(runtime),
            factory,
            registry: Arc::new(FutureRegistry::new()),
            next_id: 0,
            root_span: Some(SpanRef::root("local-dispatcher")),
        })
    }

    fn next_id(&mut self) -> InvocationId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Dispatch one task invocation to the subprocess registered for its
    /// identifier.
    pub fn dispatch<T, A>(
        &mut self,
        descriptor: &TaskDescriptor,
        args: T::Args,
    ) -> Result<(InvocationId, Future<T::Output>), DispatchError>
    where
        T: Task,
        A: Archive + Send + 'static,
    {
        let executable = self.factory.resolve(&descriptor.identifier)?.to_path_buf();
        let payload = Payload::new(descriptor.capture_bytes.clone(), args);
        let bytes = A::encode(&payload)?;

        let id = self.next_id();
        let future = Future::new();
        self.registry.register::<T::Output, A>(id, future.clone());

        let registry = self.registry.clone();
        let span = self.root_span.clone();
        if let Some(runtime) = &self.runtime {
            runtime.spawn(async move {
                let result = run_child(&executable, bytes, span.as_ref()).await;
                registry.complete(id, result);
            });
        }
        Ok((id, future))
    }

    /// Block until one invocation completes and return its id.
    pub fn wait_one(&self) -> InvocationId {
        self.registry.take_one()
    }

    /// Block until `n` invocations have completed, returning their ids
    /// in completion order.
    pub fn wait(&self, n: usize) -> Vec<InvocationId> {
        (0..n).map(|_| self.wait_one()).collect()
    }

    /// Number of invocations still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.registry.pending_count()
    }
}

impl DispatchSurface for LocalDispatcher {
    fn dispatch_payload(
        &mut self,
        identifier: String,
        _resource_timeout_s: u32,
        payload: Vec<u8>,
    ) -> (InvocationId, Future<Vec<u8>>) {
        let id = self.next_id();
        let future = Future::new();
        self.registry.register_raw(id, future.clone());

        let executable = match self.factory.resolve(&identifier) {
            Ok(path) => path.to_path_buf(),
            Err(e) => {
                self.registry.complete(id, Err(e));
                return (id, future);
            }
        };

        let registry = self.registry.clone();
        let span = self.root_span.clone();
        if let Some(runtime) = &self.runtime {
            runtime.spawn(async move {
                let result = run_child(&executable, payload, span.as_ref()).await;
                registry.complete(id, result);
            });
        }
        (id, future)
    }

    fn wait_one(&mut self) -> InvocationId {
        LocalDispatcher::wait_one(self)
    }
}

impl Drop for LocalDispatcher {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn run_child(
    executable: &Path,
    payload: Vec<u8>,
    span: Option<&SpanRef>,
) -> Result<Vec<u8>, DispatchError> {
    let child_span = span.map(|s| s.create_child("local.exec"));
    let mut child = Command::new(executable)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            DispatchError::new(ErrorCode::LocalExecFailed, "failed to spawn task executable")
                .with_context("executable", executable.display().to_string())
                .with_source(e)
        })?;

    let mut stdin = child.stdin.take().ok_or_else(|| {
        DispatchError::new(ErrorCode::LocalExecFailed, "child stdin unavailable")
    })?;
    stdin.write_all(&payload).await.map_err(|e| {
        DispatchError::new(ErrorCode::LocalExecFailed, "failed to write payload to child stdin")
            .with_source(e)
    })?;
    drop(stdin);

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                match tokio::io::AsyncBufReadExt::read_line(&mut lines, &mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let trimmed = line.trim_end();
                        if !trimmed.is_empty() {
                            warn!(target: "fanout_local.stderr", "{trimmed}");
                        }
                    }
                }
            }
        });
    }

    let mut stdout = child.stdout.take().ok_or_else(|| {
        DispatchError::new(ErrorCode::LocalExecFailed, "child stdout unavailable")
    })?;
    let mut output = Vec::new();
    stdout.read_to_end(&mut output).await.map_err(|e| {
        DispatchError::new(ErrorCode::LocalExecFailed, "failed to read child stdout")
            .with_source(e)
    })?;

    let status = child.wait().await.map_err(|e| {
        DispatchError::new(ErrorCode::LocalExecFailed, "failed to wait on child process")
            .with_source(e)
    })?;
    if let Some(s) = &child_span {
        s.set_tag("exit_code", status.code().unwrap_or(-1).to_string());
        s.end();
    }
    if !status.success() {
        return Err(DispatchError::new(
            ErrorCode::LocalExecFailed,
            "task executable exited with non-zero status",
        )
        .with_context("executable", executable.display().to_string())
        .with_context("exit_code", status.code().unwrap_or(-1)));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_wire::BinaryArchive;
    use serde::{Deserialize, Serialize};
    use std::io::Write as _;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Double {
        factor: i64,
    }

    impl Task for Double {
        type Args = i64;
        type Output = i64;
        const SOURCE_TOKEN: &'static str = "fanout_local::tests::double";

        fn call(self, args: Self::Args) -> Self::Output {
            self.factor * args
        }
    }

    /// A tiny shell script standing in for a built task executable: it
    /// copies stdin to stdout untouched, so the round trip through
    /// `run_child` is exercised without needing a real binary crate.
    fn echo_script() -> tempfile::TempPath {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "#!/bin/sh\ncat").unwrap();
        let path = file.into_temp_path();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    /// A script standing in for a built task executable that ignores
    /// its input and always answers with `answer`'s archive-encoded
    /// bytes, written to a sibling file the script `cat`s out — shells
    /// can't run the task's own `call`, so the fixed answer plays that
    /// role in this test.
    fn fixed_answer_script(answer_bytes: &[u8]) -> (tempfile::TempPath, tempfile::TempPath) {
        let mut data_file = tempfile::NamedTempFile::new().unwrap();
        data_file.write_all(answer_bytes).unwrap();
        let data_path = data_file.into_temp_path();

        let mut script_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(script_file, "#!/bin/sh\ncat >/dev/null\ncat {}", data_path.display()).unwrap();
        let script_path = script_file.into_temp_path();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        (script_path, data_path)
    }

    fn failing_script() -> tempfile::TempPath {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "#!/bin/sh\nexit 7").unwrap();
        let path = file.into_temp_path();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    #[tokio::test]
    async fn run_child_returns_stdout_bytes() {
        let script = echo_script();
        let out = run_child(&script, b"hello".to_vec(), None).await.unwrap();
        assert_eq!(out, b"hello".to_vec());
    }

    #[tokio::test]
    async fn run_child_surfaces_non_zero_exit() {
        let script = failing_script();
        let err = run_child(&script, vec![], None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::LocalExecFailed);
        assert_eq!(err.context["exit_code"], serde_json::json!(7));
    }

    #[test]
    fn factory_resolves_registered_identifier() {
        let factory = LocalDispatcherFactory::from_entry_points(vec![EntryPoint {
            original_function_name: "double".into(),
            filename: "/bin/double".into(),
            user_meta: "double".into(),
        }]);
        assert_eq!(factory.resolve("double").unwrap(), Path::new("/bin/double"));
    }

    #[test]
    fn factory_rejects_unregistered_identifier() {
        let factory = LocalDispatcherFactory::from_entry_points(vec![]);
        let err = factory.resolve("missing").unwrap_err();
        assert_eq!(err.code, ErrorCode::LocalMetaInvalid);
    }

    #[tokio::test]
    async fn dispatch_resolves_through_wait_one() {
        let answer_bytes = BinaryArchive::encode(&21i64).unwrap();
        let (script, _data) = fixed_answer_script(&answer_bytes);
        let identifier = fanout_task::identifier_of::<Double>();
        let factory = Arc::new(LocalDispatcherFactory::from_entry_points(vec![EntryPoint {
            original_function_name: identifier.clone(),
            filename: script.to_string_lossy().into_owned(),
            user_meta: identifier.clone(),
        }]));

        let mut dispatcher = factory.create_instance().unwrap();
        let task = Double { factor: 3 };
        let descriptor = TaskDescriptor::new(&task, |t| BinaryArchive::encode(t)).unwrap();

        let (id, future) = dispatcher
            .dispatch::<Double, BinaryArchive>(&descriptor, 7)
            .unwrap();
        let completed = dispatcher.wait_one();
        assert_eq!(completed, id);
        assert_eq!(future.value().unwrap().unwrap(), 21);
    }

    #[tokio::test]
    async fn dispatch_payload_drives_the_object_safe_surface() {
        let answer = b"raw-local-bytes".to_vec();
        let (script, _data) = fixed_answer_script(&answer);
        let factory = Arc::new(LocalDispatcherFactory::from_entry_points(vec![EntryPoint {
            original_function_name: "task::id".into(),
            filename: script.to_string_lossy().into_owned(),
            user_meta: "task::id".into(),
        }]));
        let mut dispatcher = factory.create_instance().unwrap();

        let surface: &mut dyn DispatchSurface = &mut dispatcher;
        let (id, future) = surface.dispatch_payload("task::id".into(), 60, vec![0, 1]);
        let completed = surface.wait_one();
        assert_eq!(completed, id);
        assert_eq!(future.value().unwrap().unwrap(), answer);
    }

    #[tokio::test]
    async fn dispatch_payload_unknown_identifier_completes_with_error() {
        let factory = Arc::new(LocalDispatcherFactory::from_entry_points(vec![]));
        let mut dispatcher = factory.create_instance().unwrap();

        let surface: &mut dyn DispatchSurface = &mut dispatcher;
        let (id, future) = surface.dispatch_payload("missing::id".into(), 60, vec![]);
        let completed = surface.wait_one();
        assert_eq!(completed, id);
        assert_eq!(future.value().unwrap().unwrap_err().code, ErrorCode::LocalMetaInvalid);
    }

    #[tokio::test]
    async fn local_meta_invalid_when_file_missing() {
        let err = LocalDispatcherFactory::load(
            "/nonexistent/path/to/executable",
            &RuntimeConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::LocalMetaInvalid);
    }
}
