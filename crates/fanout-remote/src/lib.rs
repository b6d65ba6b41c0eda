// SPDX-License-Identifier: MIT OR Apache-2.0
//! The remote dispatcher instance (C6): `dispatch`/`wait_one` over a
//! persistent HTTP/2 invocation session.
//!
//! The public surface is synchronous, matching the original C++
//! `instance` class's blocking `wait_one()` loop, while the network work
//! underneath runs on a dedicated [`tokio::runtime::Runtime`] owned by
//! the instance. `dispatch` spawns the submission and returns
//! immediately with an id and a [`Future`]; `wait_one` blocks on the
//! future registry's condition variable until some submission completes.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use fanout_config::{Credentials, RuntimeConfig};
use fanout_error::{DispatchError, ErrorCode};
use fanout_net::InvocationSession;
use fanout_queue::{DispatchSurface, Future, FutureRegistry, InvocationId};
use fanout_task::{Task, TaskDescriptor};
use fanout_trace::SpanRef;
use fanout_wire::{Archive, Payload};
use std::sync::Arc;
use tokio::runtime::Runtime;

/// A dispatcher instance bound to one HTTP/2 invocation session.
///
/// Dropping an instance with invocations still pending abandons them:
/// the background runtime is shut down without waiting for in-flight
/// requests, so their futures are left uncompleted rather than blocking
/// teardown.
pub struct RemoteDispatcher {
    runtime: Option<Runtime>,
    session: Arc<InvocationSession>,
    registry: Arc<FutureRegistry>,
    next_id: u32,
    function_prefix: String,
    root_span: Option<SpanRef>,
}

impl RemoteDispatcher {
    /// Open a dispatcher against the real AWS-style Lambda endpoint for
    /// `credentials.region`.
    pub fn new(credentials: Credentials, runtime_cfg: &RuntimeConfig) -> Result<Self, DispatchError> {
        let function_prefix = runtime_cfg.function_prefix.clone();
        let session = InvocationSession::new(credentials, runtime_cfg)?;
        Self::from_session(session, function_prefix)
    }

    /// Open a dispatcher against a custom host, used by tests to point at
    /// a mock HTTP responder instead of the real endpoint.
    pub fn with_host(
        credentials: Credentials,
        runtime_cfg: &RuntimeConfig,
        host: impl Into<String>,
    ) -> Result<Self, DispatchError> {
        let function_prefix = runtime_cfg.function_prefix.clone();
        let session = InvocationSession::with_host(credentials, runtime_cfg, host)?;
        Self::from_session(session, function_prefix)
    }

    fn from_session(session: InvocationSession, function_prefix: String) -> Result<Self, DispatchError> {
        let runtime = Runtime::new().map_err(|e| {
            DispatchError::new(ErrorCode::Internal, "failed to start dispatcher runtime")
                .with_source(e)
        })?;
        Ok(Self {
            runtime: Some(runtime),
            session: Arc::new(session),
            registry: Arc::new(FutureRegistry::new()),
            next_id: 0,
            function_prefix,
            root_span: Some(SpanRef::root("remote-dispatcher")),
        })
    }

    fn next_id(&mut self) -> InvocationId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Dispatch one task invocation using archive `A` to encode the
    /// payload and decode the response. Returns immediately with the
    /// assigned invocation id and a future for the task's output.
    pub fn dispatch<T, A>(
        &mut self,
        descriptor: &TaskDescriptor,
        args: T::Args,
    ) -> Result<(InvocationId, Future<T::Output>), DispatchError>
    where
        T: Task,
        A: Archive + Send + 'static,
    {
        let payload = Payload::new(descriptor.capture_bytes.clone(), args);
        let bytes = A::encode(&payload)?;
        let function_name = descriptor.remote_function_name(&self.function_prefix);

        let id = self.next_id();
        let future = Future::new();
        self.registry.register::<T::Output, A>(id, future.clone());

        let session = self.session.clone();
        let registry = self.registry.clone();
        let span = self.root_span.clone();
        if let Some(runtime) = &self.runtime {
            runtime.spawn(async move {
                let result = session.submit(&function_name, bytes, span.as_ref()).await;
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

impl DispatchSurface for RemoteDispatcher {
    fn dispatch_payload(
        &mut self,
        identifier: String,
        resource_timeout_s: u32,
        payload: Vec<u8>,
    ) -> (InvocationId, Future<Vec<u8>>) {
        let function_name = fanout_task::remote_function_name(&self.function_prefix, &identifier);
        let id = self.next_id();
        let future = Future::new();
        self.registry.register_raw(id, future.clone());

        let session = self.session.clone();
        let registry = self.registry.clone();
        let span = self.root_span.clone();
        if let Some(s) = &span {
            s.set_tag("resource_timeout_s", resource_timeout_s.to_string());
        }
        if let Some(runtime) = &self.runtime {
            runtime.spawn(async move {
                let result = session.submit(&function_name, payload, span.as_ref()).await;
                registry.complete(id, result);
            });
        }
        (id, future)
    }

    fn wait_one(&mut self) -> InvocationId {
        RemoteDispatcher::wait_one(self)
    }
}

impl Drop for RemoteDispatcher {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_wire::BinaryArchive;
    use serde::{Deserialize, Serialize};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Double {
        factor: i64,
    }

    impl Task for Double {
        type Args = i64;
        type Output = i64;
        const SOURCE_TOKEN: &'static str = "fanout_remote::tests::double";

        fn call(self, args: Self::Args) -> Self::Output {
            self.factor * args
        }
    }

    fn test_credentials() -> Credentials {
        Credentials {
            region: "us-east-1".into(),
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "secret".into(),
        }
    }

    #[tokio::test]
    async fn dispatch_resolves_through_wait_one() {
        let mock_server = MockServer::start().await;
        let encoded = BinaryArchive::encode(&84i64).unwrap();
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(encoded))
            .mount(&mock_server)
            .await;

        let mut dispatcher = RemoteDispatcher::with_host(
            test_credentials(),
            &RuntimeConfig::default(),
            mock_server.address().to_string(),
        )
        .unwrap();

        let task = Double { factor: 2 };
        let descriptor =
            TaskDescriptor::new(&task, |t| BinaryArchive::encode(t)).unwrap();
        let (id, future) = dispatcher
            .dispatch::<Double, BinaryArchive>(&descriptor, 42)
            .unwrap();

        let completed = dispatcher.wait_one();
        assert_eq!(completed, id);
        assert_eq!(future.value().unwrap().unwrap(), 84);
    }

    #[tokio::test]
    async fn non_200_response_completes_future_with_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&mock_server)
            .await;

        let mut dispatcher = RemoteDispatcher::with_host(
            test_credentials(),
            &RuntimeConfig::default(),
            mock_server.address().to_string(),
        )
        .unwrap();

        let task = Double { factor: 2 };
        let descriptor =
            TaskDescriptor::new(&task, |t| BinaryArchive::encode(t)).unwrap();
        let (_id, future) = dispatcher
            .dispatch::<Double, BinaryArchive>(&descriptor, 1)
            .unwrap();

        dispatcher.wait_one();
        let err = future.value().unwrap().unwrap_err();
        assert_eq!(err.code, fanout_error::ErrorCode::RemoteRejected);
    }

    #[tokio::test]
    async fn dispatch_ids_are_assigned_monotonically() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BinaryArchive::encode(&1i64).unwrap()))
            .mount(&mock_server)
            .await;

        let mut dispatcher = RemoteDispatcher::with_host(
            test_credentials(),
            &RuntimeConfig::default(),
            mock_server.address().to_string(),
        )
        .unwrap();

        let task = Double { factor: 1 };
        let descriptor = TaskDescriptor::new(&task, |t| BinaryArchive::encode(t)).unwrap();

        let (id_a, _) = dispatcher.dispatch::<Double, BinaryArchive>(&descriptor, 1).unwrap();
        let (id_b, _) = dispatcher.dispatch::<Double, BinaryArchive>(&descriptor, 2).unwrap();
        assert!(id_b > id_a);
    }

    #[tokio::test]
    async fn dispatch_payload_drives_the_object_safe_surface() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"raw-bytes".to_vec()))
            .mount(&mock_server)
            .await;

        let mut dispatcher = RemoteDispatcher::with_host(
            test_credentials(),
            &RuntimeConfig::default(),
            mock_server.address().to_string(),
        )
        .unwrap();

        let surface: &mut dyn DispatchSurface = &mut dispatcher;
        let (id, future) = surface.dispatch_payload("some::task@identifier".into(), 300, vec![1, 2, 3]);
        let completed = surface.wait_one();
        assert_eq!(completed, id);
        assert_eq!(future.value().unwrap().unwrap(), b"raw-bytes".to_vec());
    }
}
