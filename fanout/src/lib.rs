// SPDX-License-Identifier: MIT OR Apache-2.0
//! Facade over the task-dispatch core: re-exports every crate's public
//! surface under one namespace, the way `agent-backplane`'s umbrella
//! crate does for its own component crates.
//!
//! `use fanout::prelude::*;` pulls in everything a caller typically
//! needs to declare a [`prelude::Task`], build a [`prelude::GraphBuilder`],
//! and drive it over either [`prelude::RemoteDispatcher`] or
//! [`prelude::LocalDispatcher`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub use fanout_config as config;
pub use fanout_error as error;
pub use fanout_graph as graph;
pub use fanout_local as local;
pub use fanout_net as net;
pub use fanout_queue as queue;
pub use fanout_remote as remote;
pub use fanout_sigv4 as sigv4;
pub use fanout_task as task;
pub use fanout_trace as trace;
pub use fanout_wire as wire;

/// Everything a caller typically needs in scope.
pub mod prelude {
    pub use fanout_config::{Credentials, RuntimeConfig};
    pub use fanout_error::{DispatchError, ErrorCategory, ErrorCode};
    pub use fanout_graph::{GraphBuilder, GraphExecutor, Sender};
    pub use fanout_local::{EntryPoint, LocalDispatcher, LocalDispatcherFactory, LocalMeta};
    pub use fanout_net::InvocationSession;
    pub use fanout_queue::{DispatchSurface, Future, FutureRegistry, InvocationId};
    pub use fanout_remote::RemoteDispatcher;
    pub use fanout_task::{ResourceConfig, ResourceConfigBuilder, Task, TaskDescriptor};
    pub use fanout_trace::{ScopedSpan, Span, SpanContainer, SpanRef};
    pub use fanout_wire::{Archive, BinaryArchive, Payload, StructuredArchive};
}
