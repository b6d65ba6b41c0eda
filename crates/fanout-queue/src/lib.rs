// SPDX-License-Identifier: MIT OR Apache-2.0
//! The future registry (C4): a mapping from monotonically increasing
//! invocation ids to completion slots, written by an I/O thread and read
//! by the owning dispatcher instance's thread.
//!
//! A mutex plus a condition variable guard only the completed-queue; the
//! decode work in [`FutureRegistry::complete`] happens outside the lock,
//! matching the spec's "critical section covers only queue mutation".

#![deny(unsafe_code)]
#![warn(missing_docs)]

use fanout_error::DispatchError;
use fanout_wire::Archive;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex};

/// A monotonically increasing invocation id, assigned by a dispatcher
/// instance.
pub type InvocationId = u32;

/// A single-assignment mailbox holding a task's return value, or the
/// error that prevented it from arriving.
///
/// Cheap to clone (an `Arc` handle); the underlying slot is destroyed
/// when the last handle is dropped.
pub struct Future<T> {
    inner: Arc<Mutex<Option<Result<T, DispatchError>>>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Future<T> {
    /// Create an empty mailbox.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    /// Read the value, if the writer has completed it. Safe to call once
    /// `wait_one`/`take_one` has surfaced this future's id; `None`
    /// before that point (or if the mailbox was never completed, e.g.
    /// because the owning instance was torn down first).
    pub fn value(&self) -> Option<Result<T, DispatchError>>
    where
        T: Clone,
    {
        self.inner.lock().unwrap().clone()
    }

    /// Take the value, leaving the mailbox empty.
    pub fn take(&self) -> Option<Result<T, DispatchError>> {
        self.inner.lock().unwrap().take()
    }

    fn write(&self, value: Result<T, DispatchError>) {
        *self.inner.lock().unwrap() = Some(value);
    }
}

/// A type-erased writer into a [`Future`], able to decode raw response
/// bytes with whichever [`Archive`] the dispatch call was made with.
trait Completer: Send {
    fn complete(self: Box<Self>, bytes: Result<Vec<u8>, DispatchError>);
}

struct TypedCompleter<T, A> {
    slot: Future<T>,
    _archive: PhantomData<A>,
}

impl<T, A> Completer for TypedCompleter<T, A>
where
    T: DeserializeOwned + Send + 'static,
    A: Archive + Send + 'static,
{
    fn complete(self: Box<Self>, bytes: Result<Vec<u8>, DispatchError>) {
        let result = bytes.and_then(|b| A::decode::<T>(&b));
        self.slot.write(result);
    }
}

struct RawCompleter {
    slot: Future<Vec<u8>>,
}

impl Completer for RawCompleter {
    fn complete(self: Box<Self>, bytes: Result<Vec<u8>, DispatchError>) {
        self.slot.write(bytes);
    }
}

struct RegistryState {
    pending: HashMap<InvocationId, Box<dyn Completer>>,
    completed: VecDeque<InvocationId>,
}

/// The shared future registry. One instance per dispatcher; `register`
/// and `take_one` are called only from the owning instance's thread,
/// `complete` may be called from an I/O thread.
pub struct FutureRegistry {
    state: Mutex<RegistryState>,
    condvar: Condvar,
}

impl Default for FutureRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FutureRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                pending: HashMap::new(),
                completed: VecDeque::new(),
            }),
            condvar: Condvar::new(),
        }
    }

    /// Register a completion slot for `id`, to be completed with an
    /// `A`-archive-decoded `T` once its response bytes arrive. Call this
    /// before network submission, so a response racing ahead of
    /// registration is impossible.
    pub fn register<T, A>(&self, id: InvocationId, slot: Future<T>)
    where
        T: DeserializeOwned + Send + 'static,
        A: Archive + Send + 'static,
    {
        let completer: Box<dyn Completer> = Box::new(TypedCompleter::<T, A> {
            slot,
            _archive: PhantomData,
        });
        let mut state = self.state.lock().unwrap();
        state.pending.insert(id, completer);
    }

    /// Register a completion slot that receives raw response bytes with
    /// no archive decoding step. Used by the graph executor (C8), which
    /// only needs to know a task has finished — decoding into a typed
    /// output happens later, inside the node's own downcast.
    pub fn register_raw(&self, id: InvocationId, slot: Future<Vec<u8>>) {
        let completer: Box<dyn Completer> = Box::new(RawCompleter { slot });
        let mut state = self.state.lock().unwrap();
        state.pending.insert(id, completer);
    }

    /// Complete `id` with response bytes (or a failure that should
    /// populate the future's error slot instead of leaving it pending —
    /// the fix for the remote-rejection hang described in the spec's
    /// open questions). A no-op if `id` was never registered or was
    /// already completed.
    pub fn complete(&self, id: InvocationId, bytes: Result<Vec<u8>, DispatchError>) {
        let completer = {
            let mut state = self.state.lock().unwrap();
            state.pending.remove(&id)
        };
        let Some(completer) = completer else {
            return;
        };
        completer.complete(bytes);

        let mut state = self.state.lock().unwrap();
        state.completed.push_back(id);
        self.condvar.notify_one();
    }

    /// Block until the completed-queue is non-empty, then return one id.
    /// Each registered id is returned exactly once.
    pub fn take_one(&self) -> InvocationId {
        let mut state = self.state.lock().unwrap();
        while state.completed.is_empty() {
            state = self.condvar.wait(state).unwrap();
        }
        state.completed.pop_front().unwrap()
    }

    /// Non-blocking variant of [`FutureRegistry::take_one`]: returns
    /// `None` if nothing has completed yet.
    pub fn try_take_one(&self) -> Option<InvocationId> {
        self.state.lock().unwrap().completed.pop_front()
    }

    /// Number of invocations still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }
}

/// A dispatcher backend's object-safe surface: submit a pre-encoded
/// payload to a named function and get back an id plus the raw-bytes
/// future it will complete, or block for the next completed id.
///
/// Implemented by both the remote (HTTP/2) and local (subprocess)
/// dispatcher instances, so the graph executor (C8) can drive either
/// backend through a single `dyn DispatchSurface` without knowing
/// which one it holds.
pub trait DispatchSurface: Send {
    /// Submit `payload` for the task named `identifier` (a
    /// `fanout-task` identifier, not a backend-specific function name —
    /// each backend resolves it its own way: the remote backend hashes
    /// it into a function name, the local backend looks it up in its
    /// entry-point map), allowing up to `resource_timeout_s` seconds for
    /// it to complete. Returns the assigned invocation id and the future
    /// its response will land in.
    fn dispatch_payload(
        &mut self,
        identifier: String,
        resource_timeout_s: u32,
        payload: Vec<u8>,
    ) -> (InvocationId, Future<Vec<u8>>);

    /// Block until another invocation completes and return its id.
    fn wait_one(&mut self) -> InvocationId;
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_wire::BinaryArchive;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn register_then_complete_writes_value() {
        let registry = FutureRegistry::new();
        let future: Future<i64> = Future::new();
        registry.register::<i64, BinaryArchive>(1, future.clone());

        let bytes = BinaryArchive::encode(&42i64).unwrap();
        registry.complete(1, Ok(bytes));

        let id = registry.take_one();
        assert_eq!(id, 1);
        assert_eq!(future.value().unwrap().unwrap(), 42);
    }

    #[test]
    fn complete_with_error_populates_error_slot() {
        let registry = FutureRegistry::new();
        let future: Future<i64> = Future::new();
        registry.register::<i64, BinaryArchive>(7, future.clone());

        let err = DispatchError::remote_rejected(500, "boom");
        registry.complete(7, Err(err));

        registry.take_one();
        assert!(future.value().unwrap().is_err());
    }

    #[test]
    fn each_id_returned_exactly_once() {
        let registry = FutureRegistry::new();
        for id in 0..5u32 {
            let future: Future<i64> = Future::new();
            registry.register::<i64, BinaryArchive>(id, future);
            registry.complete(id, Ok(BinaryArchive::encode(&(id as i64)).unwrap()));
        }
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(registry.take_one());
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn take_one_blocks_until_complete_from_another_thread() {
        let registry = Arc::new(FutureRegistry::new());
        let future: Future<i64> = Future::new();
        registry.register::<i64, BinaryArchive>(99, future.clone());

        let registry2 = registry.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            registry2.complete(99, Ok(BinaryArchive::encode(&1i64).unwrap()));
        });

        let id = registry.take_one();
        assert_eq!(id, 99);
        handle.join().unwrap();
    }

    #[test]
    fn complete_on_unregistered_id_is_a_no_op() {
        let registry = FutureRegistry::new();
        registry.complete(123, Ok(vec![]));
        assert_eq!(registry.try_take_one(), None);
    }

    #[test]
    fn try_take_one_is_non_blocking() {
        let registry = FutureRegistry::new();
        assert_eq!(registry.try_take_one(), None);
    }

    #[test]
    fn register_raw_passes_bytes_through_undecoded() {
        let registry = FutureRegistry::new();
        let future: Future<Vec<u8>> = Future::new();
        registry.register_raw(42, future.clone());

        registry.complete(42, Ok(vec![9, 9, 9]));
        let id = registry.take_one();

        assert_eq!(id, 42);
        assert_eq!(future.value().unwrap().unwrap(), vec![9, 9, 9]);
    }
}
