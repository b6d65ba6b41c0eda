// SPDX-License-Identifier: MIT OR Apache-2.0
//! The dataflow graph builder and executor (C8): a DAG of task nodes
//! driven through a single dispatcher instance.
//!
//! Nodes are arena-allocated — [`GraphBuilder`] owns a `Vec` of them and
//! every cross-reference (an edge, a [`Sender`]) is a plain index into
//! that vector, never an owning or weak pointer. A node's typed output
//! value is stored behind an erased `Rc<dyn Any>` so it can be broadcast
//! to any number of successor input slots without requiring the task's
//! output type to implement `Clone`; [`Sender<T>`] carries the type back
//! at the edges, where [`GraphBuilder::then1`]/[`GraphBuilder::then2`]
//! downcast it again before handing it to a task's argument tuple.
//!
//! Because the builder only lets a `then*` call wire in a [`Sender`]
//! produced by an earlier call, a node can never reference one created
//! after it — cycles are unconstructable through this API, not merely
//! undetected.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use fanout_error::{DispatchError, ErrorCode};
use fanout_queue::{DispatchSurface, Future, InvocationId};
use fanout_task::{Task, TaskDescriptor};
use fanout_trace::SpanRef;
use fanout_wire::Archive;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::Rc;

/// A typed handle to one node's output, usable as input to a later
/// `then*` call or to read the final value once the graph has run.
pub struct Sender<T> {
    node_id: usize,
    _marker: PhantomData<T>,
}

impl<T> Sender<T> {
    fn new(node_id: usize) -> Self {
        Self {
            node_id,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self::new(self.node_id)
    }
}

impl<T> Copy for Sender<T> {}

/// The wire shape a `then*` call serializes: the task's captured state
/// followed by its argument tuple, matching [`fanout_wire::Payload`]'s
/// field layout but built from borrowed pieces so a broadcast output
/// doesn't need to be cloned to feed more than one downstream task.
#[derive(Serialize)]
struct PayloadRef<'a, A> {
    context: &'a [u8],
    args: A,
}

trait ErasedTask {
    fn identifier(&self) -> &str;
    fn resource_timeout_s(&self) -> u32;
    fn build_payload(&self, inputs: &[Rc<dyn Any>]) -> Result<Vec<u8>, DispatchError>;
    fn decode_output(&self, bytes: Vec<u8>) -> Result<Rc<dyn Any>, DispatchError>;
}

fn mismatch(what: &str) -> DispatchError {
    DispatchError::new(ErrorCode::Internal, "input slot type mismatch").with_context("slot", what)
}

struct TypedTask0<T, A> {
    descriptor: TaskDescriptor,
    _marker: PhantomData<(T, A)>,
}

impl<T, A> ErasedTask for TypedTask0<T, A>
where
    T: Task<Args = ()>,
    A: Archive + 'static,
{
    fn identifier(&self) -> &str {
        &self.descriptor.identifier
    }

    fn resource_timeout_s(&self) -> u32 {
        self.descriptor.config.timeout_s
    }

    fn build_payload(&self, _inputs: &[Rc<dyn Any>]) -> Result<Vec<u8>, DispatchError> {
        let payload = PayloadRef {
            context: &self.descriptor.capture_bytes,
            args: (),
        };
        A::encode(&payload)
    }

    fn decode_output(&self, bytes: Vec<u8>) -> Result<Rc<dyn Any>, DispatchError> {
        let value: T::Output = A::decode(&bytes)?;
        Ok(Rc::new(value))
    }
}

struct TypedTask1<T, A> {
    descriptor: TaskDescriptor,
    _marker: PhantomData<(T, A)>,
}

impl<T, A> ErasedTask for TypedTask1<T, A>
where
    T: Task,
    A: Archive + 'static,
{
    fn identifier(&self) -> &str {
        &self.descriptor.identifier
    }

    fn resource_timeout_s(&self) -> u32 {
        self.descriptor.config.timeout_s
    }

    fn build_payload(&self, inputs: &[Rc<dyn Any>]) -> Result<Vec<u8>, DispatchError> {
        let arg = inputs
            .first()
            .and_then(|v| v.downcast_ref::<T::Args>())
            .ok_or_else(|| mismatch("0"))?;
        let payload = PayloadRef {
            context: &self.descriptor.capture_bytes,
            args: arg,
        };
        A::encode(&payload)
    }

    fn decode_output(&self, bytes: Vec<u8>) -> Result<Rc<dyn Any>, DispatchError> {
        let value: T::Output = A::decode(&bytes)?;
        Ok(Rc::new(value))
    }
}

struct TypedTask2<T, A, X, Y> {
    descriptor: TaskDescriptor,
    _marker: PhantomData<(T, A, X, Y)>,
}

impl<T, A, X, Y> ErasedTask for TypedTask2<T, A, X, Y>
where
    T: Task<Args = (X, Y)>,
    A: Archive + 'static,
    X: 'static + serde::Serialize,
    Y: 'static + serde::Serialize,
{
    fn identifier(&self) -> &str {
        &self.descriptor.identifier
    }

    fn resource_timeout_s(&self) -> u32 {
        self.descriptor.config.timeout_s
    }

    fn build_payload(&self, inputs: &[Rc<dyn Any>]) -> Result<Vec<u8>, DispatchError> {
        let x = inputs
            .first()
            .and_then(|v| v.downcast_ref::<X>())
            .ok_or_else(|| mismatch("0"))?;
        let y = inputs
            .get(1)
            .and_then(|v| v.downcast_ref::<Y>())
            .ok_or_else(|| mismatch("1"))?;
        let payload = PayloadRef {
            context: &self.descriptor.capture_bytes,
            args: (x, y),
        };
        A::encode(&payload)
    }

    fn decode_output(&self, bytes: Vec<u8>) -> Result<Rc<dyn Any>, DispatchError> {
        let value: T::Output = A::decode(&bytes)?;
        Ok(Rc::new(value))
    }
}

enum NodeBody {
    Source,
    Task(Box<dyn ErasedTask>),
}

struct Node {
    body: NodeBody,
    dependency_count: u32,
    input_slots: Vec<Option<Rc<dyn Any>>>,
    successors: Vec<(usize, Option<usize>)>,
    output: Option<Rc<dyn Any>>,
}

/// An arena of DAG nodes under construction. Every node id this builder
/// hands out (via a [`Sender`]) stays valid for the builder's lifetime;
/// nothing is ever removed.
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
}

impl GraphBuilder {
    /// Start an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    fn push_source(&mut self) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node {
            body: NodeBody::Source,
            dependency_count: 0,
            input_slots: Vec::new(),
            successors: Vec::new(),
            output: None,
        });
        id
    }

    fn push_task(&mut self, task: Box<dyn ErasedTask>, slot_count: usize) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node {
            body: NodeBody::Task(task),
            dependency_count: 0,
            input_slots: vec![None; slot_count],
            successors: Vec::new(),
            output: None,
        });
        id
    }

    fn connect(&mut self, from: usize, to: usize, slot: Option<usize>) {
        self.nodes[from].successors.push((to, slot));
        self.nodes[to].dependency_count += 1;
    }

    /// Create a source node: a pure dependency-release marker with no
    /// work of its own. Every dataflow graph starts from one of these.
    pub fn schedule(&mut self) -> Sender<()> {
        Sender::new(self.push_source())
    }

    /// Wire a zero-argument task (`T::Args = ()`) after a control edge.
    pub fn then0<T, A>(
        &mut self,
        input: Sender<()>,
        task: T,
    ) -> Result<Sender<T::Output>, DispatchError>
    where
        T: Task<Args = ()>,
        A: Archive + 'static,
    {
        let descriptor = TaskDescriptor::new(&task, |t| A::encode(t))?;
        let erased: Box<dyn ErasedTask> = Box::new(TypedTask0::<T, A> {
            descriptor,
            _marker: PhantomData,
        });
        let node_id = self.push_task(erased, 0);
        self.connect(input.node_id, node_id, None);
        Ok(Sender::new(node_id))
    }

    /// Wire a single-argument task after a data edge carrying its
    /// argument value.
    pub fn then1<T, A>(
        &mut self,
        input: Sender<T::Args>,
        task: T,
    ) -> Result<Sender<T::Output>, DispatchError>
    where
        T: Task,
        A: Archive + 'static,
    {
        let descriptor = TaskDescriptor::new(&task, |t| A::encode(t))?;
        let erased: Box<dyn ErasedTask> = Box::new(TypedTask1::<T, A> {
            descriptor,
            _marker: PhantomData,
        });
        let node_id = self.push_task(erased, 1);
        self.connect(input.node_id, node_id, Some(0));
        Ok(Sender::new(node_id))
    }

    /// Wire a two-argument task (`T::Args = (X, Y)`) after two data
    /// edges, one per positional argument.
    pub fn then2<T, A, X, Y>(
        &mut self,
        a: Sender<X>,
        b: Sender<Y>,
        task: T,
    ) -> Result<Sender<T::Output>, DispatchError>
    where
        T: Task<Args = (X, Y)>,
        A: Archive + 'static,
        X: 'static + serde::Serialize,
        Y: 'static + serde::Serialize,
    {
        let descriptor = TaskDescriptor::new(&task, |t| A::encode(t))?;
        let erased: Box<dyn ErasedTask> = Box::new(TypedTask2::<T, A, X, Y> {
            descriptor,
            _marker: PhantomData,
        });
        let node_id = self.push_task(erased, 2);
        self.connect(a.node_id, node_id, Some(0));
        self.connect(b.node_id, node_id, Some(1));
        Ok(Sender::new(node_id))
    }

    /// Read a node's output as a shared handle, once the graph has been
    /// run. Cheap — no clone of the underlying value.
    pub fn output<T: 'static>(&self, sender: Sender<T>) -> Result<Rc<T>, DispatchError> {
        let value = self.nodes[sender.node_id].output.clone().ok_or_else(|| {
            DispatchError::new(ErrorCode::UnfilledSlot, "node has not produced a value yet")
                .with_context("node_id", sender.node_id)
        })?;
        value
            .downcast::<T>()
            .map_err(|_| DispatchError::new(ErrorCode::Internal, "output type mismatch"))
    }

    /// Read a node's output by value, cloning it out of the shared
    /// handle — the common case for scalar or small results.
    pub fn output_value<T: Clone + 'static>(&self, sender: Sender<T>) -> Result<T, DispatchError> {
        self.output(sender).map(|rc| (*rc).clone())
    }

    /// Number of nodes in the graph, including source nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Total number of edges (control and data) in the graph.
    pub fn edge_count(&self) -> usize {
        self.nodes.iter().map(|n| n.successors.len()).sum()
    }

    /// Render the graph as a Graphviz `digraph`, one line per node and
    /// one per edge — enough to eyeball a DAG's shape without pulling in
    /// a layout engine.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph {\n");
        for (id, node) in self.nodes.iter().enumerate() {
            let label = match node.body {
                NodeBody::Source => "source",
                NodeBody::Task(_) => "task",
            };
            out.push_str(&format!("  {id} [label=\"{label}\"];\n"));
        }
        for (id, node) in self.nodes.iter().enumerate() {
            for (succ, _) in &node.successors {
                out.push_str(&format!("  {id} -> {succ};\n"));
            }
        }
        out.push_str("}\n");
        out
    }
}

/// Drives a [`GraphBuilder`]'s nodes to completion over a single
/// [`DispatchSurface`], implementing the spec's `await_all` loop so
/// application code never has to write it by hand.
pub struct GraphExecutor<'a> {
    surface: &'a mut dyn DispatchSurface,
    root_span: Option<SpanRef>,
}

impl<'a> GraphExecutor<'a> {
    /// Bind an executor to the dispatcher backend it will drive every
    /// node's invocation through.
    pub fn new(surface: &'a mut dyn DispatchSurface) -> Self {
        let root_span = SpanRef::root("graph-executor");
        root_span.mark_inline_children();
        Self {
            surface,
            root_span: Some(root_span),
        }
    }

    /// Run every node in `builder` to completion: source nodes release
    /// their successors immediately; task nodes dispatch once all their
    /// input slots are filled, and `wait_one` drains completions until
    /// nothing is left running.
    ///
    /// Ready nodes are drained LIFO, matching the spec's tie-break —
    /// unobservable to correctness, but it means two runs dispatch
    /// siblings in reverse creation order.
    pub fn run_to_completion(&mut self, builder: &mut GraphBuilder) -> Result<(), DispatchError> {
        let mut ready: Vec<usize> = builder
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.dependency_count == 0)
            .map(|(i, _)| i)
            .collect();
        let mut running: HashMap<InvocationId, usize> = HashMap::new();
        let mut pending: HashMap<usize, Future<Vec<u8>>> = HashMap::new();
        let mut node_spans: HashMap<usize, SpanRef> = HashMap::new();

        while !running.is_empty() || !ready.is_empty() {
            while let Some(node_id) = ready.pop() {
                if matches!(builder.nodes[node_id].body, NodeBody::Source) {
                    Self::propagate(builder, node_id, None, &mut ready);
                    continue;
                }

                let inputs: Vec<Rc<dyn Any>> = builder.nodes[node_id]
                    .input_slots
                    .iter()
                    .map(|slot| {
                        slot.clone().ok_or_else(|| {
                            DispatchError::new(
                                ErrorCode::UnfilledSlot,
                                "task node executed with an unfilled input slot",
                            )
                            .with_context("node_id", node_id)
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                let (identifier, resource_timeout_s, payload) = match &builder.nodes[node_id].body
                {
                    NodeBody::Task(task) => (
                        task.identifier().to_string(),
                        task.resource_timeout_s(),
                        task.build_payload(&inputs)?,
                    ),
                    NodeBody::Source => unreachable!("sources are handled above"),
                };

                let node_span = self
                    .root_span
                    .as_ref()
                    .map(|s| s.create_child(format!("node[{node_id}]")));
                if let Some(span) = &node_span {
                    span.set_tag("identifier", identifier.clone());
                }

                let (invocation_id, future) =
                    self.surface
                        .dispatch_payload(identifier, resource_timeout_s, payload);
                running.insert(invocation_id, node_id);
                pending.insert(node_id, future);
                if let Some(span) = node_span {
                    node_spans.insert(node_id, span);
                }
            }

            if running.is_empty() {
                break;
            }

            let completed = self.surface.wait_one();
            let node_id = running.remove(&completed).ok_or_else(|| {
                DispatchError::new(
                    ErrorCode::Internal,
                    "dispatcher returned an invocation id this executor never registered",
                )
            })?;
            let future = pending
                .remove(&node_id)
                .expect("an invocation registered in `running` always has a pending future");
            let bytes = future
                .take()
                .expect("wait_one only returns ids whose future has just been completed")?;

            let output = match &builder.nodes[node_id].body {
                NodeBody::Task(task) => task.decode_output(bytes)?,
                NodeBody::Source => unreachable!("source nodes are never dispatched"),
            };
            if let Some(span) = node_spans.remove(&node_id) {
                span.end();
            }
            Self::propagate(builder, node_id, Some(output.clone()), &mut ready);
            builder.nodes[node_id].output = Some(output);
        }

        // Defense in depth: the typed builder API can't actually wire a
        // cycle (a `then*` call only ever takes a `Sender` from a node
        // created earlier), but a node left undispatched here would mean
        // one snuck in some other way, so surface it rather than return
        // a silently incomplete graph.
        let stuck = builder
            .nodes
            .iter()
            .filter(|n| matches!(n.body, NodeBody::Task(_)) && n.output.is_none())
            .count();
        if stuck > 0 {
            return Err(DispatchError::new(
                ErrorCode::GraphCycle,
                "graph executor stalled with unexecuted task nodes",
            )
            .with_context("stuck_nodes", stuck));
        }
        Ok(())
    }

    fn propagate(
        builder: &mut GraphBuilder,
        node_id: usize,
        value: Option<Rc<dyn Any>>,
        ready: &mut Vec<usize>,
    ) {
        let successors = builder.nodes[node_id].successors.clone();
        for (succ_id, slot) in successors {
            if let (Some(idx), Some(v)) = (slot, &value) {
                builder.nodes[succ_id].input_slots[idx] = Some(Rc::clone(v));
            }
            builder.nodes[succ_id].dependency_count -= 1;
            if builder.nodes[succ_id].dependency_count == 0 {
                ready.push(succ_id);
            }
        }
    }
}
