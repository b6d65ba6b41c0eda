// SPDX-License-Identifier: MIT OR Apache-2.0
//! Span-tree tracing for dispatcher invocations.
//!
//! A [`SpanContainer`] owns an arena of [`Span`]s; children reference their
//! parent by index rather than by owning pointer, so the tree can be built
//! incrementally from any thread that holds a handle to the container.
//! Every span transition is also emitted through `tracing`, so the tree is
//! observational sugar on top of the ambient structured-logging pipeline,
//! not a replacement for it.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// One node in a span tree.
#[derive(Debug, Clone, Serialize)]
pub struct Span {
    /// Operation name.
    pub name: String,
    /// Milliseconds since the container's epoch when the span opened.
    pub start_ms: Option<u64>,
    /// Milliseconds since the container's epoch when the span closed.
    pub end_ms: Option<u64>,
    /// Index of the parent span; a root span is its own parent.
    pub parent: usize,
    /// Arbitrary string tags attached to the span.
    pub tags: BTreeMap<String, String>,
    /// Hint that this span's children should render inline (cosmetic).
    pub inline_children: bool,
}

/// Arena of spans, ordered so a parent always precedes its children.
pub struct SpanContainer {
    epoch: Instant,
    spans: Vec<Span>,
}

impl Default for SpanContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl SpanContainer {
    /// Create an empty container with a fresh epoch.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            spans: Vec::new(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Insert a root span (its own parent), open from the start.
    pub fn create_root(&mut self, name: impl Into<String>) -> usize {
        let id = self.spans.len();
        let name = name.into();
        let start = self.elapsed_ms();
        tracing::debug!(target: "fanout_trace", span_id = id, span_name = %name, "span opened");
        self.spans.push(Span {
            name,
            start_ms: Some(start),
            end_ms: None,
            parent: id,
            tags: BTreeMap::new(),
            inline_children: false,
        });
        id
    }

    /// Insert a child of `parent`, open from the start.
    pub fn create_child(&mut self, parent: usize, name: impl Into<String>) -> usize {
        let id = self.spans.len();
        let name = name.into();
        let start = self.elapsed_ms();
        tracing::debug!(target: "fanout_trace", span_id = id, parent, span_name = %name, "span opened");
        self.spans.push(Span {
            name,
            start_ms: Some(start),
            end_ms: None,
            parent,
            tags: BTreeMap::new(),
            inline_children: false,
        });
        id
    }

    /// Close a span, idempotently (a second call is a no-op).
    pub fn end(&mut self, id: usize) {
        let elapsed = self.elapsed_ms();
        if let Some(span) = self.spans.get_mut(id) {
            if span.end_ms.is_none() {
                span.end_ms = Some(elapsed);
                tracing::debug!(target: "fanout_trace", span_id = id, span_name = %span.name, "span closed");
            }
        }
    }

    /// Attach a tag to a span.
    pub fn set_tag(&mut self, id: usize, key: impl Into<String>, value: impl Into<String>) {
        if let Some(span) = self.spans.get_mut(id) {
            span.tags.insert(key.into(), value.into());
        }
    }

    /// Mark a span's children for inline rendering.
    pub fn mark_inline_children(&mut self, id: usize) {
        if let Some(span) = self.spans.get_mut(id) {
            span.inline_children = true;
        }
    }

    /// Borrow a span by id.
    pub fn span(&self, id: usize) -> Option<&Span> {
        self.spans.get(id)
    }

    /// Flat list of every span, parents preceding children (serialization
    /// form: parent index travels with each node).
    pub fn snapshot(&self) -> Vec<Span> {
        self.spans.clone()
    }
}

/// A shared, thread-safe handle to one span in a [`SpanContainer`].
#[derive(Clone)]
pub struct SpanRef {
    id: usize,
    container: Arc<Mutex<SpanContainer>>,
}

impl SpanRef {
    /// Create a fresh container and a root span within it.
    pub fn root(name: impl Into<String>) -> Self {
        let container = Arc::new(Mutex::new(SpanContainer::new()));
        let id = container.lock().unwrap().create_root(name);
        Self { id, container }
    }

    /// Create a child span under this one.
    pub fn create_child(&self, name: impl Into<String>) -> Self {
        let id = self.container.lock().unwrap().create_child(self.id, name);
        Self {
            id,
            container: self.container.clone(),
        }
    }

    /// Close this span.
    pub fn end(&self) {
        self.container.lock().unwrap().end(self.id);
    }

    /// Attach a tag.
    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        self.container.lock().unwrap().set_tag(self.id, key, value);
    }

    /// Mark this span's children for inline rendering.
    pub fn mark_inline_children(&self) {
        self.container.lock().unwrap().mark_inline_children(self.id);
    }

    /// Index of this span's parent.
    pub fn parent(&self) -> usize {
        self.container
            .lock()
            .unwrap()
            .span(self.id)
            .map(|s| s.parent)
            .unwrap_or(self.id)
    }

    /// This span's own id within its container.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Snapshot of every span in this handle's container.
    pub fn snapshot(&self) -> Vec<Span> {
        self.container.lock().unwrap().snapshot()
    }
}

/// RAII span: opens a child of `parent` (if any) on construction, closes it
/// on drop. Mirrors a scoped `tracing::Span::enter()` guard but against the
/// serializable span tree.
pub struct ScopedSpan {
    span: Option<SpanRef>,
}

impl ScopedSpan {
    /// Open a child span under `parent`, or do nothing if `parent` is `None`.
    pub fn enter(parent: Option<&SpanRef>, name: impl Into<String>) -> Self {
        Self {
            span: parent.map(|p| p.create_child(name)),
        }
    }

    /// The underlying span handle, if one was opened.
    pub fn span(&self) -> Option<&SpanRef> {
        self.span.as_ref()
    }
}

impl Drop for ScopedSpan {
    fn drop(&mut self) {
        if let Some(span) = &self.span {
            span.end();
        }
    }
}
