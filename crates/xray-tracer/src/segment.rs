// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Segment trees and the lifecycle that decides when they are emitted.
//!
//! A tree is owned from the top: every node owns its buffered children, while children only keep
//! weak references back to their parent and root. The root itself is owned by the caller's
//! handle and, until it is emitted, by its cancellation watcher task.
//!
//! Every node carries its own mutex and no code path ever holds two of them at once. Appending a
//! child takes the parent's lock; the child's fields are initialised before it is shared.
//!
//! Emission is driven by `flush`. A node is ready when all of its tracked children have completed
//! and it has itself been closed, or when its owning request was cancelled. A ready subsegment
//! reports upward to its parent exactly once; a ready root is emitted exactly once.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::annotation::AnnotationValue;
use crate::cause::CauseData;
use crate::errors::TraceError;
use crate::header::{SamplingDecision, TraceHeader};
use crate::http::{HttpData, HttpRequestData, HttpResponseData};
use crate::id::{new_segment_id, new_trace_id};
use crate::packer;
use crate::recorder::RecorderInner;

/// Segment names longer than this are truncated.
pub const MAX_NAME_LENGTH: usize = 200;

/// Namespace used by [`Segment::add_metadata`].
pub const DEFAULT_METADATA_NAMESPACE: &str = "default";

pub(crate) fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

fn truncate_name(name: &str) -> String {
    name.chars().take(MAX_NAME_LENGTH).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceData {
    pub version: String,
}

/// Identity and sampling decision for a new root, resolved by the recorder.
pub(crate) struct RootOrigin {
    pub(crate) trace_id: Option<String>,
    pub(crate) parent_id: Option<String>,
    pub(crate) sampled: bool,
}

pub(crate) struct ChildSlot {
    pub(crate) node: Arc<SegmentNode>,
    /// True until the child has completed and reported to this node, or has been removed.
    pub(crate) open: bool,
}

#[derive(Default)]
pub(crate) struct SegmentState {
    pub(crate) start_time: f64,
    pub(crate) end_time: Option<f64>,
    pub(crate) in_progress: bool,
    pub(crate) parent_id: Option<String>,
    pub(crate) namespace: Option<String>,
    pub(crate) request_was_traced: bool,

    pub(crate) error: bool,
    pub(crate) fault: bool,
    pub(crate) throttle: bool,
    pub(crate) cause: Option<CauseData>,

    pub(crate) annotations: Option<HashMap<String, AnnotationValue>>,
    pub(crate) metadata: Option<HashMap<String, HashMap<String, Value>>>,
    pub(crate) aws: Option<Map<String, Value>>,
    pub(crate) service: Option<ServiceData>,
    pub(crate) http: Option<HttpData>,

    pub(crate) raw_subsegments: Vec<ChildSlot>,
    pub(crate) open_segments: usize,
    /// Only maintained on roots.
    pub(crate) total_sub_segments: usize,

    pub(crate) context_done: bool,
    /// For a subsegment: it has reported completion to its parent. For a root: it was emitted.
    pub(crate) flushed: bool,
    /// Subsegments only; set once the node has been written into a document.
    pub(crate) packed: bool,
}

pub(crate) struct SegmentNode {
    pub(crate) id: String,
    pub(crate) trace_id: String,
    pub(crate) name: String,
    pub(crate) sampled: bool,
    parent: Option<Weak<SegmentNode>>,
    root: Option<Weak<SegmentNode>>,
    /// Roots only.
    tracer: Option<Arc<RecorderInner>>,
    /// Roots only; cancelled once the root is emitted so the watcher can exit.
    finished: Option<CancellationToken>,
    state: Mutex<SegmentState>,
}

impl SegmentNode {
    #[allow(clippy::expect_used)]
    pub(crate) fn lock(&self) -> MutexGuard<'_, SegmentState> {
        self.state.lock().expect("lock poisoned")
    }

    pub(crate) fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub(crate) fn in_progress(&self) -> bool {
        self.lock().in_progress
    }

    pub(crate) fn root_node(self: &Arc<Self>) -> Option<Arc<SegmentNode>> {
        match &self.root {
            None => Some(Arc::clone(self)),
            Some(root) => root.upgrade(),
        }
    }

    /// Re-evaluates whether this node is ready and, if so, reports upward or emits.
    /// `completed_child` is the child whose own completion triggered this call.
    fn flush(self: &Arc<Self>, completed_child: Option<&Arc<SegmentNode>>) {
        if let Some(child) = completed_child {
            self.child_completed(child);
        }

        let should_flush = {
            let mut state = self.lock();
            let ready = !state.flushed
                && ((state.open_segments == 0 && state.end_time.is_some()) || state.context_done);
            if ready {
                state.flushed = true;
            }
            ready
        };
        if !should_flush {
            return;
        }

        match &self.parent {
            None => self.emit(),
            Some(parent) => match parent.upgrade() {
                Some(parent) => parent.flush(Some(self)),
                None => debug!(
                    "Parent of subsegment {} was dropped before it completed",
                    self.name
                ),
            },
        }
    }

    fn child_completed(self: &Arc<Self>, child: &Arc<SegmentNode>) {
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            // Absent when the child was already streamed out; removal accounted for it.
            if let Some(slot) = state
                .raw_subsegments
                .iter_mut()
                .find(|slot| Arc::ptr_eq(&slot.node, child))
            {
                if slot.open {
                    slot.open = false;
                    state.open_segments -= 1;
                }
            }
        }

        let Some(root) = self.root_node() else {
            return;
        };
        // Stragglers of an already emitted tree are discarded.
        if root.lock().flushed {
            return;
        }
        let Some(tracer) = root.tracer.as_ref() else {
            return;
        };
        let strategy = tracer.config.streaming.as_ref();
        if !strategy.requires_streaming(&Segment::from_node(Arc::clone(self))) {
            return;
        }

        let blocks = packer::stream_subsegment(self, child, strategy);
        if !blocks.is_empty() {
            debug!(
                "Streaming {} completed subsegment block(s) under {}",
                blocks.len(),
                self.name
            );
            root.send_streamed(blocks);
        }
    }

    fn emit(self: &Arc<Self>) {
        if let Some(finished) = &self.finished {
            finished.cancel();
        }
        if !self.sampled {
            debug!("Segment {} was not sampled, dropping it", self.name);
            return;
        }
        let Some(tracer) = self.tracer.as_ref() else {
            return;
        };

        let blocks = packer::pack(self, tracer.config.streaming.as_ref());
        debug!("Emitting segment {} as {} block(s)", self.name, blocks.len());
        tracer.emitter.send(blocks);
    }

    /// Sends blocks streamed out of this root's tree ahead of the root itself.
    fn send_streamed(&self, blocks: Vec<Vec<u8>>) {
        if !self.sampled {
            return;
        }
        if let Some(tracer) = self.tracer.as_ref() {
            tracer.emitter.send(blocks);
        }
    }

    fn on_cancelled(self: &Arc<Self>) {
        let emitted = {
            let mut state = self.lock();
            state.context_done = true;
            state.flushed
        };
        if !emitted {
            debug!(
                "Request owning segment {} was cancelled, flushing completed subsegments",
                self.name
            );
            self.flush(None);
        }
    }

    /// Swap-removes `child` from the buffered children. The parent's open count only drops if
    /// the child had not already reported completion, so a child can never be subtracted twice.
    /// Removing the last open child of a closed node makes it ready.
    pub(crate) fn remove_child(self: &Arc<Self>, child: &Arc<SegmentNode>) -> bool {
        let removed = {
            let mut guard = self.lock();
            let state = &mut *guard;
            state
                .raw_subsegments
                .iter()
                .position(|slot| Arc::ptr_eq(&slot.node, child))
                .map(|index| {
                    let slot = state.raw_subsegments.swap_remove(index);
                    if slot.open {
                        state.open_segments -= 1;
                    }
                    slot.open
                })
        };
        let Some(was_open) = removed else {
            return false;
        };

        self.release_descendants(1);
        if was_open {
            self.flush(None);
        }
        true
    }

    /// Marks a completed node as serialized. Returns false if it is still running or another
    /// pack already took it, so a node is never written into two documents.
    pub(crate) fn claim_for_packing(&self) -> bool {
        let mut state = self.lock();
        if state.in_progress || state.packed {
            return false;
        }
        state.packed = true;
        true
    }

    /// Lowers the root's count of tracked subsegments after part of the tree left memory.
    pub(crate) fn release_descendants(self: &Arc<Self>, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(root) = self.root_node() {
            let mut state = root.lock();
            state.total_sub_segments = state.total_sub_segments.saturating_sub(count);
        }
    }
}

fn spawn_cancellation_watcher(node: &Arc<SegmentNode>, cancel: CancellationToken) {
    let Some(finished) = node.finished.clone() else {
        return;
    };
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!(
            "No tokio runtime available, cancellation of segment {} will not be observed",
            node.name
        );
        return;
    };

    // The watcher keeps the tree alive until it is emitted or its request is cancelled.
    let node = Arc::clone(node);
    runtime.spawn(async move {
        tokio::select! {
            biased;
            () = finished.cancelled() => {}
            () = cancel.cancelled() => node.on_cancelled(),
        }
    });
}

pub(crate) fn begin_root(
    tracer: &Arc<RecorderInner>,
    name: &str,
    origin: RootOrigin,
    cancel: CancellationToken,
) -> Segment {
    let name = truncate_name(name);
    trace!("Beginning segment named {name}");

    let mut state = SegmentState {
        start_time: epoch_seconds(),
        in_progress: true,
        parent_id: origin.parent_id,
        request_was_traced: origin.trace_id.is_some(),
        ..SegmentState::default()
    };
    if let Some(plugins) = &tracer.config.plugin_metadata {
        let aws = plugins.aws_fields();
        if !aws.is_empty() {
            state.aws = Some(aws);
        }
    }
    if let Some(version) = &tracer.config.service_version {
        state.service = Some(ServiceData {
            version: version.clone(),
        });
    }

    let node = Arc::new(SegmentNode {
        id: new_segment_id(),
        trace_id: origin.trace_id.unwrap_or_else(new_trace_id),
        name,
        sampled: origin.sampled,
        parent: None,
        root: None,
        tracer: Some(Arc::clone(tracer)),
        finished: Some(CancellationToken::new()),
        state: Mutex::new(state),
    });
    spawn_cancellation_watcher(&node, cancel);

    Segment { node }
}

/// Creates a child under `parent`, or returns `None` if the tree is no longer live or `parent`
/// has already completed.
pub(crate) fn begin_child(parent: &Segment, name: &str) -> Option<Segment> {
    let parent = &parent.node;
    let root = parent.root_node()?;
    {
        let mut root_state = root.lock();
        if root_state.flushed {
            return None;
        }
        root_state.total_sub_segments += 1;
    }

    let name = truncate_name(name);
    trace!("Beginning subsegment named {name}");

    let child = Arc::new(SegmentNode {
        id: new_segment_id(),
        trace_id: parent.trace_id.clone(),
        name,
        sampled: parent.sampled,
        parent: Some(Arc::downgrade(parent)),
        root: Some(Arc::downgrade(&root)),
        tracer: None,
        finished: None,
        state: Mutex::new(SegmentState {
            start_time: epoch_seconds(),
            in_progress: true,
            ..SegmentState::default()
        }),
    });

    {
        let mut parent_state = parent.lock();
        // A parent that already reported completion (or a root already emitted) would never
        // wait for the new child.
        if parent_state.flushed {
            drop(parent_state);
            parent.release_descendants(1);
            debug!(
                "Parent {} already completed, not beginning subsegment {}",
                parent.name, child.name
            );
            return None;
        }
        parent_state.raw_subsegments.push(ChildSlot {
            node: Arc::clone(&child),
            open: true,
        });
        parent_state.open_segments += 1;
    }

    Some(Segment { node: child })
}

/// Handle to a segment or subsegment. Cloning is cheap and every clone refers to the same node.
#[derive(Clone)]
pub struct Segment {
    node: Arc<SegmentNode>,
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.node.name)
            .field("id", &self.node.id)
            .field("trace_id", &self.node.trace_id)
            .finish_non_exhaustive()
    }
}

impl Segment {
    pub(crate) fn from_node(node: Arc<SegmentNode>) -> Self {
        Self { node }
    }

    #[cfg(test)]
    pub(crate) fn node(&self) -> &Arc<SegmentNode> {
        &self.node
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.node.id
    }

    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.node.trace_id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.node.name
    }

    #[must_use]
    pub fn sampled(&self) -> bool {
        self.node.sampled
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.node.is_root()
    }

    #[must_use]
    pub fn parent_id(&self) -> Option<String> {
        self.node.lock().parent_id.clone()
    }

    /// Whether the inbound trace header of this root named an existing trace.
    #[must_use]
    pub fn request_was_traced(&self) -> bool {
        self.node
            .root_node()
            .is_some_and(|root| root.lock().request_was_traced)
    }

    #[must_use]
    pub fn start_time(&self) -> f64 {
        self.node.lock().start_time
    }

    #[must_use]
    pub fn end_time(&self) -> Option<f64> {
        self.node.lock().end_time
    }

    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.node.in_progress()
    }

    #[must_use]
    pub fn context_done(&self) -> bool {
        self.node
            .root_node()
            .is_some_and(|root| root.lock().context_done)
    }

    /// Whether the tree this segment belongs to has been handed to the emitter.
    #[must_use]
    pub fn emitted(&self) -> bool {
        self.node.root_node().is_some_and(|root| root.lock().flushed)
    }

    /// Direct children that have neither completed nor been removed.
    #[must_use]
    pub fn open_segments(&self) -> usize {
        self.node.lock().open_segments
    }

    /// Subsegments currently tracked by this segment's tree.
    #[must_use]
    pub fn total_sub_segments(&self) -> usize {
        self.node
            .root_node()
            .map_or(0, |root| root.lock().total_sub_segments)
    }

    /// Direct children still buffered in memory.
    #[must_use]
    pub fn buffered_subsegments(&self) -> usize {
        self.node.lock().raw_subsegments.len()
    }

    #[must_use]
    pub fn annotations(&self) -> HashMap<String, AnnotationValue> {
        self.node.lock().annotations.clone().unwrap_or_default()
    }

    #[must_use]
    pub fn metadata(&self, namespace: &str, key: &str) -> Option<Value> {
        self.node
            .lock()
            .metadata
            .as_ref()
            .and_then(|m| m.get(namespace))
            .and_then(|ns| ns.get(key))
            .cloned()
    }

    #[must_use]
    pub fn fault(&self) -> bool {
        self.node.lock().fault
    }

    #[must_use]
    pub fn error(&self) -> bool {
        self.node.lock().error
    }

    #[must_use]
    pub fn throttle(&self) -> bool {
        self.node.lock().throttle
    }

    #[must_use]
    pub fn cause(&self) -> Option<CauseData> {
        self.node.lock().cause.clone()
    }

    /// Adds an indexed annotation. Only booleans, numbers and strings are accepted; anything
    /// else is rejected and leaves the segment untouched.
    pub fn add_annotation(&self, key: &str, value: impl Into<Value>) -> Result<(), TraceError> {
        let value = AnnotationValue::try_from(value.into()).map_err(|rejected| {
            TraceError::InvalidAnnotation {
                key: key.to_string(),
                value: rejected.to_string(),
                segment: self.node.name.clone(),
            }
        })?;

        self.node
            .lock()
            .annotations
            .get_or_insert_with(HashMap::new)
            .insert(key.to_string(), value);
        Ok(())
    }

    pub fn add_metadata(&self, key: &str, value: impl Serialize) -> Result<(), TraceError> {
        self.add_metadata_to_namespace(DEFAULT_METADATA_NAMESPACE, key, value)
    }

    pub fn add_metadata_to_namespace(
        &self,
        namespace: &str,
        key: &str,
        value: impl Serialize,
    ) -> Result<(), TraceError> {
        let value = serde_json::to_value(value).map_err(|source| TraceError::Metadata {
            key: key.to_string(),
            segment: self.node.name.clone(),
            source,
        })?;

        self.node
            .lock()
            .metadata
            .get_or_insert_with(HashMap::new)
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    /// Marks the segment as faulted and records `err` (and its sources) as the cause.
    pub fn add_error(&self, err: &(dyn Error + 'static)) {
        let mut state = self.node.lock();
        state.fault = true;
        state.cause.get_or_insert_with(CauseData::new).record(err);
    }

    pub fn set_namespace(&self, namespace: &str) {
        self.node.lock().namespace = Some(namespace.to_string());
    }

    pub fn set_http_request(&self, request: HttpRequestData) {
        self.node
            .lock()
            .http
            .get_or_insert_with(HttpData::default)
            .request = Some(request);
    }

    /// Records the response and derives the error flags: 4xx is an error, 429 is also a
    /// throttle, 5xx is a fault.
    pub fn set_http_response(&self, status: u16, content_length: Option<u64>) {
        let mut state = self.node.lock();
        state.http.get_or_insert_with(HttpData::default).response = Some(HttpResponseData {
            status,
            content_length,
        });
        if (400..500).contains(&status) {
            state.error = true;
        }
        if status == 429 {
            state.throttle = true;
        }
        if (500..600).contains(&status) {
            state.fault = true;
        }
    }

    /// Ends the segment, recording `error` as a fault if given, and flushes whatever became
    /// ready. Closing an already closed segment does nothing.
    pub fn close(&self, error: Option<&(dyn Error + 'static)>) {
        {
            let mut state = self.node.lock();
            if !state.in_progress {
                debug!("Segment {} is already closed", self.node.name);
                return;
            }
            state.end_time = Some(epoch_seconds());
            state.in_progress = false;
            if let Some(err) = error {
                state.fault = true;
                state.cause.get_or_insert_with(CauseData::new).record(err);
            }
        }

        if self.node.is_root() {
            trace!("Closing segment named {}", self.node.name);
        } else {
            trace!("Closing subsegment named {}", self.node.name);
        }
        self.node.flush(None);
    }

    /// The trace header to propagate on a call made from inside this segment: this trace, this
    /// segment as the parent, and the tree's sampling decision.
    #[must_use]
    pub fn downstream_header(&self) -> TraceHeader {
        TraceHeader {
            trace_id: Some(self.node.trace_id.clone()),
            parent_id: Some(self.node.id.clone()),
            sampling_decision: if self.node.sampled {
                SamplingDecision::Sampled
            } else {
                SamplingDecision::NotSampled
            },
            additional_data: Vec::new(),
        }
    }

    /// Detaches `child` from this segment's buffered children. Returns false, leaving all
    /// counters untouched, if it is not a buffered child of this segment.
    pub fn remove_subsegment(&self, child: &Segment) -> bool {
        self.node.remove_child(&child.node)
    }
}
