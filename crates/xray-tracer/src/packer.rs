// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Serialization of segment trees into the JSON documents sent to the daemon.
//!
//! A tree is normally sent as a single document with its subsegments embedded. When the
//! streaming strategy says a tree has grown too large, completed subsegments are detached from
//! the tree and serialized as standalone documents that carry the trace id and the id of the
//! parent they were detached from. Blocks for descendants always precede their ancestors.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

use crate::annotation::AnnotationValue;
use crate::cause::CauseData;
use crate::http::HttpData;
use crate::segment::{Segment, SegmentNode, ServiceData};
use crate::streaming::StreamingStrategy;

const SUBSEGMENT_TYPE: &str = "subsegment";

fn is_false(b: &bool) -> bool {
    !*b
}

/// One segment document as the daemon expects it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub name: String,
    pub id: String,
    /// Present on roots and standalone subsegments only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub start_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub in_progress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub fault: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub throttle: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<CauseData>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, AnnotationValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, HashMap<String, Value>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpData>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subsegments: Vec<SegmentRecord>,
}

impl SegmentRecord {
    /// Number of subsegments embedded anywhere below this record.
    #[must_use]
    pub fn descendants(&self) -> usize {
        self.subsegments.iter().map(|s| 1 + s.descendants()).sum()
    }
}

#[derive(Clone, Copy)]
enum Placement<'a> {
    Root,
    Embedded,
    Standalone { parent_id: &'a str },
}

fn serialize(record: &SegmentRecord) -> Option<Vec<u8>> {
    match serde_json::to_vec(record) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!("Failed to serialize segment {}: {}", record.name, e);
            None
        }
    }
}

/// Packs a root and everything still buffered under it. The root's block is last.
pub(crate) fn pack(root: &Arc<SegmentNode>, strategy: &dyn StreamingStrategy) -> Vec<Vec<u8>> {
    let mut blocks = Vec::new();
    let record = pack_node(root, strategy, &mut blocks, Placement::Root);
    if let Some(bytes) = serialize(&record) {
        blocks.push(bytes);
    }
    blocks
}

/// Detaches `child` from `parent` and packs it as a standalone document, preceded by any of its
/// own children that had to be streamed. Returns nothing if `child` was already detached or
/// already packed elsewhere.
pub(crate) fn stream_subsegment(
    parent: &Arc<SegmentNode>,
    child: &Arc<SegmentNode>,
    strategy: &dyn StreamingStrategy,
) -> Vec<Vec<u8>> {
    let mut blocks = Vec::new();
    stream_child(parent, child, strategy, &mut blocks);
    blocks
}

fn stream_child(
    parent: &Arc<SegmentNode>,
    child: &Arc<SegmentNode>,
    strategy: &dyn StreamingStrategy,
    blocks: &mut Vec<Vec<u8>>,
) -> bool {
    if !parent.remove_child(child) {
        return false;
    }
    // A concurrent emission of the whole tree may have embedded it already.
    if !child.claim_for_packing() {
        return false;
    }

    let record = pack_node(
        child,
        strategy,
        blocks,
        Placement::Standalone {
            parent_id: &parent.id,
        },
    );
    // Everything embedded in the record leaves memory with it.
    child.release_descendants(record.descendants());
    if let Some(bytes) = serialize(&record) {
        blocks.push(bytes);
    }
    true
}

/// Streams completed children for as long as the strategy asks for it.
fn stream_completed_children(
    node: &Arc<SegmentNode>,
    strategy: &dyn StreamingStrategy,
    blocks: &mut Vec<Vec<u8>>,
) {
    while strategy.requires_streaming(&Segment::from_node(Arc::clone(node))) {
        let completed: Vec<Arc<SegmentNode>> = node
            .lock()
            .raw_subsegments
            .iter()
            .filter(|slot| !slot.open)
            .map(|slot| Arc::clone(&slot.node))
            .collect();

        let mut streamed = 0;
        for child in &completed {
            if stream_child(node, child, strategy, blocks) {
                streamed += 1;
            }
        }
        if streamed == 0 {
            break;
        }
        debug!("Streamed {} completed subsegment(s) of {}", streamed, node.name);
    }
}

fn pack_node(
    node: &Arc<SegmentNode>,
    strategy: &dyn StreamingStrategy,
    blocks: &mut Vec<Vec<u8>>,
    placement: Placement<'_>,
) -> SegmentRecord {
    stream_completed_children(node, strategy, blocks);

    let children: Vec<Arc<SegmentNode>> = node
        .lock()
        .raw_subsegments
        .iter()
        .map(|slot| Arc::clone(&slot.node))
        .collect();
    // Subsegments still running are left out; they can only be present after cancellation.
    let subsegments = children
        .iter()
        .filter(|child| child.claim_for_packing())
        .map(|child| pack_node(child, strategy, blocks, Placement::Embedded))
        .collect();

    let state = node.lock();
    let mut record = SegmentRecord {
        name: node.name.clone(),
        id: node.id.clone(),
        start_time: state.start_time,
        end_time: state.end_time,
        in_progress: state.in_progress,
        namespace: state.namespace.clone(),
        error: state.error,
        fault: state.fault,
        throttle: state.throttle,
        cause: state.cause.clone(),
        annotations: state.annotations.clone(),
        metadata: state.metadata.clone(),
        http: state.http.clone(),
        subsegments,
        ..SegmentRecord::default()
    };

    match placement {
        Placement::Root => {
            record.trace_id = Some(node.trace_id.clone());
            record.parent_id = state.parent_id.clone();
            record.aws = state.aws.clone();
            record.service = state.service.clone();
        }
        Placement::Embedded => {}
        Placement::Standalone { parent_id } => {
            record.trace_id = Some(node.trace_id.clone());
            record.kind = Some(SUBSEGMENT_TYPE.to_string());
            record.parent_id = Some(parent_id.to_string());
        }
    }

    record
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::plugins::PluginMetadata;
    use crate::recorder::Recorder;
    use crate::segment::tests::sent;
    use crate::streaming::DefaultStreamingStrategy;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn parse(block: &[u8]) -> SegmentRecord {
        serde_json::from_slice(block).unwrap()
    }

    #[test]
    fn test_pack_embeds_subsegments() {
        let (recorder, _rx) = Recorder::detached(Config::default());
        let root = recorder.begin_segment("svc-A", CancellationToken::new());
        let child = recorder
            .begin_subsegment(Some(&root), "db-call")
            .unwrap()
            .unwrap();
        child.set_namespace("remote");
        child.add_annotation("table", "colors").unwrap();
        child.close(None);

        let blocks = pack(root.node(), &DefaultStreamingStrategy::default());
        assert_eq!(blocks.len(), 1);

        let record = parse(&blocks[0]);
        assert_eq!(record.trace_id.as_deref(), Some(root.trace_id()));
        assert_eq!(record.kind, None);
        assert!(record.in_progress);
        assert_eq!(record.descendants(), 1);

        let embedded = &record.subsegments[0];
        assert_eq!(embedded.name, "db-call");
        assert_eq!(embedded.trace_id, None);
        assert_eq!(embedded.parent_id, None);
        assert_eq!(embedded.namespace.as_deref(), Some("remote"));
        assert!(!embedded.in_progress);
        assert!(embedded.end_time.is_some());
    }

    #[test]
    fn test_pack_omits_running_subsegments() {
        let (recorder, _rx) = Recorder::detached(Config::default());
        let root = recorder.begin_segment("svc-A", CancellationToken::new());
        let done = recorder.begin_subsegment(Some(&root), "done").unwrap().unwrap();
        let _running = recorder
            .begin_subsegment(Some(&root), "running")
            .unwrap()
            .unwrap();
        done.close(None);

        let record = parse(&pack(root.node(), &DefaultStreamingStrategy::default())[0]);
        assert_eq!(record.subsegments.len(), 1);
        assert_eq!(record.subsegments[0].name, "done");
    }

    #[test]
    fn test_stream_subsegment_standalone_record() {
        let (recorder, _rx) = Recorder::detached(Config::default());
        let root = recorder.begin_segment("svc-A", CancellationToken::new());
        let child = recorder
            .begin_subsegment(Some(&root), "child")
            .unwrap()
            .unwrap();
        let grandchild = recorder
            .begin_subsegment(Some(&child), "grandchild")
            .unwrap()
            .unwrap();
        grandchild.close(None);
        child.close(None);
        assert_eq!(root.total_sub_segments(), 2);

        let blocks = stream_subsegment(
            root.node(),
            child.node(),
            &DefaultStreamingStrategy::default(),
        );
        assert_eq!(blocks.len(), 1);
        let record = parse(&blocks[0]);
        assert_eq!(record.kind.as_deref(), Some("subsegment"));
        assert_eq!(record.trace_id.as_deref(), Some(root.trace_id()));
        assert_eq!(record.parent_id.as_deref(), Some(root.id()));
        assert_eq!(record.subsegments[0].name, "grandchild");

        assert_eq!(root.total_sub_segments(), 0);
        assert_eq!(root.buffered_subsegments(), 0);

        // already detached
        let again = stream_subsegment(
            root.node(),
            child.node(),
            &DefaultStreamingStrategy::default(),
        );
        assert!(again.is_empty());
        assert_eq!(root.total_sub_segments(), 0);
    }

    #[test]
    fn test_pack_streams_before_root() {
        let (recorder, _rx) = Recorder::detached(Config::default());
        let root = recorder.begin_segment("svc-A", CancellationToken::new());
        let open = recorder.begin_subsegment(Some(&root), "open").unwrap().unwrap();
        for i in 0..3 {
            recorder
                .begin_subsegment(Some(&root), &format!("done-{i}"))
                .unwrap()
                .unwrap()
                .close(None);
        }
        open.add_metadata("note", json!("still running")).unwrap();

        let blocks = pack(root.node(), &DefaultStreamingStrategy::new(1));
        assert_eq!(blocks.len(), 4);
        for block in &blocks[..3] {
            let record = parse(block);
            assert_eq!(record.kind.as_deref(), Some("subsegment"));
            assert!(record.name.starts_with("done-"));
        }
        let root_record = parse(&blocks[3]);
        assert_eq!(root_record.id, root.id());
        // running subsegments are never streamed
        assert_eq!(root.buffered_subsegments(), 1);
        assert_eq!(root.total_sub_segments(), 1);
    }

    #[test]
    fn test_subsegment_is_packed_into_one_document_only() {
        let (recorder, _rx) = Recorder::detached(Config::default());
        let root = recorder.begin_segment("svc-A", CancellationToken::new());
        let child = recorder
            .begin_subsegment(Some(&root), "child")
            .unwrap()
            .unwrap();
        child.close(None);

        // the whole tree is packed first, then a stream of the same child races in
        let record = parse(&pack(root.node(), &DefaultStreamingStrategy::default())[0]);
        assert_eq!(record.subsegments.len(), 1);
        let streamed = stream_subsegment(
            root.node(),
            child.node(),
            &DefaultStreamingStrategy::default(),
        );
        assert!(streamed.is_empty());
    }

    #[test]
    fn test_root_record_carries_aws_and_service() {
        let (recorder, mut rx) = Recorder::detached(Config {
            service_version: Some("1.2.3".to_string()),
            plugin_metadata: Some(PluginMetadata {
                ecs_container_name: Some("colorteller".to_string()),
                ..PluginMetadata::default()
            }),
            ..Config::default()
        });
        let root = recorder.begin_segment("svc-A", CancellationToken::new());
        let child = recorder
            .begin_subsegment(Some(&root), "child")
            .unwrap()
            .unwrap();
        child.close(None);
        root.close(None);

        let value = sent(&mut rx).remove(0).remove(0);
        assert_eq!(value["aws"]["container"], "colorteller");
        assert_eq!(value["service"]["version"], "1.2.3");
        assert!(value["subsegments"][0].get("aws").is_none());
        assert!(value.get("in_progress").is_none());
        assert!(value.get("type").is_none());
    }
}
