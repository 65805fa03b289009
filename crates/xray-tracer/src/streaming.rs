// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Policy deciding when completed subsegments are sent ahead of their root.
//!
//! Whenever the strategy reports that a tree requires streaming, the packer serializes the
//! already-closed children of the node being packed as standalone documents (each carrying the
//! trace id and its parent's id so the daemon can stitch the tree back together), sends them,
//! and drops them from the tree. This bounds both the memory held by very wide trees and the size
//! of any single datagram.

use std::fmt::Debug;

use crate::segment::Segment;

pub const DEFAULT_MAX_SUBSEGMENT_COUNT: usize = 20;

pub trait StreamingStrategy: Debug + Send + Sync {
    /// Called without any segment lock held.
    fn requires_streaming(&self, segment: &Segment) -> bool;
}

/// Streams once a sampled tree tracks more than `max_subsegment_count` subsegments.
#[derive(Debug, Clone, Copy)]
pub struct DefaultStreamingStrategy {
    max_subsegment_count: usize,
}

impl DefaultStreamingStrategy {
    #[must_use]
    pub fn new(max_subsegment_count: usize) -> Self {
        Self {
            max_subsegment_count,
        }
    }

    #[must_use]
    pub fn max_subsegment_count(&self) -> usize {
        self.max_subsegment_count
    }
}

impl Default for DefaultStreamingStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SUBSEGMENT_COUNT)
    }
}

impl StreamingStrategy for DefaultStreamingStrategy {
    fn requires_streaming(&self, segment: &Segment) -> bool {
        segment.sampled() && segment.total_sub_segments() > self.max_subsegment_count
    }
}
