// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types surfaced to instrumented code.
//!
//! Only the caller-facing operations return errors: configuration, beginning a subsegment
//! without a live parent, and the annotation/metadata writers. Everything downstream of
//! `close` (packing, streaming, emission) logs and moves on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceError {
    /// The tracer cannot be configured, e.g. the daemon address does not resolve.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A subsegment was begun with no live segment to attach to.
    #[error("{0}")]
    ContextMissing(String),

    /// An annotation value was not a boolean, number or string.
    #[error(
        "failed to add annotation key: {key:?} value: {value} to subsegment {segment:?}. value must be of type string, number or boolean"
    )]
    InvalidAnnotation {
        key: String,
        value: String,
        segment: String,
    },

    /// A metadata value could not be converted to JSON.
    #[error("failed to add metadata key: {key:?} to segment {segment:?}: {source}")]
    Metadata {
        key: String,
        segment: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = TraceError::Config("bad daemon address".to_string());
        assert_eq!(
            error.to_string(),
            "invalid configuration: bad daemon address"
        );
    }

    #[test]
    fn test_invalid_annotation_names_key_value_and_segment() {
        let error = TraceError::InvalidAnnotation {
            key: "payload".to_string(),
            value: "[1,2]".to_string(),
            segment: "svc-A".to_string(),
        };
        let message = error.to_string();
        assert!(message.contains("\"payload\""));
        assert!(message.contains("[1,2]"));
        assert!(message.contains("\"svc-A\""));
    }
}
