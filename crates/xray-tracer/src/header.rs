// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace context carried on the `X-Amzn-Trace-Id` header.
//!
//! The header is a list of `Key=Value` fields separated by semicolons:
//!
//! ```text
//! X-Amzn-Trace-Id: Root=1-5759e988-bd862e3fe1be46a994272793;Parent=53995c3f42cd8ad8;Sampled=1
//! ```
//!
//! `Root` becomes the trace id of the segment created for the request, `Parent` its parent id,
//! and `Sampled` carries (`0`/`1`) or requests (`?`) the sampling decision.

use std::fmt;

/// Name of the trace header, lowercase for HTTP/2 compatibility.
pub const TRACE_ID_HEADER: &str = "x-amzn-trace-id";

const ROOT_KEY: &str = "Root";
const PARENT_KEY: &str = "Parent";
const SAMPLED_KEY: &str = "Sampled";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SamplingDecision {
    /// `Sampled=1`
    Sampled,
    /// `Sampled=0`
    NotSampled,
    /// `Sampled=?`, the caller asks to be told the decision.
    Requested,
    /// No (or an unrecognised) `Sampled` field.
    #[default]
    Unknown,
}

impl SamplingDecision {
    fn parse(value: &str) -> Self {
        match value {
            "1" => Self::Sampled,
            "0" => Self::NotSampled,
            "?" => Self::Requested,
            _ => Self::Unknown,
        }
    }

    fn as_header_value(self) -> Option<&'static str> {
        match self {
            Self::Sampled => Some("1"),
            Self::NotSampled => Some("0"),
            Self::Requested => Some("?"),
            Self::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceHeader {
    pub trace_id: Option<String>,
    pub parent_id: Option<String>,
    pub sampling_decision: SamplingDecision,
    /// Fields other than Root/Parent/Sampled, kept in order.
    pub additional_data: Vec<(String, String)>,
}

impl TraceHeader {
    /// Parses a header value. Malformed fields are skipped rather than rejected since a bad
    /// header must never fail the request it arrived on.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let mut header = Self::default();

        for field in value.split(';') {
            let (key, val) = match field.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (field.trim(), ""),
            };
            if key.is_empty() {
                continue;
            }

            match key {
                ROOT_KEY if !val.is_empty() => header.trace_id = Some(val.to_string()),
                PARENT_KEY if !val.is_empty() => header.parent_id = Some(val.to_string()),
                SAMPLED_KEY => header.sampling_decision = SamplingDecision::parse(val),
                ROOT_KEY | PARENT_KEY => {}
                _ => header
                    .additional_data
                    .push((key.to_string(), val.to_string())),
            }
        }

        header
    }
}

impl fmt::Display for TraceHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields: Vec<String> = Vec::new();
        if let Some(root) = &self.trace_id {
            fields.push(format!("{ROOT_KEY}={root}"));
        }
        if let Some(parent) = &self.parent_id {
            fields.push(format!("{PARENT_KEY}={parent}"));
        }
        if let Some(sampled) = self.sampling_decision.as_header_value() {
            fields.push(format!("{SAMPLED_KEY}={sampled}"));
        }
        for (k, v) in &self.additional_data {
            fields.push(format!("{k}={v}"));
        }
        write!(f, "{}", fields.join(";"))
    }
}

/// Builds the value echoed back on the response: the trace root, plus the sampling decision
/// only when the inbound header asked for it with `Sampled=?`.
#[must_use]
pub fn response_header(trace_id: &str, inbound: SamplingDecision, sampled: bool) -> String {
    let mut value = format!("{ROOT_KEY}={trace_id}");
    if inbound == SamplingDecision::Requested {
        value.push_str(&format!(";{SAMPLED_KEY}={}", u8::from(sampled)));
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_header() {
        let header = TraceHeader::parse(
            "Root=1-5759e988-bd862e3fe1be46a994272793;Parent=53995c3f42cd8ad8;Sampled=1",
        );
        assert_eq!(
            header.trace_id.as_deref(),
            Some("1-5759e988-bd862e3fe1be46a994272793")
        );
        assert_eq!(header.parent_id.as_deref(), Some("53995c3f42cd8ad8"));
        assert_eq!(header.sampling_decision, SamplingDecision::Sampled);
        assert!(header.additional_data.is_empty());
    }

    #[test]
    fn test_parse_tolerates_whitespace_and_extra_fields() {
        let header = TraceHeader::parse(" Root = 1-abc ; Sampled=? ;Lineage=a:1;;junk");
        assert_eq!(header.trace_id.as_deref(), Some("1-abc"));
        assert_eq!(header.parent_id, None);
        assert_eq!(header.sampling_decision, SamplingDecision::Requested);
        assert_eq!(
            header.additional_data,
            vec![
                ("Lineage".to_string(), "a:1".to_string()),
                ("junk".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_parse_empty_and_unknown_sampled() {
        let header = TraceHeader::parse("");
        assert_eq!(header, TraceHeader::default());

        let header = TraceHeader::parse("Root=;Sampled=maybe");
        assert_eq!(header.trace_id, None);
        assert_eq!(header.sampling_decision, SamplingDecision::Unknown);
    }

    #[test]
    fn test_display() {
        let header = TraceHeader {
            trace_id: Some("1-abc".to_string()),
            parent_id: Some("def".to_string()),
            sampling_decision: SamplingDecision::NotSampled,
            additional_data: vec![("Self".to_string(), "x".to_string())],
        };
        assert_eq!(header.to_string(), "Root=1-abc;Parent=def;Sampled=0;Self=x");
    }

    #[test]
    fn test_response_header_echoes_decision_only_when_requested() {
        assert_eq!(
            response_header("1-abc", SamplingDecision::Requested, true),
            "Root=1-abc;Sampled=1"
        );
        assert_eq!(
            response_header("1-abc", SamplingDecision::Requested, false),
            "Root=1-abc;Sampled=0"
        );
        assert_eq!(
            response_header("1-abc", SamplingDecision::Sampled, true),
            "Root=1-abc"
        );
        assert_eq!(
            response_header("1-abc", SamplingDecision::Unknown, false),
            "Root=1-abc"
        );
    }
}
