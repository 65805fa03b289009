// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracing of outbound HTTP calls.
//!
//! A [`ClientCall`] is a subsegment covering one request made to a downstream service. The HTTP
//! client reports the phases of the round trip as they happen and each phase becomes a child of
//! the call:
//!
//! ```text
//! svc-B                  (the call, namespace "remote")
//! ├── connect
//! │   ├── dns
//! │   ├── dial
//! │   └── tls
//! ├── request
//! └── response
//! ```
//!
//! Phase events arriving after the call has been closed are ignored. A reused connection has no
//! `connect` phase worth reporting, so its subsegment is removed from the call.

use serde_json::json;
use std::error::Error;
use tracing::debug;

use crate::header::TraceHeader;
use crate::http::HttpRequestData;
use crate::segment::{self, Segment};

const REMOTE_NAMESPACE: &str = "remote";
const HTTP_METADATA_NAMESPACE: &str = "http";

/// One traced outbound HTTP call and the subsegments of its current phases.
#[derive(Debug)]
pub struct ClientCall {
    op: Segment,
    connect: Option<Segment>,
    dns: Option<Segment>,
    dial: Option<Segment>,
    tls: Option<Segment>,
    request: Option<Segment>,
    response: Option<Segment>,
}

impl ClientCall {
    pub(crate) fn new(op: Segment, request: HttpRequestData) -> Self {
        op.set_namespace(REMOTE_NAMESPACE);
        op.set_http_request(request);
        Self {
            op,
            connect: None,
            dns: None,
            dial: None,
            tls: None,
            request: None,
            response: None,
        }
    }

    /// The subsegment covering the whole call.
    #[must_use]
    pub fn segment(&self) -> &Segment {
        &self.op
    }

    /// Header to send with the outbound request so the downstream service continues this trace
    /// with the call as its parent.
    #[must_use]
    pub fn trace_header(&self) -> TraceHeader {
        self.op.downstream_header()
    }

    fn active(&self) -> bool {
        self.op.in_progress()
    }

    fn begin_phase(parent: &Segment, name: &str) -> Option<Segment> {
        let phase = segment::begin_child(parent, name);
        if phase.is_none() {
            debug!("Not tracing {} phase of {}", name, parent.name());
        }
        phase
    }

    fn end_phase(
        phase: Option<Segment>,
        key: &str,
        metadata: serde_json::Value,
        err: Option<&(dyn Error + 'static)>,
    ) {
        if let Some(phase) = phase {
            if let Err(e) = phase.add_metadata_to_namespace(HTTP_METADATA_NAMESPACE, key, metadata)
            {
                debug!("{}", e);
            }
            phase.close(err);
        }
    }

    /// A connection is being obtained, either new or from the pool.
    pub fn get_conn(&mut self) {
        if self.active() {
            self.connect = Self::begin_phase(&self.op, "connect");
        }
    }

    pub fn dns_start(&mut self) {
        if !self.active() {
            return;
        }
        if let Some(connect) = &self.connect {
            self.dns = Self::begin_phase(connect, "dns");
        }
    }

    pub fn dns_done(
        &mut self,
        addresses: &[String],
        coalesced: bool,
        err: Option<&(dyn Error + 'static)>,
    ) {
        if self.active() {
            Self::end_phase(
                self.dns.take(),
                "dns",
                json!({ "addresses": addresses, "coalesced": coalesced }),
                err,
            );
        }
    }

    pub fn connect_start(&mut self) {
        if !self.active() {
            return;
        }
        if let Some(connect) = &self.connect {
            self.dial = Self::begin_phase(connect, "dial");
        }
    }

    pub fn connect_done(&mut self, network: &str, err: Option<&(dyn Error + 'static)>) {
        if self.active() {
            Self::end_phase(
                self.dial.take(),
                "connect",
                json!({ "network": network }),
                err,
            );
        }
    }

    pub fn tls_handshake_start(&mut self) {
        if !self.active() {
            return;
        }
        if let Some(connect) = &self.connect {
            self.tls = Self::begin_phase(connect, "tls");
        }
    }

    pub fn tls_handshake_done(
        &mut self,
        did_resume: bool,
        negotiated_protocol: Option<&str>,
        err: Option<&(dyn Error + 'static)>,
    ) {
        if self.active() {
            Self::end_phase(
                self.tls.take(),
                "tls",
                json!({
                    "did_resume": did_resume,
                    "negotiated_protocol": negotiated_protocol.unwrap_or_default(),
                }),
                err,
            );
        }
    }

    /// A connection was obtained. A reused connection drops the `connect` phase; otherwise it is
    /// closed with the connection details. Without an error the `request` phase begins.
    pub fn got_conn(&mut self, reused: bool, was_idle: bool, err: Option<&(dyn Error + 'static)>) {
        if !self.active() {
            return;
        }
        if let Some(connect) = self.connect.take() {
            if reused {
                self.op.remove_subsegment(&connect);
            } else {
                Self::end_phase(
                    Some(connect),
                    "connection",
                    json!({ "reused": reused, "was_idle": was_idle }),
                    err,
                );
            }
        }
        if err.is_none() {
            self.request = Self::begin_phase(&self.op, "request");
        }
    }

    /// The request was written; the `response` phase begins.
    pub fn wrote_request(&mut self, err: Option<&(dyn Error + 'static)>) {
        if !self.active() {
            return;
        }
        if let Some(request) = self.request.take() {
            request.close(err);
            self.response = Self::begin_phase(&self.op, "response");
        }
    }

    pub fn got_first_response_byte(&mut self) {
        if !self.active() {
            return;
        }
        if let Some(response) = self.response.take() {
            response.close(None);
        }
    }

    /// Records the downstream response and closes the call. Phases that never completed are
    /// closed with it.
    pub fn finish(
        mut self,
        status: Option<u16>,
        content_length: Option<u64>,
        err: Option<&(dyn Error + 'static)>,
    ) {
        for phase in [
            self.dns.take(),
            self.dial.take(),
            self.tls.take(),
            self.connect.take(),
            self.request.take(),
            self.response.take(),
        ]
        .into_iter()
        .flatten()
        {
            phase.close(None);
        }
        if let Some(status) = status {
            self.op.set_http_response(status, content_length);
        }
        self.op.close(err);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use crate::config::Config;
    use crate::recorder::Recorder;
    use crate::segment::tests::sent;
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn request() -> HttpRequestData {
        HttpRequestData {
            method: Some("GET".to_string()),
            url: Some("http://colorteller.local:8080/".to_string()),
            ..HttpRequestData::default()
        }
    }

    fn names(record: &Value) -> Vec<&str> {
        record["subsegments"]
            .as_array()
            .map(|subs| subs.iter().map(|s| s["name"].as_str().unwrap()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_call_phases_become_subsegments() {
        let (recorder, mut rx) = Recorder::detached(Config::default());
        let root = recorder.begin_segment("gateway", CancellationToken::new());
        let mut call = recorder
            .begin_client_call(Some(&root), "colorteller.local", request())
            .unwrap()
            .unwrap();
        assert_eq!(
            call.trace_header().to_string(),
            format!(
                "Root={};Parent={};Sampled=1",
                root.trace_id(),
                call.segment().id()
            )
        );

        call.get_conn();
        call.dns_start();
        call.dns_done(&["10.0.0.8".to_string()], false, None);
        call.connect_start();
        call.connect_done("tcp", None);
        call.got_conn(false, false, None);
        call.wrote_request(None);
        call.got_first_response_byte();
        call.finish(Some(200), Some(4), None);
        root.close(None);

        let sends = sent(&mut rx);
        assert_eq!(sends.len(), 1);
        let op = &sends[0][0]["subsegments"][0];
        assert_eq!(op["name"], "colorteller.local");
        assert_eq!(op["namespace"], "remote");
        assert_eq!(op["http"]["request"]["method"], "GET");
        assert_eq!(op["http"]["response"]["status"], 200);

        let mut phases = names(op);
        phases.sort_unstable();
        assert_eq!(phases, vec!["connect", "request", "response"]);

        let connect = op["subsegments"]
            .as_array()
            .unwrap()
            .iter()
            .find(|s| s["name"] == "connect")
            .unwrap();
        let mut connect_phases = names(connect);
        connect_phases.sort_unstable();
        assert_eq!(connect_phases, vec!["dial", "dns"]);
        assert_eq!(connect["metadata"]["http"]["connection"]["reused"], false);
    }

    #[test]
    fn test_reused_connection_drops_connect_phase() {
        let (recorder, mut rx) = Recorder::detached(Config::default());
        let root = recorder.begin_segment("gateway", CancellationToken::new());
        let mut call = recorder
            .begin_client_call(Some(&root), "colorteller.local", request())
            .unwrap()
            .unwrap();

        call.get_conn();
        call.got_conn(true, true, None);
        assert_eq!(root.total_sub_segments(), 2);
        call.wrote_request(None);
        call.got_first_response_byte();
        call.finish(Some(200), None, None);
        root.close(None);

        let sends = sent(&mut rx);
        let mut phases = names(&sends[0][0]["subsegments"][0]);
        phases.sort_unstable();
        assert_eq!(phases, vec!["request", "response"]);
    }

    #[test]
    fn test_failed_call_records_fault_and_closes_open_phases() {
        let (recorder, mut rx) = Recorder::detached(Config::default());
        let root = recorder.begin_segment("gateway", CancellationToken::new());
        let mut call = recorder
            .begin_client_call(Some(&root), "colorteller.local", request())
            .unwrap()
            .unwrap();

        call.get_conn();
        call.connect_start();
        let err = std::io::Error::other("connection refused");
        call.finish(None, None, Some(&err));
        root.close(None);

        let sends = sent(&mut rx);
        assert_eq!(sends.len(), 1);
        let op = &sends[0][0]["subsegments"][0];
        assert_eq!(op["fault"], true);
        assert_eq!(op["cause"]["exceptions"][0]["message"], "connection refused");
        assert!(op["http"].get("response").is_none());
    }

    #[test]
    fn test_events_after_finish_are_ignored() {
        let (recorder, _rx) = Recorder::detached(Config::default());
        let root = recorder.begin_segment("gateway", CancellationToken::new());
        let call = recorder
            .begin_client_call(Some(&root), "colorteller.local", request())
            .unwrap()
            .unwrap();
        let op = call.segment().clone();
        call.finish(Some(200), None, None);

        let mut late = ClientCall::new(op.clone(), request());
        late.get_conn();
        assert_eq!(op.open_segments(), 0);
        assert_eq!(root.total_sub_segments(), 1);
    }
}
