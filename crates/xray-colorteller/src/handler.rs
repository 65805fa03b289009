// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, HOST, USER_AGENT};
use hyper::{http, Request, Response, StatusCode};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xray_tracer::context;
use xray_tracer::header::{response_header, TraceHeader, TRACE_ID_HEADER};
use xray_tracer::http::HttpRequestData;
use xray_tracer::pattern::wildcard_match_case_insensitive;
use xray_tracer::sampling::SamplingRequest;
use xray_tracer::{Recorder, Segment};

const TRACING_NAME_ENV: &str = "AWS_XRAY_TRACING_NAME";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const PING_PATH: &str = "/ping";

fn tracing_name_override() -> Option<String> {
    env::var(TRACING_NAME_ENV).ok().filter(|n| !n.is_empty())
}

/// Chooses the name of the segment created for a request, given its `Host` header.
pub trait SegmentNamer: Send + Sync {
    fn name(&self, host: &str) -> String;
}

/// Names every segment with the same name, unless `AWS_XRAY_TRACING_NAME` overrides it.
#[derive(Debug, Clone)]
pub struct FixedSegmentNamer {
    name: String,
}

impl FixedSegmentNamer {
    pub fn new(name: &str) -> Self {
        Self {
            name: tracing_name_override().unwrap_or_else(|| name.to_string()),
        }
    }
}

impl SegmentNamer for FixedSegmentNamer {
    fn name(&self, _host: &str) -> String {
        self.name.clone()
    }
}

/// Names a segment after the request's host when it matches `recognized_hosts`, a wildcard
/// pattern, and falls back to a fixed name otherwise. `AWS_XRAY_TRACING_NAME` overrides the
/// fallback.
#[derive(Debug, Clone)]
pub struct DynamicSegmentNamer {
    fallback: String,
    recognized_hosts: String,
}

impl DynamicSegmentNamer {
    pub fn new(fallback: &str, recognized_hosts: &str) -> Self {
        Self {
            fallback: tracing_name_override().unwrap_or_else(|| fallback.to_string()),
            recognized_hosts: recognized_hosts.to_string(),
        }
    }
}

impl SegmentNamer for DynamicSegmentNamer {
    fn name(&self, host: &str) -> String {
        if wildcard_match_case_insensitive(&self.recognized_hosts, host) {
            host.to_string()
        } else {
            self.fallback.clone()
        }
    }
}

pub struct AppState {
    pub recorder: Recorder,
    pub namer: Box<dyn SegmentNamer>,
    pub color: String,
}

/// The originating client: the first `X-Forwarded-For` entry if present, otherwise the peer.
fn client_ip<B>(req: &Request<B>, remote: SocketAddr) -> (String, bool) {
    match req
        .headers()
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        Some(ip) => (ip.to_string(), true),
        None => (remote.ip().to_string(), false),
    }
}

fn request_data<B>(req: &Request<B>, remote: SocketAddr) -> HttpRequestData {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let (client_ip, x_forwarded_for) = client_ip(req, remote);

    HttpRequestData {
        method: Some(req.method().to_string()),
        url: Some(format!("http://{host}{}", req.uri().path())),
        client_ip: Some(client_ip),
        x_forwarded_for,
        user_agent: req
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    }
}

/// Traces one request: continues or starts a trace, records request and response data, and
/// echoes the trace header back to the caller.
pub async fn handle<B>(
    state: Arc<AppState>,
    req: Request<B>,
    remote: SocketAddr,
) -> http::Result<Response<Full<Bytes>>> {
    let header = req
        .headers()
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(TraceHeader::parse)
        .unwrap_or_default();

    // Dropped with this future, including when the client goes away mid-request.
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let sampling_request = SamplingRequest {
        host: Some(host),
        method: Some(req.method().as_str()),
        url: Some(req.uri().path()),
    };
    let segment = state.recorder.begin_segment_from_header(
        &state.namer.name(host),
        &header,
        &sampling_request,
        cancel,
    );
    segment.set_http_request(request_data(&req, remote));

    let mut response = context::scope(segment.clone(), route(&state, req.uri().path())).await?;

    match HeaderValue::from_str(&response_header(
        segment.trace_id(),
        header.sampling_decision,
        segment.sampled(),
    )) {
        Ok(value) => {
            response.headers_mut().insert(TRACE_ID_HEADER, value);
        }
        Err(e) => warn!("Trace id {} is not a valid header value: {}", segment.trace_id(), e),
    }

    finish(&segment, &response);
    Ok(response)
}

fn finish(segment: &Segment, response: &Response<Full<Bytes>>) {
    let content_length = response
        .headers()
        .get(hyper::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    segment.set_http_response(response.status().as_u16(), content_length);
    segment.close(None);
}

async fn route(state: &AppState, path: &str) -> http::Result<Response<Full<Bytes>>> {
    match path {
        PING_PATH => {
            info!("ping requested, responding with HTTP 200");
            Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::new()))
        }
        _ => get_color(state),
    }
}

fn get_color(state: &AppState) -> http::Result<Response<Full<Bytes>>> {
    let lookup = match state.recorder.begin_subsegment_in_scope("color-lookup") {
        Ok(lookup) => lookup,
        Err(e) => {
            debug!("Not tracing color lookup: {}", e);
            None
        }
    };
    if let Some(lookup) = &lookup {
        if let Err(e) = lookup.add_annotation("color", state.color.as_str()) {
            warn!("{}", e);
        }
    }

    info!("color requested, responding with {}", state.color);
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_LENGTH, state.color.len())
        .body(Full::new(Bytes::from(state.color.clone())));

    if let Some(lookup) = lookup {
        lookup.close(None);
    }
    response
}
