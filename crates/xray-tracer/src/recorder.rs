// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The tracer instance applications create once and share.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::ClientCall;
use crate::config::{resolve_daemon_address, Config};
use crate::context;
use crate::emitter::{EmitterHandle, EmitterService};
use crate::errors::TraceError;
use crate::header::{SamplingDecision, TraceHeader};
use crate::http::HttpRequestData;
use crate::sampling::SamplingRequest;
use crate::segment::{self, RootOrigin, Segment};

pub(crate) struct RecorderInner {
    pub(crate) config: Config,
    pub(crate) emitter: EmitterHandle,
}

/// Begins segments and owns the connection to the daemon. Cloning is cheap.
#[derive(Clone)]
pub struct Recorder {
    inner: Arc<RecorderInner>,
}

impl Recorder {
    /// Binds the emitter socket and spawns its service on the current tokio runtime.
    pub async fn start(config: Config) -> Result<Recorder, TraceError> {
        let (service, emitter) = EmitterService::new(config.daemon_addr)
            .await
            .map_err(|e| {
                TraceError::Config(format!(
                    "failed to bind emitter socket for daemon {}: {e}",
                    config.daemon_addr
                ))
            })?;
        tokio::spawn(service.run());
        debug!("Recorder started with {:?}", config);

        Ok(Recorder {
            inner: Arc::new(RecorderInner { config, emitter }),
        })
    }

    /// A recorder whose sends land in the returned receiver instead of a socket.
    #[cfg(test)]
    pub(crate) fn detached(
        config: Config,
    ) -> (
        Recorder,
        tokio::sync::mpsc::UnboundedReceiver<crate::emitter::EmitterCommand>,
    ) {
        let (emitter, rx) = EmitterHandle::detached(config.daemon_addr);
        let recorder = Recorder {
            inner: Arc::new(RecorderInner { config, emitter }),
        };
        (recorder, rx)
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Begins a root segment for a new trace, sampled according to the configured strategy.
    /// `cancel` is the owning request's cancellation signal.
    #[must_use]
    pub fn begin_segment(&self, name: &str, cancel: CancellationToken) -> Segment {
        let sampled = self
            .inner
            .config
            .sampling
            .should_trace(&SamplingRequest::default());
        let origin = RootOrigin {
            trace_id: None,
            parent_id: None,
            sampled,
        };
        segment::begin_root(&self.inner, name, origin, cancel)
    }

    /// Begins a root segment continuing the trace described by an inbound header. An explicit
    /// `Sampled=1` or `Sampled=0` is honoured; otherwise the sampling strategy decides.
    #[must_use]
    pub fn begin_segment_from_header(
        &self,
        name: &str,
        header: &TraceHeader,
        request: &SamplingRequest<'_>,
        cancel: CancellationToken,
    ) -> Segment {
        let sampled = match header.sampling_decision {
            SamplingDecision::Sampled => true,
            SamplingDecision::NotSampled => false,
            SamplingDecision::Requested | SamplingDecision::Unknown => {
                self.inner.config.sampling.should_trace(request)
            }
        };
        let origin = RootOrigin {
            trace_id: header.trace_id.clone(),
            parent_id: header.parent_id.clone(),
            sampled,
        };
        segment::begin_root(&self.inner, name, origin, cancel)
    }

    /// Begins a subsegment of `parent`. Without a parent whose tree is still live, the configured
    /// context-missing strategy decides between `Ok(None)` and an error.
    pub fn begin_subsegment(
        &self,
        parent: Option<&Segment>,
        name: &str,
    ) -> Result<Option<Segment>, TraceError> {
        if let Some(child) = parent.and_then(|parent| segment::begin_child(parent, name)) {
            return Ok(Some(child));
        }

        self.inner.config.context_missing.context_missing(&format!(
            "failed to begin subsegment named '{name}': segment cannot be found."
        ))?;
        Ok(None)
    }

    /// Begins a subsegment of the segment in scope for the current task, see
    /// [`context::scope`].
    pub fn begin_subsegment_in_scope(&self, name: &str) -> Result<Option<Segment>, TraceError> {
        let current = context::current_segment();
        self.begin_subsegment(current.as_ref(), name)
    }

    /// Begins tracing an outbound HTTP call to `host` made from inside `parent`, routed through
    /// the same context-missing policy as [`Recorder::begin_subsegment`]. Send
    /// [`ClientCall::trace_header`] along with the request.
    pub fn begin_client_call(
        &self,
        parent: Option<&Segment>,
        host: &str,
        request: HttpRequestData,
    ) -> Result<Option<ClientCall>, TraceError> {
        Ok(self
            .begin_subsegment(parent, host)?
            .map(|op| ClientCall::new(op, request)))
    }

    /// Re-resolves `addr` and points all subsequent emission at it.
    pub fn set_daemon_address(&self, addr: &str) -> Result<(), TraceError> {
        let addr = resolve_daemon_address(addr)?;
        self.inner.emitter.set_daemon_address(addr);
        Ok(())
    }

    /// Stops the emitter service once it has sent everything queued before this call.
    pub fn shutdown(&self) {
        if self.inner.emitter.shutdown().is_err() {
            debug!("Emitter service already stopped");
        }
    }
}
