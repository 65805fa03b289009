// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! What to do when a subsegment is begun without a live parent segment.

use std::fmt::Debug;
use std::sync::Arc;
use tracing::error;

use crate::errors::TraceError;

/// Value of `AWS_XRAY_CONTEXT_MISSING` selecting [`RuntimeErrorStrategy`].
pub const RUNTIME_ERROR_STRATEGY: &str = "RUNTIME_ERROR";
/// Value of `AWS_XRAY_CONTEXT_MISSING` selecting [`LogErrorStrategy`].
pub const LOG_ERROR_STRATEGY: &str = "LOG_ERROR";

pub trait ContextMissingStrategy: Debug + Send + Sync {
    /// Returns an error to propagate to the instrumented code, or `Ok` to carry on without a
    /// subsegment.
    fn context_missing(&self, message: &str) -> Result<(), TraceError>;
}

/// Returns [`TraceError::ContextMissing`] to the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuntimeErrorStrategy;

impl ContextMissingStrategy for RuntimeErrorStrategy {
    fn context_missing(&self, message: &str) -> Result<(), TraceError> {
        Err(TraceError::ContextMissing(message.to_string()))
    }
}

/// Logs the problem and lets the caller continue untraced.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorStrategy;

impl ContextMissingStrategy for LogErrorStrategy {
    fn context_missing(&self, message: &str) -> Result<(), TraceError> {
        error!("Suppressing missing trace context: {message}");
        Ok(())
    }
}

/// Looks up a strategy by its environment variable name.
#[must_use]
pub fn from_name(name: &str) -> Option<Arc<dyn ContextMissingStrategy>> {
    match name.trim() {
        RUNTIME_ERROR_STRATEGY => Some(Arc::new(RuntimeErrorStrategy)),
        LOG_ERROR_STRATEGY => Some(Arc::new(LogErrorStrategy)),
        _ => None,
    }
}
