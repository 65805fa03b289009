// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cause records attached to faulted segments.

use serde::{Deserialize, Serialize};
use std::error::Error;

use crate::id::new_segment_id;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CauseData {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_directory: String,
    #[serde(default)]
    pub exceptions: Vec<Exception>,
}

/// One formatted error. When an error has a source chain, each source becomes its own exception
/// and the `cause` field links to the id of the next one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exception {
    pub id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl CauseData {
    pub(crate) fn new() -> Self {
        Self {
            working_directory: std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            exceptions: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, err: &(dyn Error + 'static)) {
        let mut messages = vec![err.to_string()];
        let mut source = err.source();
        while let Some(inner) = source {
            messages.push(inner.to_string());
            source = inner.source();
        }

        let ids: Vec<String> = messages.iter().map(|_| new_segment_id()).collect();
        for (i, message) in messages.into_iter().enumerate() {
            self.exceptions.push(Exception {
                id: ids[i].clone(),
                message,
                cause: ids.get(i + 1).cloned(),
            });
        }
    }
}
