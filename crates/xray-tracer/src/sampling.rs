// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sampling decisions for traces that arrive without one.

use std::fmt::Debug;

/// Request attributes a sampling strategy may key its decision on.
#[derive(Debug, Clone, Copy, Default)]
pub struct SamplingRequest<'a> {
    pub host: Option<&'a str>,
    pub method: Option<&'a str>,
    pub url: Option<&'a str>,
}

pub trait SamplingStrategy: Debug + Send + Sync {
    fn should_trace(&self, request: &SamplingRequest<'_>) -> bool;
}

/// Records every trace.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysSample;

impl SamplingStrategy for AlwaysSample {
    fn should_trace(&self, _request: &SamplingRequest<'_>) -> bool {
        true
    }
}

/// Records a fixed fraction of traces.
#[derive(Debug, Clone, Copy)]
pub struct FixedRateSampler {
    rate: f64,
}

impl FixedRateSampler {
    /// `rate` is clamped to `[0.0, 1.0]`; NaN samples nothing.
    #[must_use]
    pub fn new(rate: f64) -> Self {
        let rate = if rate.is_nan() {
            0.0
        } else {
            rate.clamp(0.0, 1.0)
        };
        Self { rate }
    }

    #[must_use]
    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl SamplingStrategy for FixedRateSampler {
    fn should_trace(&self, _request: &SamplingRequest<'_>) -> bool {
        rand::random::<f64>() < self.rate
    }
}
