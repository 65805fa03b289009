// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace and segment identifier generation.
//!
//! Identifiers are built from the operating system's CSPRNG. If that source is unavailable the
//! process cannot safely produce unique identifiers, so generation aborts instead of falling back
//! to a weaker generator.

use rand::rngs::OsRng;
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

/// Version prefix of every trace id.
const TRACE_ID_VERSION: u8 = 1;

#[allow(clippy::expect_used)]
fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng
        .try_fill_bytes(&mut buf)
        .expect("operating system random source unavailable, cannot generate trace identifiers");
    buf
}

/// Returns a new trace id of the form `1-{unix seconds, 8 hex}-{96 random bits, 24 hex}`.
#[must_use]
pub fn new_trace_id() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!(
        "{}-{:08x}-{}",
        TRACE_ID_VERSION,
        secs,
        hex::encode(random_bytes::<12>())
    )
}

/// Returns a new 64 bit segment id as 16 lowercase hex characters.
#[must_use]
pub fn new_segment_id() -> String {
    hex::encode(random_bytes::<8>())
}
