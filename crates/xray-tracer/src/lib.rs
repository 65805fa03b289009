// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # xray-tracer
//!
//! Builds per-request trees of segments and sends completed trees to a local X-Ray daemon as
//! UDP datagrams.
//!
//! - [`recorder`]: the tracer instance; begins segments and subsegments
//! - [`segment`]: segment handles, their lifecycle, and the cancellation watcher
//! - [`streaming`] and [`packer`]: serialization, with oversized trees sent incrementally
//! - [`emitter`]: the UDP transport
//! - [`header`], [`sampling`], [`context_missing`]: trace propagation and policy hooks
//! - [`client`]: subsegments for outbound HTTP calls
//!
//! A root segment is emitted once it and every subsegment begun under it have closed, or as
//! soon as the request that owns it is cancelled.

#![deny(clippy::all)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![allow(clippy::module_name_repetitions)]

pub mod annotation;
pub mod cause;
pub mod client;
pub mod config;
pub mod context;
pub mod context_missing;
pub mod emitter;
pub mod errors;
pub mod header;
pub mod http;
pub mod id;
pub mod packer;
pub mod pattern;
pub mod plugins;
pub mod recorder;
pub mod sampling;
pub mod segment;
pub mod streaming;

pub use config::Config;
pub use errors::TraceError;
pub use recorder::Recorder;
pub use segment::Segment;
