// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use crate::context_missing::{self, ContextMissingStrategy, LogErrorStrategy};
use crate::errors::TraceError;
use crate::plugins::PluginMetadata;
use crate::sampling::{AlwaysSample, FixedRateSampler, SamplingStrategy};
use crate::streaming::{DefaultStreamingStrategy, StreamingStrategy, DEFAULT_MAX_SUBSEGMENT_COUNT};

pub const DEFAULT_DAEMON_ADDRESS: &str = "127.0.0.1:2000";

const DAEMON_ADDRESS_ENV: &str = "AWS_XRAY_DAEMON_ADDRESS";
const CONTEXT_MISSING_ENV: &str = "AWS_XRAY_CONTEXT_MISSING";
const STREAMING_MAX_SUBSEGMENTS_ENV: &str = "AWS_XRAY_STREAMING_MAX_SUBSEGMENTS";
const SAMPLING_RATE_ENV: &str = "AWS_XRAY_SAMPLING_RATE";
const SERVICE_VERSION_ENV: &str = "AWS_XRAY_SERVICE_VERSION";

#[derive(Clone)]
pub struct Config {
    pub daemon_addr: SocketAddr,
    pub context_missing: Arc<dyn ContextMissingStrategy>,
    pub sampling: Arc<dyn SamplingStrategy>,
    pub streaming: Arc<dyn StreamingStrategy>,
    /// Reported as `service.version` on every root segment.
    pub service_version: Option<String>,
    pub plugin_metadata: Option<PluginMetadata>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("daemon_addr", &self.daemon_addr)
            .field("context_missing", &self.context_missing)
            .field("sampling", &self.sampling)
            .field("streaming", &self.streaming)
            .field("service_version", &self.service_version)
            .field("plugin_metadata", &self.plugin_metadata)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon_addr: SocketAddr::from(([127, 0, 0, 1], 2000)),
            context_missing: Arc::new(LogErrorStrategy),
            sampling: Arc::new(AlwaysSample),
            streaming: Arc::new(DefaultStreamingStrategy::default()),
            service_version: None,
            plugin_metadata: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Config, TraceError> {
        let daemon_addr = resolve_daemon_address(
            &env::var(DAEMON_ADDRESS_ENV).unwrap_or_else(|_| DEFAULT_DAEMON_ADDRESS.to_string()),
        )?;

        let context_missing: Arc<dyn ContextMissingStrategy> = match env::var(CONTEXT_MISSING_ENV)
        {
            Ok(name) => context_missing::from_name(&name).ok_or_else(|| {
                TraceError::Config(format!("unknown {CONTEXT_MISSING_ENV} strategy {name:?}"))
            })?,
            Err(_) => Arc::new(LogErrorStrategy),
        };

        let max_subsegments = env::var(STREAMING_MAX_SUBSEGMENTS_ENV)
            .ok()
            .and_then(|max| max.trim().parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_SUBSEGMENT_COUNT);

        let sampling: Arc<dyn SamplingStrategy> = match env::var(SAMPLING_RATE_ENV)
            .ok()
            .and_then(|rate| rate.trim().parse::<f64>().ok())
        {
            Some(rate) if rate < 1.0 => Arc::new(FixedRateSampler::new(rate)),
            _ => Arc::new(AlwaysSample),
        };

        let service_version = env::var(SERVICE_VERSION_ENV)
            .ok()
            .filter(|version| !version.trim().is_empty());

        Ok(Config {
            daemon_addr,
            context_missing,
            sampling,
            streaming: Arc::new(DefaultStreamingStrategy::new(max_subsegments)),
            service_version,
            plugin_metadata: None,
        })
    }
}

/// Resolves `host:port` to the first socket address it names.
pub fn resolve_daemon_address(addr: &str) -> Result<SocketAddr, TraceError> {
    addr.trim()
        .to_socket_addrs()
        .map_err(|e| TraceError::Config(format!("invalid daemon address {addr:?}: {e}")))?
        .next()
        .ok_or_else(|| TraceError::Config(format!("daemon address {addr:?} did not resolve")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [
            DAEMON_ADDRESS_ENV,
            CONTEXT_MISSING_ENV,
            STREAMING_MAX_SUBSEGMENTS_ENV,
            SAMPLING_RATE_ENV,
            SERVICE_VERSION_ENV,
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = Config::from_env().unwrap();
        assert_eq!(config.daemon_addr, "127.0.0.1:2000".parse().unwrap());
        assert!(config.context_missing.context_missing("missing").is_ok());
        assert_eq!(config.service_version, None);
        assert!(format!("{:?}", config.streaming).contains("max_subsegment_count: 20"));
        assert!(format!("{:?}", config.sampling).contains("AlwaysSample"));
    }

    #[test]
    #[serial]
    fn test_overrides() {
        clear_env();
        env::set_var(DAEMON_ADDRESS_ENV, "127.0.0.1:3000");
        env::set_var(CONTEXT_MISSING_ENV, "RUNTIME_ERROR");
        env::set_var(STREAMING_MAX_SUBSEGMENTS_ENV, "5");
        env::set_var(SAMPLING_RATE_ENV, "0.25");
        env::set_var(SERVICE_VERSION_ENV, "1.0.0");

        let config = Config::from_env().unwrap();
        assert_eq!(config.daemon_addr, "127.0.0.1:3000".parse().unwrap());
        assert!(matches!(
            config.context_missing.context_missing("missing"),
            Err(TraceError::ContextMissing(_))
        ));
        assert!(format!("{:?}", config.streaming).contains("max_subsegment_count: 5"));
        assert!(format!("{:?}", config.sampling).contains("rate: 0.25"));
        assert_eq!(config.service_version.as_deref(), Some("1.0.0"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_unparseable_numbers_fall_back_to_defaults() {
        clear_env();
        env::set_var(STREAMING_MAX_SUBSEGMENTS_ENV, "lots");
        env::set_var(SAMPLING_RATE_ENV, "sometimes");

        let config = Config::from_env().unwrap();
        assert!(format!("{:?}", config.streaming).contains("max_subsegment_count: 20"));
        assert!(format!("{:?}", config.sampling).contains("AlwaysSample"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_unknown_context_missing_strategy() {
        clear_env();
        env::set_var(CONTEXT_MISSING_ENV, "IGNORE_ERROR");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, TraceError::Config(ref m) if m.contains("IGNORE_ERROR")));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_daemon_address() {
        clear_env();
        env::set_var(DAEMON_ADDRESS_ENV, "not an address");
        assert!(matches!(Config::from_env(), Err(TraceError::Config(_))));
        clear_env();
    }

    #[test]
    fn test_resolve_daemon_address() {
        assert_eq!(
            resolve_daemon_address(" 127.0.0.1:2000 ").unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 2000))
        );
        assert!(resolve_daemon_address("[::1]:2000").unwrap().is_ipv6());
        assert!(resolve_daemon_address("127.0.0.1").is_err());
    }
}
