// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod handler;

use hyper::service::service_fn;
use std::net::SocketAddr;
use std::{env, io, sync::Arc};
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use xray_tracer::Recorder;

use handler::{AppState, DynamicSegmentNamer, FixedSegmentNamer, SegmentNamer};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_COLOR: &str = "black";
const DEFAULT_STAGE: &str = "default";

#[derive(Debug, PartialEq)]
struct RuntimeConfig {
    stage: String,
    server_port: u16,
    color: String,
    /// Wildcard pattern of hosts that name their own segments.
    recognized_hosts: Option<String>,
}

impl RuntimeConfig {
    fn from_env() -> Self {
        let stage = env::var("STAGE")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_STAGE.to_string());
        let server_port = env::var("SERVER_PORT")
            .ok()
            .and_then(|port| port.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        let color = env::var("COLOR")
            .ok()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| DEFAULT_COLOR.to_string());
        let recognized_hosts = env::var("RECOGNIZED_HOSTS").ok().filter(|h| !h.is_empty());

        Self {
            stage,
            server_port,
            color,
            recognized_hosts,
        }
    }

    fn segment_name(&self) -> String {
        format!("{}-colorteller-{}", self.stage, self.color)
    }

    fn segment_namer(&self) -> Box<dyn SegmentNamer> {
        match &self.recognized_hosts {
            Some(hosts) => Box::new(DynamicSegmentNamer::new(&self.segment_name(), hosts)),
            None => Box::new(FixedSegmentNamer::new(&self.segment_name())),
        }
    }
}

#[tokio::main]
pub async fn main() {
    let log_level = env::var("AWS_XRAY_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = RuntimeConfig::from_env();
    info!("Config initialized to {:?}", config);

    let tracer_config = match xray_tracer::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error loading tracer config: {e}");
            return;
        }
    };
    let recorder = match Recorder::start(tracer_config).await {
        Ok(r) => r,
        Err(e) => {
            error!("Error starting recorder: {e}");
            return;
        }
    };

    let state = Arc::new(AppState {
        recorder: recorder.clone(),
        namer: config.segment_namer(),
        color: config.color.clone(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Unable to listen on {addr}: {e}");
            return;
        }
    };
    info!("Colorteller listening on {addr}");

    if let Err(e) = serve(listener, state).await {
        error!("Server stopped: {e}");
    }
    recorder.shutdown();
}

async fn serve(listener: TcpListener, state: Arc<AppState>) -> io::Result<()> {
    let server = hyper::server::conn::http1::Builder::new();
    let mut joinset = tokio::task::JoinSet::new();

    loop {
        let (conn, remote) = tokio::select! {
            con_res = listener.accept() => match con_res {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("Server error: {e}");
                    return Err(e);
                }
                Ok(accepted) => accepted,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => match finished {
                Err(e) if e.is_panic() => {
                    error!("Connection handler panicked: {:?}", e);
                    continue;
                },
                Ok(()) | Err(_) => continue,
            },
        };

        let conn = hyper_util::rt::TokioIo::new(conn);
        let server = server.clone();
        let state = Arc::clone(&state);
        let service = service_fn(move |req| handler::handle(Arc::clone(&state), req, remote));
        joinset.spawn(async move {
            if let Err(e) = server.serve_connection(conn, service).await {
                error!("Connection error: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_runtime_config_defaults() {
        env::remove_var("STAGE");
        env::remove_var("SERVER_PORT");
        env::remove_var("COLOR");
        env::remove_var("RECOGNIZED_HOSTS");
        env::remove_var("AWS_XRAY_TRACING_NAME");

        let config = RuntimeConfig::from_env();
        assert_eq!(
            config,
            RuntimeConfig {
                stage: "default".to_string(),
                server_port: 8080,
                color: "black".to_string(),
                recognized_hosts: None,
            }
        );
        assert_eq!(config.segment_name(), "default-colorteller-black");
        assert_eq!(
            config.segment_namer().name("black.mesh.local"),
            "default-colorteller-black"
        );
    }

    #[test]
    #[serial]
    fn test_runtime_config_from_env() {
        env::set_var("STAGE", "prod");
        env::set_var("SERVER_PORT", "9090");
        env::set_var("COLOR", "blue");

        let config = RuntimeConfig::from_env();
        assert_eq!(config.server_port, 9090);
        assert_eq!(config.segment_name(), "prod-colorteller-blue");

        env::set_var("SERVER_PORT", "not-a-port");
        assert_eq!(RuntimeConfig::from_env().server_port, DEFAULT_PORT);

        env::remove_var("AWS_XRAY_TRACING_NAME");
        env::set_var("RECOGNIZED_HOSTS", "*.mesh.local");
        let namer = RuntimeConfig::from_env().segment_namer();
        assert_eq!(namer.name("blue.mesh.local"), "blue.mesh.local");
        assert_eq!(namer.name("10.0.0.7"), "prod-colorteller-blue");

        env::remove_var("RECOGNIZED_HOSTS");
        env::remove_var("STAGE");
        env::remove_var("SERVER_PORT");
        env::remove_var("COLOR");
    }
}
