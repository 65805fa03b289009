// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sends packed segment documents to the X-Ray daemon over UDP.
//!
//! Sending is fire-and-forget: segment code hands blocks to an [`EmitterHandle`], and the
//! [`EmitterService`] task frames each block with the protocol header and writes it as a single
//! datagram. Failures are logged and never reach instrumented code.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// Prefix of every datagram sent to the daemon.
pub const PROTOCOL_HEADER: &[u8] = b"{\"format\": \"json\", \"version\": 1}\n";

#[derive(Debug)]
pub enum EmitterCommand {
    Send(Vec<Vec<u8>>),
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct EmitterHandle {
    tx: mpsc::UnboundedSender<EmitterCommand>,
    daemon_addr: Arc<RwLock<SocketAddr>>,
}

impl EmitterHandle {
    /// Queues blocks for sending. Never blocks and never fails the caller.
    pub fn send(&self, blocks: Vec<Vec<u8>>) {
        if blocks.is_empty() {
            return;
        }
        if let Err(e) = self.tx.send(EmitterCommand::Send(blocks)) {
            warn!("Emitter service stopped, dropping segment blocks: {}", e);
        }
    }

    /// Points all later sends at `addr`.
    pub fn set_daemon_address(&self, addr: SocketAddr) {
        #[allow(clippy::expect_used)]
        let mut daemon_addr = self.daemon_addr.write().expect("lock poisoned");
        debug!("Daemon address changed from {} to {}", *daemon_addr, addr);
        *daemon_addr = addr;
    }

    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn daemon_address(&self) -> SocketAddr {
        *self.daemon_addr.read().expect("lock poisoned")
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<EmitterCommand>> {
        self.tx.send(EmitterCommand::Shutdown)
    }

    /// A handle with no service behind it, so tests can inspect what would have been sent.
    #[cfg(test)]
    pub(crate) fn detached(
        daemon_addr: SocketAddr,
    ) -> (Self, mpsc::UnboundedReceiver<EmitterCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            tx,
            daemon_addr: Arc::new(RwLock::new(daemon_addr)),
        };
        (handle, rx)
    }
}

pub struct EmitterService {
    socket: UdpSocket,
    daemon_addr: Arc<RwLock<SocketAddr>>,
    rx: mpsc::UnboundedReceiver<EmitterCommand>,
}

impl EmitterService {
    /// Binds an ephemeral local socket in the same address family as `daemon_addr`.
    pub async fn new(daemon_addr: SocketAddr) -> std::io::Result<(Self, EmitterHandle)> {
        let bind_addr: SocketAddr = if daemon_addr.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        debug!(
            "Emitter bound to {} for daemon at {}",
            socket.local_addr()?,
            daemon_addr
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let daemon_addr = Arc::new(RwLock::new(daemon_addr));
        let service = Self {
            socket,
            daemon_addr: Arc::clone(&daemon_addr),
            rx,
        };
        let handle = EmitterHandle { tx, daemon_addr };

        Ok((service, handle))
    }

    pub async fn run(mut self) {
        debug!("Emitter service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                EmitterCommand::Send(blocks) => {
                    #[allow(clippy::expect_used)]
                    let addr = *self.daemon_addr.read().expect("lock poisoned");
                    for block in blocks {
                        self.send_block(&block, addr).await;
                    }
                }
                EmitterCommand::Shutdown => {
                    debug!("Emitter service shutting down");
                    break;
                }
            }
        }

        debug!("Emitter service stopped");
    }

    async fn send_block(&self, block: &[u8], addr: SocketAddr) {
        trace!("Sending segment block: {}", String::from_utf8_lossy(block));
        let mut datagram = Vec::with_capacity(PROTOCOL_HEADER.len() + block.len());
        datagram.extend_from_slice(PROTOCOL_HEADER);
        datagram.extend_from_slice(block);

        match self.socket.send_to(&datagram, addr).await {
            Ok(sent) => debug!("Sent {} byte segment block to {}", sent, addr),
            Err(e) => error!("Failed to send segment block to {}: {}", addr, e),
        }
    }
}
