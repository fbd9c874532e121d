// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use tokio::{net::TcpStream, sync::oneshot};
use tracing::{debug, info};

use crate::{
    codec::tinypb::TinyPbFrame,
    net::{
        event_loop::EventLoop,
        tcp_connection::{ConnectionRole, TcpConnection},
    },
};

const CLIENT_BUFFER_HINT: usize = 128;

/// Client transport for a single peer: connects on the current thread's
/// event loop and exposes the send/receive primitives the call engine uses.
pub struct TcpClient {
    event_loop: Arc<EventLoop>,
    peer_addr: SocketAddr,
    local_addr: OnceCell<SocketAddr>,
    connection: OnceCell<Arc<TcpConnection>>,
}

impl TcpClient {
    /// Binds the client to the calling thread's event loop.
    pub fn new(peer_addr: SocketAddr) -> Result<Arc<Self>> {
        let event_loop = EventLoop::for_current_thread()?;
        Ok(Arc::new(Self {
            event_loop,
            peer_addr,
            local_addr: OnceCell::new(),
            connection: OnceCell::new(),
        }))
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Connects and starts the connection's read/write tasks on this
    /// client's event loop.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let stream = TcpStream::connect(self.peer_addr)
            .await
            .with_context(|| format!("tcp connect to {} failed", self.peer_addr))?;

        let connection = TcpConnection::new(
            self.event_loop.clone(),
            stream,
            CLIENT_BUFFER_HINT,
            ConnectionRole::Client,
            None,
        )?;
        let _ = self.local_addr.set(connection.local_addr());
        connection.start();

        self.connection
            .set(connection)
            .map_err(|_| anyhow::anyhow!("client already connected"))?;

        debug!(peer = %self.peer_addr, "client connected");
        Ok(())
    }

    fn connection(&self) -> Result<&Arc<TcpConnection>> {
        self.connection
            .get()
            .context("client not connected")
    }

    /// Queues `frame` for sending. The returned receiver fires once the
    /// frame is on the wire.
    pub fn write_message(&self, frame: TinyPbFrame) -> Result<oneshot::Receiver<()>> {
        let connection = self.connection()?;
        let done = connection.push_send(frame);
        connection.listen_write();
        Ok(done)
    }

    /// Registers interest in the response carrying `msg_id`.
    pub fn read_message(&self, msg_id: &str) -> Result<oneshot::Receiver<TinyPbFrame>> {
        let connection = self.connection()?;
        Ok(connection.push_read(msg_id))
    }

    /// Tears the transport down.
    pub fn stop(&self) {
        if let Some(connection) = self.connection.get() {
            info!(peer = %self.peer_addr, "stopping client transport");
            connection.shutdown();
        }
    }
}
