// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::{
    net::{
        event_loop::EventLoop,
        io_thread::IoThreadPool,
        tcp_connection::{ConnectionRole, TcpConnection},
    },
    rpc::dispatcher::RpcDispatcher,
};

const SERVER_BUFFER_HINT: usize = 128;
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Hosts registered services behind a listening socket.
///
/// The acceptor runs on its own event loop ("main loop"); accepted sockets
/// become `Server`-role connections bound to an I/O thread picked
/// round-robin, and are started on that thread via its pending queue. A
/// repeating timer sweeps connections that have closed out of the live set.
pub struct TcpServer {
    local_addr: SocketAddr,
    main_loop: Arc<EventLoop>,
    io_pool: Arc<IoThreadPool>,
    dispatcher: Arc<RpcDispatcher>,
    listener: Mutex<Option<std::net::TcpListener>>,
    clients: Arc<Mutex<Vec<Arc<TcpConnection>>>>,
}

impl TcpServer {
    /// Binds the listening socket eagerly, so a bad address fails startup
    /// instead of the first accept.
    pub fn new(
        addr: SocketAddr,
        io_threads: usize,
        dispatcher: Arc<RpcDispatcher>,
    ) -> Result<Arc<Self>> {
        let listener = std::net::TcpListener::bind(addr)
            .with_context(|| format!("failed to listen on {addr}"))?;
        listener
            .set_nonblocking(true)
            .context("failed to set listener non-blocking")?;
        let local_addr = listener.local_addr()?;

        let main_loop = Arc::new(EventLoop::new()?);
        main_loop.enable_keep_alive();
        let io_pool = Arc::new(IoThreadPool::new(io_threads)?);

        info!(addr = %local_addr, io_threads, "rpc server listening");

        Ok(Arc::new(Self {
            local_addr,
            main_loop,
            io_pool,
            dispatcher,
            listener: Mutex::new(Some(listener)),
            clients: Arc::new(Mutex::new(Vec::new())),
        }))
    }

    /// The bound address; useful when the configured port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn io_pool(&self) -> &Arc<IoThreadPool> {
        &self.io_pool
    }

    /// Runs the acceptor. Blocks the calling thread until `stop()`.
    pub fn start(self: &Arc<Self>) {
        let listener = self
            .listener
            .lock()
            .expect("listener lock")
            .take();
        let Some(listener) = listener else {
            error!("server already started");
            return;
        };

        self.io_pool.start();

        let server = self.clone();
        self.main_loop.spawn(async move {
            server.accept_task(listener).await;
        });

        let clients = self.clients.clone();
        self.main_loop
            .add_timer(SWEEP_INTERVAL, true, move || {
                let mut clients = clients.lock().expect("clients lock");
                let before = clients.len();
                clients.retain(|c| c.is_open());
                let swept = before - clients.len();
                if swept > 0 {
                    debug!(swept, remaining = clients.len(), "swept closed connections");
                }
            });

        self.main_loop.run();
    }

    async fn accept_task(self: Arc<Self>, listener: std::net::TcpListener) {
        let listener = match TcpListener::from_std(listener) {
            Ok(l) => l,
            Err(e) => {
                error!("failed to register listener: {e}");
                return;
            },
        };

        loop {
            let accepted = tokio::select! {
                _ = self.main_loop.shutdown_token().cancelled() => {
                    debug!("accept task cancelled");
                    return;
                },
                res = listener.accept() => res,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!("accept error: {e}");
                    return;
                },
            };

            let io_thread = self.io_pool.next();
            let connection = match TcpConnection::new(
                io_thread.event_loop().clone(),
                stream,
                SERVER_BUFFER_HINT,
                ConnectionRole::Server,
                Some(self.dispatcher.clone()),
            ) {
                Ok(conn) => conn,
                Err(e) => {
                    error!(peer = %peer, "failed to set up connection: {e:#}");
                    continue;
                },
            };

            info!(peer = %peer, "accepted client");
            self.clients
                .lock()
                .expect("clients lock")
                .push(connection.clone());
            io_thread.enqueue_pending(connection);
        }
    }

    /// Number of tracked live connections (sweeps lag closure by up to one
    /// interval).
    pub fn client_count(&self) -> usize {
        self.clients.lock().expect("clients lock").len()
    }

    /// Stops the acceptor loop and the I/O threads, joining them.
    pub fn stop(&self) {
        info!(addr = %self.local_addr, "stopping rpc server");
        self.main_loop.stop();
        self.io_pool.stop();
    }
}
