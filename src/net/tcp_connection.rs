// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::SocketAddr,
    slice,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, Ordering},
    },
};

use anyhow::Result;
use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Notify, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    codec::tinypb::{self, TinyPbFrame},
    net::{event_loop::EventLoop, tcp_buffer::TcpBuffer},
    rpc::dispatcher::RpcDispatcher,
};

/// How many bytes a single socket read may pull in.
const READ_CHUNK: usize = 4096;

/// Who created this end of the connection; decides where decoded inbound
/// frames are routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    NotConnected = 0,
    Connected = 1,
    HalfClosing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connected,
            2 => ConnectionState::HalfClosing,
            3 => ConnectionState::Closed,
            _ => ConnectionState::NotConnected,
        }
    }
}

struct PendingSend {
    frame: TinyPbFrame,
    done: Option<oneshot::Sender<()>>,
}

/// A bidirectional TCP session owning one read task and one write task.
///
/// Both tasks observe the same state word and exit once it leaves
/// `Connected` (the read task also survives `HalfClosing` to drain the
/// peer). Inbound frames go to the dispatcher in `Server` role, or to the
/// msg-id waiter table in `Client` role.
pub struct TcpConnection {
    event_loop: Arc<EventLoop>,
    reader: tokio::sync::Mutex<OwnedReadHalf>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    role: ConnectionRole,
    state: AtomicU8,
    buffer_hint: usize,

    out_buffer: Mutex<TcpBuffer>,
    pending_sends: Mutex<Vec<PendingSend>>,
    /// msg-id -> response waiter. Client role only.
    waiters: DashMap<String, oneshot::Sender<TinyPbFrame>>,

    /// Wakes the write task; stands in for the infinite steady timer the
    /// write side would otherwise park on.
    notify_write: Notify,
    cancel: CancellationToken,

    dispatcher: Option<Arc<RpcDispatcher>>,
}

impl TcpConnection {
    pub fn new(
        event_loop: Arc<EventLoop>,
        stream: TcpStream,
        buffer_hint: usize,
        role: ConnectionRole,
        dispatcher: Option<Arc<RpcDispatcher>>,
    ) -> Result<Arc<Self>> {
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        Ok(Arc::new(Self {
            event_loop,
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            local_addr,
            peer_addr,
            role,
            state: AtomicU8::new(ConnectionState::NotConnected as u8),
            buffer_hint,
            out_buffer: Mutex::new(TcpBuffer::new(buffer_hint)),
            pending_sends: Mutex::new(Vec::new()),
            waiters: DashMap::new(),
            notify_write: Notify::new(),
            cancel: CancellationToken::new(),
            dispatcher,
        }))
    }

    /// Spawns the read and write tasks on the owning event loop. A second
    /// call is a no-op: a connection never has more than one of each.
    pub fn start(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                ConnectionState::NotConnected as u8,
                ConnectionState::Connected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            warn!(peer = %self.peer_addr, "connection already started");
            return;
        }

        let conn = self.clone();
        self.event_loop.spawn(async move { conn.read_task().await });
        let conn = self.clone();
        self.event_loop.spawn(async move { conn.write_task().await });
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Open for reading: `Connected` or draining through `HalfClosing`.
    pub fn is_open(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::HalfClosing
        )
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    async fn read_task(self: Arc<Self>) {
        let mut in_buffer = TcpBuffer::new(self.buffer_hint);

        loop {
            if !self.is_open() {
                debug!(peer = %self.peer_addr, "read task: connection no longer open");
                return;
            }

            let read = {
                let mut reader = self.reader.lock().await;
                let window = in_buffer.prepare(READ_CHUNK);
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        debug!(peer = %self.peer_addr, "read cancelled, connection closing");
                        return;
                    },
                    res = reader.read(window) => res,
                }
            };

            match read {
                Ok(0) => {
                    if self.state() == ConnectionState::HalfClosing {
                        debug!(peer = %self.peer_addr, "half-close confirmed by peer EOF");
                    } else {
                        info!(peer = %self.peer_addr, "peer closed connection");
                    }
                    self.shutdown();
                    return;
                },
                Ok(n) => {
                    in_buffer.commit(n);
                    self.execute(&mut in_buffer);
                },
                Err(e) => {
                    info!(peer = %self.peer_addr, "read error: {e}");
                    self.shutdown();
                    return;
                },
            }
        }
    }

    /// Decodes whatever complete frames the input buffer holds and routes
    /// them by role.
    fn execute(self: &Arc<Self>, in_buffer: &mut TcpBuffer) {
        let frames = tinypb::decode(in_buffer);

        match self.role {
            ConnectionRole::Server => {
                let Some(dispatcher) = self.dispatcher.as_ref() else {
                    warn!(peer = %self.peer_addr, "server connection without dispatcher");
                    return;
                };
                for frame in frames {
                    debug!(
                        msg_id = %frame.msg_id,
                        peer = %self.peer_addr,
                        "got request from client"
                    );
                    dispatcher.dispatch(frame, self);
                }
            },
            ConnectionRole::Client => {
                for frame in frames {
                    match self.waiters.remove(&frame.msg_id) {
                        Some((_, waiter)) => {
                            let _ = waiter.send(frame);
                        },
                        None => {
                            info!(
                                msg_id = %frame.msg_id,
                                "dropping response with no registered waiter"
                            );
                        },
                    }
                }
            },
        }
    }

    async fn write_task(self: Arc<Self>) {
        loop {
            if self.state() != ConnectionState::Connected {
                debug!(peer = %self.peer_addr, "write task: connection no longer open");
                return;
            }

            let has_work = {
                !self.out_buffer.lock().expect("out buffer lock").is_empty()
                    || !self.pending_sends.lock().expect("pending sends lock").is_empty()
            };

            if !has_work {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = self.notify_write.notified() => continue,
                }
            }

            // Client role: every queued send gets encoded now, completions
            // held back until the flush lands.
            let mut dones = Vec::new();
            if self.role == ConnectionRole::Client {
                let sends: Vec<PendingSend> = {
                    let mut pending =
                        self.pending_sends.lock().expect("pending sends lock");
                    pending.drain(..).collect()
                };
                let mut out = self.out_buffer.lock().expect("out buffer lock");
                for send in sends {
                    tinypb::encode(slice::from_ref(&send.frame), &mut out);
                    if let Some(done) = send.done {
                        dones.push(done);
                    }
                }
            }

            let data: Vec<u8> = {
                let out = self.out_buffer.lock().expect("out buffer lock");
                out.view().to_vec()
            };
            if data.is_empty() {
                continue;
            }

            let written = {
                let mut writer = self.writer.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        debug!(peer = %self.peer_addr, "write cancelled, connection closing");
                        return;
                    },
                    res = writer.write_all(&data) => res,
                }
            };

            match written {
                Ok(()) => {
                    self.out_buffer
                        .lock()
                        .expect("out buffer lock")
                        .consume(data.len());
                    debug!(bytes = data.len(), peer = %self.peer_addr, "flushed");
                    for done in dones {
                        let _ = done.send(());
                    }
                },
                Err(e) => {
                    info!(peer = %self.peer_addr, "write error: {e}");
                    self.shutdown();
                    return;
                },
            }
        }
    }

    /// Server side: encodes the reply frames into the output buffer and
    /// wakes the write task.
    pub fn reply(&self, frames: Vec<TinyPbFrame>) {
        {
            let mut out = self.out_buffer.lock().expect("out buffer lock");
            tinypb::encode(&frames, &mut out);
        }
        self.listen_write();
    }

    /// Queues an outgoing frame (client role). The returned receiver fires
    /// once the frame has been flushed to the socket.
    pub fn push_send(&self, frame: TinyPbFrame) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending_sends
            .lock()
            .expect("pending sends lock")
            .push(PendingSend {
                frame,
                done: Some(tx),
            });
        rx
    }

    /// Registers a response waiter for `msg_id`. Registering the same msg-id
    /// again replaces the earlier waiter; the replaced receiver observes its
    /// sender closing.
    pub fn push_read(&self, msg_id: &str) -> oneshot::Receiver<TinyPbFrame> {
        let (tx, rx) = oneshot::channel();
        if self.waiters.insert(msg_id.to_string(), tx).is_some() {
            debug!(msg_id, "replacing already-registered response waiter");
        }
        rx
    }

    /// Wakes the write task.
    pub fn listen_write(&self) {
        self.notify_write.notify_one();
    }

    /// Requests a local half-close: the write side sends FIN, the read side
    /// keeps draining until the peer confirms with EOF.
    pub fn half_close(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                ConnectionState::Connected as u8,
                ConnectionState::HalfClosing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        debug!(peer = %self.peer_addr, "half-closing connection");
        self.listen_write();

        let conn = self.clone();
        self.event_loop.spawn(async move {
            let mut writer = conn.writer.lock().await;
            let _ = writer.shutdown().await;
        });
    }

    /// Idempotent teardown: state goes to `Closed`, outstanding socket
    /// operations are cancelled, the write-task notifier fires, and the
    /// pending-send and waiter collections are cleared. Callbacks registered
    /// on not-yet-sent frames are not invoked; callers reconcile through
    /// their own timeout.
    pub fn shutdown(self: &Arc<Self>) {
        let prev = self.state.swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        if prev == ConnectionState::Closed as u8 {
            return;
        }
        debug!(peer = %self.peer_addr, "shutting down connection");

        self.cancel.cancel();
        self.notify_write.notify_one();
        self.pending_sends
            .lock()
            .expect("pending sends lock")
            .clear();
        self.waiters.clear();

        let conn = self.clone();
        self.event_loop.spawn(async move {
            let mut writer = conn.writer.lock().await;
            let _ = writer.shutdown().await;
        });
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(peer = %self.peer_addr, "dropping connection");
    }
}
