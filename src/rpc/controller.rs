// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::SocketAddr,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::sync::Notify;

use crate::error::RpcError;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Default)]
struct ControllerInner {
    error_code: i32,
    error_info: String,
    msg_id: String,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

/// Per-call handle carrying the msg-id, timeout, endpoints, error state and
/// completion flags.
///
/// Shared between the caller, the call task and the timeout timer, so every
/// mutator takes `&self`. The `finished` flag is the idempotence guard for
/// the completion path: whichever of response delivery and timeout loses the
/// race observes it set and backs off.
#[derive(Debug)]
pub struct RpcController {
    inner: Mutex<ControllerInner>,
    timeout: Mutex<Duration>,
    finished: AtomicBool,
    cancelled: AtomicBool,
    waiter: Notify,
}

impl Default for RpcController {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcController {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ControllerInner::default()),
            timeout: Mutex::new(DEFAULT_TIMEOUT),
            finished: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            waiter: Notify::new(),
        }
    }

    /// Clears error and completion state so the controller can drive a new
    /// call. Msg-id, addresses and timeout are kept.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("controller lock");
        inner.error_code = 0;
        inner.error_info.clear();
        self.finished.store(false, Ordering::Release);
        self.cancelled.store(false, Ordering::Release);
    }

    pub fn set_error(&self, code: i32, info: impl Into<String>) {
        let mut inner = self.inner.lock().expect("controller lock");
        inner.error_code = code;
        inner.error_info = info.into();
    }

    pub fn set_rpc_error(&self, err: &RpcError) {
        self.set_error(err.code(), err.to_string());
    }

    pub fn failed(&self) -> bool {
        self.error_code() != 0
    }

    pub fn error_code(&self) -> i32 {
        self.inner.lock().expect("controller lock").error_code
    }

    pub fn error_info(&self) -> String {
        self.inner.lock().expect("controller lock").error_info.clone()
    }

    pub fn set_msg_id(&self, msg_id: impl Into<String>) {
        self.inner.lock().expect("controller lock").msg_id = msg_id.into();
    }

    pub fn msg_id(&self) -> String {
        self.inner.lock().expect("controller lock").msg_id.clone()
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock().expect("controller lock") = timeout;
    }

    pub fn timeout(&self) -> Duration {
        *self.timeout.lock().expect("controller lock")
    }

    pub fn set_local_addr(&self, addr: SocketAddr) {
        self.inner.lock().expect("controller lock").local_addr = Some(addr);
    }

    pub fn set_peer_addr(&self, addr: SocketAddr) {
        self.inner.lock().expect("controller lock").peer_addr = Some(addr);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().expect("controller lock").local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().expect("controller lock").peer_addr
    }

    pub fn start_cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Marks the call finished; returns whether this call did the transition.
    pub(crate) fn try_finish(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }

    /// Wakes every `wait_finished` caller.
    pub(crate) fn notify_finished(&self) {
        self.waiter.notify_waiters();
    }

    /// Suspends until the call completes (response, error or timeout).
    pub async fn wait_finished(&self) {
        loop {
            let notified = self.waiter.notified();
            tokio::pin!(notified);
            // Register before checking the flag, so a completion landing in
            // between still wakes this waiter.
            notified.as_mut().enable();
            if self.is_finished() {
                return;
            }
            notified.await;
        }
    }
}
