// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use anyhow::{Result, anyhow};
use tracing::{debug, error, info};

use crate::{
    cfg::config::Config,
    codec::tinypb::TinyPbFrame,
    error::RpcError,
    net::{event_loop::TimerHandle, tcp_client::TcpClient},
    registry::service_registry::ServiceRegistry,
    rpc::{
        context,
        controller::RpcController,
        msg_id,
        service::{ResponseSlot, RpcMessage, response_slot},
    },
};

/// User completion invoked exactly once per call.
pub type RpcClosure = Box<dyn FnOnce() + Send>;

/// Everything a single in-flight call shares between the call task and its
/// timeout timer. The timer closure holds the only long-lived clone; it is
/// released the moment the timer fires or is cancelled.
struct CallState {
    controller: Arc<RpcController>,
    response: ResponseSlot,
    done: Mutex<Option<RpcClosure>>,
    timeout_timer: Mutex<Option<TimerHandle>>,
    client: Mutex<Option<Arc<TcpClient>>>,
}

impl CallState {
    /// Completion funnel; idempotent through the controller's finished flag.
    /// Cancels the timeout, runs the user completion, wakes waiters and
    /// tears the per-call transport down.
    fn call_back(self: &Arc<Self>) {
        if !self.controller.try_finish() {
            return;
        }
        if let Some(timer) = self.timeout_timer.lock().expect("call state lock").take() {
            timer.cancel();
        }
        if let Some(done) = self.done.lock().expect("call state lock").take() {
            done();
        }
        self.controller.notify_finished();
        if let Some(client) = self.client.lock().expect("call state lock").take() {
            client.stop();
        }
    }

    fn fail(self: &Arc<Self>, err: &RpcError) {
        self.controller.set_rpc_error(err);
        self.call_back();
    }
}

/// Sends RPCs to one of a list of candidate endpoints, selected round-robin.
/// Owns the transport for the duration of each call.
pub struct RpcChannel {
    peer_addrs: Vec<SocketAddr>,
    addr_index: AtomicUsize,
}

impl RpcChannel {
    pub fn new(peer_addrs: Vec<SocketAddr>) -> Arc<Self> {
        Arc::new(Self {
            peer_addrs,
            addr_index: AtomicUsize::new(0),
        })
    }

    /// Resolves `target` to candidate endpoints, trying in order: a literal
    /// `host:port`, the service directory, and the local stub configuration.
    pub async fn find_addr(
        target: &str,
        registry: Option<&Arc<ServiceRegistry>>,
        config: Option<&Config>,
    ) -> Vec<SocketAddr> {
        if let Ok(addr) = target.parse::<SocketAddr>() {
            return vec![addr];
        }

        if let Some(registry) = registry {
            debug!(target, "resolving service name through the directory");
            let endpoints = registry.discover(target).await;
            let addrs: Vec<SocketAddr> = endpoints
                .iter()
                .filter_map(|e| e.parse().ok())
                .collect();
            if !addrs.is_empty() {
                return addrs;
            }
        }

        if let Some(config) = config
            && let Some(stub) = config.stubs.get(target)
        {
            match stub.socket_addr() {
                Ok(addr) => {
                    info!(target, addr = %addr, "resolved service through local stub config");
                    return vec![addr];
                },
                Err(e) => info!(target, "stub config unusable: {e:#}"),
            }
        }

        info!(target, "could not resolve any endpoint");
        Vec::new()
    }

    /// Next endpoint whose address is not the unspecified sentinel.
    fn select_peer(&self) -> Option<SocketAddr> {
        if self.peer_addrs.is_empty() {
            return None;
        }
        let start = self.addr_index.load(Ordering::Relaxed) % self.peer_addrs.len();
        for offset in 0..self.peer_addrs.len() {
            let i = (start + offset) % self.peer_addrs.len();
            let addr = self.peer_addrs[i];
            if addr.ip().is_unspecified() || addr.port() == 0 {
                continue;
            }
            self.addr_index.store(i + 1, Ordering::Relaxed);
            return Some(addr);
        }
        None
    }

    /// Issues one RPC. The controller carries the timeout and receives the
    /// outcome; `done` runs exactly once, whether the call succeeds, fails
    /// or times out.
    ///
    /// Msg-id selection: an id already set on the controller wins; otherwise
    /// one propagated from the inbound call being handled is reused (so a
    /// call chain shares one id in the logs); otherwise a fresh id is
    /// generated.
    pub fn call_method(
        self: &Arc<Self>,
        method_full_name: &str,
        controller: Arc<RpcController>,
        request: &dyn RpcMessage,
        response: ResponseSlot,
        done: Option<RpcClosure>,
    ) {
        let state = Arc::new(CallState {
            controller: controller.clone(),
            response,
            done: Mutex::new(done),
            timeout_timer: Mutex::new(None),
            client: Mutex::new(None),
        });

        let Some(peer_addr) = self.select_peer() else {
            let err = RpcError::PeerAddrUnavailable("all endpoints unspecified".into());
            error!(method = method_full_name, "{err}");
            state.fail(&err);
            return;
        };

        let msg_id = {
            let from_controller = controller.msg_id();
            if !from_controller.is_empty() {
                from_controller
            } else if let Some(inherited) = context::current_msg_id() {
                controller.set_msg_id(inherited.clone());
                inherited
            } else {
                let generated = msg_id::gen_msg_id();
                controller.set_msg_id(generated.clone());
                generated
            }
        };

        debug!(msg_id = %msg_id, method = method_full_name, "call method");

        let payload = match request.marshal() {
            Ok(payload) => payload,
            Err(e) => {
                let err = RpcError::Serialize(format!("failed to marshal request: {e}"));
                error!(msg_id = %msg_id, "{err}");
                state.fail(&err);
                return;
            },
        };
        let frame =
            TinyPbFrame::request(msg_id.clone(), method_full_name.to_string(), payload.into());

        let client = match TcpClient::new(peer_addr) {
            Ok(client) => client,
            Err(e) => {
                let err = RpcError::ChannelInit(format!("no event loop for call: {e:#}"));
                error!(msg_id = %msg_id, "{err}");
                state.fail(&err);
                return;
            },
        };
        *state.client.lock().expect("call state lock") = Some(client.clone());

        // Timeout timer first, so even a hung connect is bounded.
        let timeout = controller.timeout();
        let timer_state = state.clone();
        let timer = client.event_loop().add_timer(timeout, false, move || {
            if timer_state.controller.is_finished() {
                return;
            }
            info!(
                msg_id = %timer_state.controller.msg_id(),
                "rpc call timeout arrived"
            );
            timer_state.controller.start_cancel();
            let err = RpcError::CallTimeout(timeout.as_millis() as u64);
            timer_state.fail(&err);
        });
        *state.timeout_timer.lock().expect("call state lock") = Some(timer);

        let call_state = state.clone();
        let event_loop = client.event_loop().clone();
        event_loop.spawn(async move {
            Self::run_call(client, call_state, frame, msg_id).await;
        });
    }

    async fn run_call(
        client: Arc<TcpClient>,
        state: Arc<CallState>,
        frame: TinyPbFrame,
        msg_id: String,
    ) {
        if let Err(e) = client.connect().await {
            let err = RpcError::Connect(format!("{e:#}"));
            error!(msg_id = %msg_id, peer = %client.peer_addr(), "{err}");
            state.fail(&err);
            return;
        }
        debug!(
            msg_id = %msg_id,
            peer = %client.peer_addr(),
            local = ?client.local_addr(),
            "connect success"
        );

        // Register the response waiter before the request can hit the wire.
        let read_done = match client.read_message(&msg_id) {
            Ok(rx) => rx,
            Err(e) => {
                state.fail(&RpcError::ChannelInit(format!("{e:#}")));
                return;
            },
        };
        let send_done = match client.write_message(frame) {
            Ok(rx) => rx,
            Err(e) => {
                state.fail(&RpcError::ChannelInit(format!("{e:#}")));
                return;
            },
        };

        if send_done.await.is_ok() {
            debug!(msg_id = %msg_id, peer = %client.peer_addr(), "rpc request on the wire");
        }

        let response_frame = match read_done.await {
            Ok(frame) => frame,
            Err(_) => {
                // Connection went down before a response; the timeout timer
                // is the cleanup guarantee.
                debug!(msg_id = %msg_id, "connection closed before response");
                return;
            },
        };

        if state.controller.is_finished() {
            debug!(msg_id = %msg_id, "late response discarded");
            return;
        }

        debug!(
            msg_id = %response_frame.msg_id,
            method = %response_frame.method_name,
            "got rpc response"
        );

        if response_frame.err_code != 0 {
            error!(
                msg_id = %response_frame.msg_id,
                code = response_frame.err_code,
                info = %response_frame.err_info,
                "rpc call failed on peer"
            );
            state
                .controller
                .set_error(response_frame.err_code, response_frame.err_info.clone());
            state.call_back();
            return;
        }

        {
            let mut response = state.response.lock().expect("call state lock");
            if let Err(e) = response.unmarshal(&response_frame.payload) {
                let err =
                    RpcError::Serialize(format!("failed to unmarshal response: {e}"));
                error!(msg_id = %msg_id, "{err}");
                drop(response);
                state.fail(&err);
                return;
            }
        }

        state.call_back();
    }

    /// Typed request/response wrapper over [`call_method`]: suspends until
    /// the controller reports completion and hands back the concrete
    /// response.
    ///
    /// [`call_method`]: RpcChannel::call_method
    pub async fn unary<Rsp>(
        self: &Arc<Self>,
        method_full_name: &str,
        controller: &Arc<RpcController>,
        request: &dyn RpcMessage,
    ) -> Result<Rsp>
    where
        Rsp: RpcMessage + Default,
    {
        let response = response_slot::<Rsp>();
        self.call_method(
            method_full_name,
            controller.clone(),
            request,
            response.clone(),
            None,
        );
        controller.wait_finished().await;

        let boxed: Box<dyn RpcMessage> = {
            let mut guard = response.lock().expect("response lock");
            std::mem::replace(&mut *guard, Box::new(Rsp::default()))
        };
        boxed
            .into_any()
            .downcast::<Rsp>()
            .map(|b| *b)
            .map_err(|_| anyhow!("response message type mismatch"))
    }
}
