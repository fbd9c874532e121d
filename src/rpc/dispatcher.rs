// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{panic, panic::AssertUnwindSafe, sync::Arc};

use dashmap::DashMap;
use tracing::{debug, error, info};

use crate::{
    codec::tinypb::TinyPbFrame,
    error::RpcError,
    net::tcp_connection::TcpConnection,
    rpc::{
        context::{self, CallContext},
        controller::RpcController,
        service::{MethodDescriptor, RpcService},
    },
};

/// Maps full method names to handlers and drives decoded inbound frames
/// through them.
#[derive(Default)]
pub struct RpcDispatcher {
    methods: DashMap<String, MethodDescriptor>,
}

impl RpcDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Installs one registry entry per method the service exposes.
    pub fn register_service<S: RpcService>(&self, service: Arc<S>) {
        let name = service.service_name();
        for descriptor in service.method_descriptors() {
            info!(method = %descriptor.full_name, service = name, "registered rpc method");
            self.methods
                .insert(descriptor.full_name.clone(), descriptor);
        }
    }

    pub fn has_method(&self, full_name: &str) -> bool {
        self.methods.contains_key(full_name)
    }

    /// Decode -> method lookup -> handler -> reply.
    ///
    /// Handler panics are contained and travel back as an in-frame error;
    /// the connection stays up.
    pub fn dispatch(&self, request: TinyPbFrame, connection: &Arc<TcpConnection>) {
        let mut response = TinyPbFrame {
            msg_id: request.msg_id.clone(),
            method_name: request.method_name.clone(),
            ..TinyPbFrame::default()
        };

        let Some(entry) = self
            .methods
            .get(&request.method_name)
            .map(|e| e.value().clone())
        else {
            let err = RpcError::MethodNotFound(request.method_name.clone());
            error!(msg_id = %request.msg_id, method = %request.method_name, "{err}");
            response.set_error(err.code(), err.to_string());
            connection.reply(vec![response]);
            return;
        };

        let mut request_msg = (entry.new_request)();
        if let Err(e) = request_msg.unmarshal(&request.payload) {
            let err = RpcError::Serialize(format!("failed to unmarshal request: {e}"));
            error!(msg_id = %request.msg_id, method = %request.method_name, "{err}");
            response.set_error(err.code(), err.to_string());
            connection.reply(vec![response]);
            return;
        }

        let mut response_msg = (entry.new_response)();
        let controller = RpcController::new();
        controller.set_msg_id(request.msg_id.clone());
        controller.set_peer_addr(connection.peer_addr());
        controller.set_local_addr(connection.local_addr());

        debug!(
            msg_id = %request.msg_id,
            method = %request.method_name,
            peer = %connection.peer_addr(),
            "dispatching request"
        );

        // The ambient context makes the inbound msg-id visible to log
        // statements and to outbound calls issued by the handler.
        let ctx = CallContext {
            msg_id: request.msg_id.clone(),
            method_name: request.method_name.clone(),
        };
        let outcome = context::sync_scope(ctx, || {
            panic::catch_unwind(AssertUnwindSafe(|| {
                (entry.handler)(request_msg.as_ref(), response_msg.as_mut(), &controller)
            }))
        });

        match outcome {
            Ok(()) => {
                if controller.failed() {
                    response.set_error(controller.error_code(), controller.error_info());
                } else {
                    match response_msg.marshal() {
                        Ok(payload) => response.payload = payload.into(),
                        Err(e) => {
                            let err = RpcError::Serialize(format!(
                                "failed to marshal response: {e}"
                            ));
                            error!(msg_id = %request.msg_id, "{err}");
                            response.set_error(err.code(), err.to_string());
                        },
                    }
                }
            },
            Err(panic_payload) => {
                let message = panic_message(&panic_payload);
                let err = RpcError::Handler(message);
                error!(
                    msg_id = %request.msg_id,
                    method = %request.method_name,
                    "handler panicked: {err}"
                );
                response.set_error(err.code(), err.to_string());
            },
        }

        connection.reply(vec![response]);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
