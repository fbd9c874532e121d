// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    any::Any,
    sync::{Arc, Mutex},
};

use anyhow::Result;

use crate::rpc::controller::RpcController;

/// An RPC payload message behind an opaque serializer.
///
/// Generated message types implement this pair of operations; the runtime
/// never looks inside the bytes. `as_any`/`into_any` let concrete handlers
/// and stubs recover their typed messages.
pub trait RpcMessage: Send + Sync + 'static {
    fn marshal(&self) -> Result<Vec<u8>>;
    fn unmarshal(&mut self, data: &[u8]) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Shared slot a call's response message is unmarshalled into.
pub type ResponseSlot = Arc<Mutex<Box<dyn RpcMessage>>>;

/// Builds a response slot around a default-constructed message.
pub fn response_slot<M: RpcMessage + Default>() -> ResponseSlot {
    Arc::new(Mutex::new(Box::new(M::default())))
}

/// Synchronous method handler: request in, response out, errors through the
/// controller.
pub type MethodHandler =
    Arc<dyn Fn(&dyn RpcMessage, &mut dyn RpcMessage, &RpcController) + Send + Sync>;

/// One entry of the method registry: message factories plus the handler.
#[derive(Clone)]
pub struct MethodDescriptor {
    /// Full method name as it travels on the wire, e.g. `Order.makeOrder`.
    pub full_name: String,
    pub new_request: fn() -> Box<dyn RpcMessage>,
    pub new_response: fn() -> Box<dyn RpcMessage>,
    pub handler: MethodHandler,
}

/// A service implementation enumerating its callable methods.
pub trait RpcService: Send + Sync + 'static {
    /// Service name, the first component of every full method name.
    fn service_name(&self) -> &'static str;

    /// One descriptor per method this service exposes.
    fn method_descriptors(self: Arc<Self>) -> Vec<MethodDescriptor>;
}

/// Builds the full method name `Service.method`.
pub fn full_method_name(service: &str, method: &str) -> String {
    format!("{service}.{method}")
}
