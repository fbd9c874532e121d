// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Wire-level error codes carried in the `err_code` field of a TinyPB frame
/// and surfaced through [`crate::rpc::controller::RpcController`].
pub mod error_code {
    pub const OK: i32 = 0;
    /// `call_method` invoked without controller/request/response wired up.
    pub const ERROR_RPC_CHANNEL_INIT: i32 = 10001;
    /// Every candidate endpoint was the unspecified sentinel.
    pub const ERROR_RPC_PEER_ADDR: i32 = 10002;
    /// TCP connect to the selected endpoint failed.
    pub const ERROR_TCP_CONNECT: i32 = 10003;
    /// Marshal or unmarshal of a payload failed.
    pub const ERROR_FAILED_SERIALIZE: i32 = 10004;
    /// The per-call timeout elapsed before a response arrived.
    pub const ERROR_RPC_CALL_TIMEOUT: i32 = 10005;
    /// The server dispatcher has no handler for the requested method.
    pub const ERROR_METHOD_NOT_FOUND: i32 = 10006;
    /// The handler panicked; the message is preserved, the connection is not.
    pub const ERROR_HANDLER_UNKNOWN: i32 = 10007;
}

/// The per-call failure kinds of the RPC runtime.
///
/// The first five are fatal to the call and never leave the client process;
/// `MethodNotFound` and `Handler` travel back inside the response frame.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("rpc channel init error: {0}")]
    ChannelInit(String),

    #[error("no usable peer address: {0}")]
    PeerAddrUnavailable(String),

    #[error("tcp connect error: {0}")]
    Connect(String),

    #[error("serialize error: {0}")]
    Serialize(String),

    #[error("rpc call timeout {0}")]
    CallTimeout(u64),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("handler error: {0}")]
    Handler(String),
}

impl RpcError {
    pub fn code(&self) -> i32 {
        match self {
            RpcError::ChannelInit(_) => error_code::ERROR_RPC_CHANNEL_INIT,
            RpcError::PeerAddrUnavailable(_) => error_code::ERROR_RPC_PEER_ADDR,
            RpcError::Connect(_) => error_code::ERROR_TCP_CONNECT,
            RpcError::Serialize(_) => error_code::ERROR_FAILED_SERIALIZE,
            RpcError::CallTimeout(_) => error_code::ERROR_RPC_CALL_TIMEOUT,
            RpcError::MethodNotFound(_) => error_code::ERROR_METHOD_NOT_FOUND,
            RpcError::Handler(_) => error_code::ERROR_HANDLER_UNKNOWN,
        }
    }
}
