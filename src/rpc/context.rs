// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Ambient per-task call context.
//!
//! The server dispatcher installs the inbound msg-id and method name here
//! before invoking a handler; any outbound call issued from inside that
//! handler inherits the msg-id unless the caller overrides it. This is what
//! lets one msg-id string a whole call chain together in the logs.

tokio::task_local! {
    static CALL_CONTEXT: CallContext;
}

#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub msg_id: String,
    pub method_name: String,
}

/// Runs `f` with `ctx` installed as the ambient context of the current task.
pub fn sync_scope<R>(ctx: CallContext, f: impl FnOnce() -> R) -> R {
    CALL_CONTEXT.sync_scope(ctx, f)
}

/// The msg-id propagated from an inbound call, if any.
pub fn current_msg_id() -> Option<String> {
    CALL_CONTEXT
        .try_with(|c| c.msg_id.clone())
        .ok()
        .filter(|id| !id.is_empty())
}

/// The method name of the inbound call being handled, if any.
pub fn current_method_name() -> Option<String> {
    CALL_CONTEXT
        .try_with(|c| c.method_name.clone())
        .ok()
        .filter(|name| !name.is_empty())
}
