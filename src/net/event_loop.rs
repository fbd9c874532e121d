// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    cell::RefCell,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::runtime::{Builder, Runtime};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::debug;

thread_local! {
    static THREAD_EVENT_LOOP: RefCell<Option<Arc<EventLoop>>> = const { RefCell::new(None) };
}

/// A per-thread cooperative scheduler.
///
/// One event loop is bound to exactly one OS thread: `run()` blocks that
/// thread executing ready tasks, and every spawned task suspends only at
/// socket, timer, and waiter points. Tasks may be enqueued from any thread.
///
/// Without keep-alive, `run()` returns once the spawned tasks drain (the
/// shape a one-shot client main wants). I/O threads enable keep-alive so the
/// loop idles until `stop()`.
pub struct EventLoop {
    runtime: Runtime,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    keep_alive: AtomicBool,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build event loop runtime")?;
        Ok(Self {
            runtime,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            keep_alive: AtomicBool::new(false),
        })
    }

    /// The event loop bound to the calling thread, created on first access.
    pub fn for_current_thread() -> Result<Arc<EventLoop>> {
        THREAD_EVENT_LOOP.with(|slot| {
            let mut slot = slot.borrow_mut();
            if let Some(event_loop) = slot.as_ref() {
                return Ok(event_loop.clone());
            }
            let event_loop = Arc::new(EventLoop::new()?);
            *slot = Some(event_loop.clone());
            Ok(event_loop)
        })
    }

    /// Enqueues a task. The task runs on the loop's thread once `run()` is
    /// executing.
    pub fn spawn<F>(&self, fut: F)
    where F: Future<Output = ()> + Send + 'static {
        let _ = self.tracker.spawn_on(fut, self.runtime.handle());
    }

    /// Fires `f` after `delay`, repeatedly when `repeat` is set. The returned
    /// handle cancels the timer; a cancelled timer never runs `f` again and
    /// releases everything the closure captured.
    pub fn add_timer<F>(&self, delay: Duration, repeat: bool, mut f: F) -> TimerHandle
    where F: FnMut() + Send + 'static {
        let token = CancellationToken::new();
        let fired = token.clone();
        self.spawn(async move {
            loop {
                tokio::select! {
                    _ = fired.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {
                        f();
                        if !repeat {
                            break;
                        }
                    },
                }
            }
        });
        TimerHandle { token }
    }

    /// Blocks the current thread executing ready tasks. Returns when
    /// `stop()` is called, or, without keep-alive, when the task set drains.
    pub fn run(&self) {
        if self.keep_alive.load(Ordering::Relaxed) {
            self.runtime.block_on(self.shutdown.cancelled());
        } else {
            self.tracker.close();
            self.runtime.block_on(async {
                tokio::select! {
                    _ = self.tracker.wait() => {},
                    _ = self.shutdown.cancelled() => {},
                }
            });
        }
        debug!("event loop exited");
    }

    /// Signals termination; tasks suspended on timers or I/O observe the
    /// shutdown token and exit.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Keeps the loop running even when no tasks are pending.
    pub fn enable_keep_alive(&self) {
        self.keep_alive.store(true, Ordering::Relaxed);
    }

    /// Token that is cancelled when the loop stops; connection tasks tie
    /// their socket operations to it.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}

/// Cancellation handle for a timer created via [`EventLoop::add_timer`].
#[derive(Debug, Clone)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }
}
