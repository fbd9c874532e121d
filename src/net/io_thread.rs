// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc,
    },
    thread,
};

use anyhow::{Context, Result, ensure};
use tracing::{debug, error};

use crate::net::{event_loop::EventLoop, tcp_connection::TcpConnection};

/// An OS thread running one keep-alive event loop.
///
/// Startup is a two-step handshake mirroring a pair of binary semaphores:
/// the worker builds its loop and hands it back (`created`), then parks until
/// the coordinator releases it into `run()` (`go`).
pub struct IoThread {
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    event_loop: Arc<EventLoop>,
    go_tx: Mutex<Option<mpsc::Sender<()>>>,
    pending: Arc<PendingQueue>,
}

struct PendingQueue {
    queue: Mutex<VecDeque<Arc<TcpConnection>>>,
    drain_scheduled: AtomicBool,
}

impl IoThread {
    pub fn new() -> Result<Self> {
        let (created_tx, created_rx) = mpsc::channel::<Arc<EventLoop>>();
        let (go_tx, go_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name("rocket-io".to_string())
            .spawn(move || {
                let event_loop = match EventLoop::for_current_thread() {
                    Ok(el) => el,
                    Err(e) => {
                        error!("io thread failed to build event loop: {e:#}");
                        return;
                    },
                };
                event_loop.enable_keep_alive();
                if created_tx.send(event_loop.clone()).is_err() {
                    return;
                }
                debug!("io thread created, waiting for start");
                // Blocks until the coordinator releases all workers.
                if go_rx.recv().is_err() {
                    return;
                }
                debug!("io thread entering loop");
                event_loop.run();
                debug!("io thread leaving loop");
            })
            .context("failed to spawn io thread")?;

        let event_loop = created_rx
            .recv()
            .context("io thread exited before handshake")?;

        Ok(Self {
            handle: Mutex::new(Some(handle)),
            event_loop,
            go_tx: Mutex::new(Some(go_tx)),
            pending: Arc::new(PendingQueue {
                queue: Mutex::new(VecDeque::new()),
                drain_scheduled: AtomicBool::new(false),
            }),
        })
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// Releases the worker into its run loop.
    pub fn start(&self) {
        if let Some(go) = self.go_tx.lock().expect("io thread go lock").take() {
            let _ = go.send(());
        }
    }

    /// Hands an accepted connection to this thread. The read/write tasks must
    /// launch on the thread that owns the loop they will run on, so the
    /// acceptor only enqueues; a one-shot drain task posted to the loop calls
    /// `start()` on each entry.
    pub fn enqueue_pending(&self, connection: Arc<TcpConnection>) {
        {
            let mut queue = self.pending.queue.lock().expect("pending queue lock");
            queue.push_back(connection);
        }

        // Only the false -> true winner posts the drain task.
        if self
            .pending
            .drain_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let pending = self.pending.clone();
            self.event_loop.spawn(async move {
                pending.drain_scheduled.store(false, Ordering::Release);
                let drained: Vec<_> = {
                    let mut queue = pending.queue.lock().expect("pending queue lock");
                    queue.drain(..).collect()
                };
                for connection in drained {
                    debug!(peer = %connection.peer_addr(), "starting pending connection");
                    connection.start();
                }
            });
        }
    }

    /// Stops the loop and joins the thread.
    pub fn stop(&self) {
        // A worker still parked on the go semaphore must be released first.
        self.start();
        self.event_loop.stop();
        if let Some(handle) = self.handle.lock().expect("io thread join lock").take() {
            let _ = handle.join();
        }
    }
}

/// Fixed-size group of I/O threads; connections are distributed round-robin.
pub struct IoThreadPool {
    threads: Vec<IoThread>,
    index: AtomicUsize,
}

impl IoThreadPool {
    pub fn new(size: usize) -> Result<Self> {
        ensure!(size >= 1, "io thread pool size must be >= 1");
        let mut threads = Vec::with_capacity(size);
        for _ in 0..size {
            threads.push(IoThread::new()?);
        }
        Ok(Self {
            threads,
            index: AtomicUsize::new(0),
        })
    }

    /// Releases every worker into its run loop.
    pub fn start(&self) {
        for thread in &self.threads {
            thread.start();
        }
    }

    /// The next I/O thread by round-robin, the only distribution policy.
    pub fn next(&self) -> &IoThread {
        let i = self.index.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        &self.threads[i]
    }

    pub fn size(&self) -> usize {
        self.threads.len()
    }

    pub fn stop(&self) {
        for thread in &self.threads {
            thread.stop();
        }
    }
}
