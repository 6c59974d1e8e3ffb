//! Execution context selection.
//!
//! A server schedules all network work either on a runtime the caller owns
//! (via its [`Handle`]) or on a [`WorkerPool`] it creates and owns itself.
//! Only the owned variant is ever shut down by the server.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};

use crate::error::ServerError;

/// Name given to owned worker threads.
pub const WORKER_THREAD_NAME: &str = "hearth-worker";

/// Where a server runs its accept loop and connection tasks.
#[derive(Debug)]
pub enum ExecutionContext {
    /// Caller-owned runtime; never stopped by the server.
    External(Handle),
    /// Server-owned pool; stopped and joined when the server is dropped.
    Owned(WorkerPool),
}

impl ExecutionContext {
    pub fn handle(&self) -> Handle {
        match self {
            ExecutionContext::External(handle) => handle.clone(),
            ExecutionContext::Owned(pool) => pool.handle(),
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, ExecutionContext::Owned(_))
    }
}

/// Multi-threaded tokio runtime with a fixed number of worker threads.
#[derive(Debug)]
pub struct WorkerPool {
    // Taken only in `Drop`.
    runtime: Option<Runtime>,
    handle: Handle,
    size: usize,
    live: Arc<AtomicUsize>,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    pub fn new(size: usize, shutdown_timeout: Duration) -> Result<Self, ServerError> {
        if size == 0 {
            return Err(ServerError::InvalidThreadCount);
        }

        let live = Arc::new(AtomicUsize::new(0));
        let started = Arc::clone(&live);
        let stopped = Arc::clone(&live);

        let runtime = Builder::new_multi_thread()
            .worker_threads(size)
            // Nothing runs on the blocking pool; keep the thread count exact.
            .max_blocking_threads(1)
            .thread_name(WORKER_THREAD_NAME)
            .on_thread_start(move || {
                started.fetch_add(1, Ordering::SeqCst);
            })
            .on_thread_stop(move || {
                stopped.fetch_sub(1, Ordering::SeqCst);
            })
            .enable_all()
            .build()
            .map_err(ServerError::Runtime)?;

        tracing::debug!(threads = size, "Started worker pool");

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            size,
            live,
            shutdown_timeout,
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Configured worker thread count.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Shared counter of pool threads currently alive.
    pub fn live_threads(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.live)
    }

    /// Run a future to completion on the pool from a non-async thread.
    pub(crate) fn block_on<F: std::future::Future>(&self, future: F) -> io::Result<F::Output> {
        if Handle::try_current().is_ok() {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "cannot block on worker pool from inside a runtime",
            ));
        }
        match &self.runtime {
            Some(runtime) => Ok(runtime.block_on(future)),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "worker pool stopped")),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };

        if Handle::try_current().is_ok() {
            // Joining threads from inside a runtime would panic.
            tracing::warn!("Worker pool dropped inside an async context, detaching threads");
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(self.shutdown_timeout);
            tracing::debug!(threads = self.size, "Worker pool stopped");
        }
    }
}
