//! Bounded concurrency execution of node channel dispatches.

use std::{future::Future, sync::Arc};

use tokio::{
    runtime::Handle,
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};

use crate::config::SinkConfig;

/// A shared pool bounding the number of RPC dispatches in flight across all
/// node channels of a sink.
///
/// Acquiring a [`DispatchToken`] never waits: when the pool is exhausted the
/// caller skips dispatching and tries again on its next tick.
#[derive(Debug, Clone)]
pub struct DispatchPool {
    handle: Handle,
    permits: Arc<Semaphore>,
}

impl DispatchPool {
    /// Initialise a pool of `max_concurrency` tokens (at least one) spawning
    /// onto the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn new(max_concurrency: usize) -> Self {
        Self::with_handle(Handle::current(), max_concurrency)
    }

    /// A pool sized by [`SinkConfig::dispatch_concurrency`].
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn from_config(config: &SinkConfig) -> Self {
        Self::new(config.dispatch_concurrency)
    }

    pub fn with_handle(handle: Handle, max_concurrency: usize) -> Self {
        Self {
            handle,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Take a dispatch token if one is free.
    pub fn try_acquire(&self) -> Option<DispatchToken> {
        let permit = Arc::clone(&self.permits).try_acquire_owned().ok()?;
        Some(DispatchToken {
            permit,
            handle: self.handle.clone(),
        })
    }

    /// The number of free tokens.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Spawn a task outside of the concurrency bound, used for background
    /// work that must not compete with dispatches for tokens.
    pub fn spawn_untracked<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(fut)
    }
}

/// The right to run one dispatch; the token is released when the spawned
/// task completes or is aborted.
#[derive(Debug)]
pub struct DispatchToken {
    permit: OwnedSemaphorePermit,
    handle: Handle,
}

impl DispatchToken {
    pub fn spawn<F>(self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = self.permit;
        self.handle.spawn(async move {
            let _permit = permit;
            fut.await
        })
    }
}
