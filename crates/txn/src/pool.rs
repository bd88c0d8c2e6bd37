//! Named bounded task pools
//!
//! Long-running commit and cleanup work is dispatched off the coordinator
//! thread onto two dedicated pools so that no phase holds the transaction's
//! monitor while it waits on the store.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Bounded spawner: at most `size` tasks run concurrently, the rest queue
#[derive(Clone)]
pub struct TaskPool {
    name: &'static str,
    permits: Arc<Semaphore>,
}

impl TaskPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        Self {
            name,
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Spawn a task that runs once a pool slot frees up
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            // The semaphore is never closed, so acquire only fails on shutdown
            let _permit = permits.acquire_owned().await.ok();
            fut.await
        })
    }
}
