//! Bounded work queues feeding handler workers
//!
//! A queue admits at most `depth` items that are queued or still running.
//! `submit` waits for room, `try_submit` refuses instead.

use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;

/// Dispatch errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    #[error("{0} queue is full")]
    QueueFull(&'static str),

    #[error("{0} queue is closed")]
    Closed(&'static str),
}

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Worker count for a configured value; 0 picks `multiplier` per available core
pub fn resolve_worker_count(configured: usize, multiplier: usize) -> usize {
    if configured > 0 {
        return configured;
    }
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores * multiplier.max(1)
}

struct Queued<T> {
    item: T,
    _permit: OwnedSemaphorePermit,
}

/// Bounded multi-worker queue
pub struct DispatchQueue<T> {
    name: &'static str,
    depth: usize,
    sender: mpsc::Sender<Queued<T>>,
    permits: Arc<Semaphore>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> DispatchQueue<T> {
    /// Start `workers` tasks draining a queue of `depth` items through `process`
    pub fn start<F, Fut>(name: &'static str, workers: usize, depth: usize, process: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let depth = depth.max(1);
        let (sender, receiver) = mpsc::channel::<Queued<T>>(depth);
        let receiver = Arc::new(Mutex::new(receiver));
        let process = Arc::new(process);

        let workers = (0..workers.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let process = process.clone();
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(queued) = next else {
                            break;
                        };

                        let Queued {
                            item,
                            _permit: permit,
                        } = queued;
                        // A panicking item must not take the worker down with it
                        if let Err(e) = tokio::spawn((*process)(item)).await {
                            if e.is_panic() {
                                tracing::error!("{} worker {}: task panicked", name, worker);
                            }
                        }
                        drop(permit);
                    }
                    tracing::debug!("{} worker {} stopped", name, worker);
                })
            })
            .collect();

        Self {
            name,
            depth,
            sender,
            permits: Arc::new(Semaphore::new(depth)),
            workers,
        }
    }

    /// Queue an item, waiting while the queue is full
    pub async fn submit(&self, item: T) -> DispatchResult<()> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::Closed(self.name))?;
        self.enqueue(item, permit).await
    }

    /// Queue an item if there is room right now
    pub fn try_submit(&self, item: T) -> DispatchResult<()> {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return Err(DispatchError::QueueFull(self.name)),
            Err(TryAcquireError::Closed) => return Err(DispatchError::Closed(self.name)),
        };
        self.sender
            .try_send(Queued {
                item,
                _permit: permit,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull(self.name),
                mpsc::error::TrySendError::Closed(_) => DispatchError::Closed(self.name),
            })
    }

    async fn enqueue(&self, item: T, permit: OwnedSemaphorePermit) -> DispatchResult<()> {
        self.sender
            .send(Queued {
                item,
                _permit: permit,
            })
            .await
            .map_err(|_| DispatchError::Closed(self.name))
    }

    /// Items queued or running
    pub fn pending(&self) -> usize {
        self.depth - self.permits.available_permits()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Refuse new items; queued items still run
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}
