//! Operation queue
//!
//! A bounded queue drained by a single background worker. Handlers either
//! finish a task or ask for it to be re-queued after a delay; the delay is
//! served off the worker so one slow task never stalls the others.

use std::sync::Arc;
use std::time::Duration;

use async_channel::{bounded, Receiver, Sender, TrySendError};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{LbaasError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    Retry(Duration),
}

#[async_trait]
pub trait TaskHandler<T>: Send + Sync {
    async fn handle(&self, task: &mut T) -> TaskOutcome;
}

pub struct OperationQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Clone for OperationQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T: Send + 'static> OperationQueue<T> {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }

    /// Enqueue, waiting for room when the queue is full
    pub async fn push(&self, task: T) -> Result<()> {
        self.tx
            .send(task)
            .await
            .map_err(|_| LbaasError::ServiceUnavailable("operation queue is closed".into()))
    }

    pub fn try_push(&self, task: T) -> Result<()> {
        self.tx.try_send(task).map_err(|e| match e {
            TrySendError::Full(_) => LbaasError::ServiceUnavailable("operation queue is full".into()),
            TrySendError::Closed(_) => {
                LbaasError::ServiceUnavailable("operation queue is closed".into())
            }
        })
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn close(&self) {
        self.tx.close();
    }

    pub fn spawn_worker(
        &self,
        handler: Arc<dyn TaskHandler<T>>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let tx = self.tx.clone();
        let rx = self.rx.clone();
        tokio::spawn(async move {
            info!("Operation queue worker started");
            loop {
                let mut task = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(task) => task,
                        Err(_) => break,
                    },
                };

                match handler.handle(&mut task).await {
                    TaskOutcome::Done => {}
                    TaskOutcome::Retry(delay) => {
                        debug!(delay_ms = delay.as_millis() as u64, "Re-queueing operation");
                        let tx = tx.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = shutdown.cancelled() => {}
                                _ = tokio::time::sleep(delay) => {
                                    if tx.send(task).await.is_err() {
                                        warn!("Dropped operation: queue closed while waiting to retry");
                                    }
                                }
                            }
                        });
                    }
                }
            }
            info!("Operation queue worker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Countdown {
        calls: AtomicUsize,
        done: tokio::sync::mpsc::UnboundedSender<u32>,
    }

    #[async_trait]
    impl TaskHandler<(u32, u32)> for Countdown {
        async fn handle(&self, task: &mut (u32, u32)) -> TaskOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if task.1 == 0 {
                let _ = self.done.send(task.0);
                TaskOutcome::Done
            } else {
                task.1 -= 1;
                TaskOutcome::Retry(Duration::from_millis(5))
            }
        }
    }

    #[tokio::test]
    async fn test_retries_until_done() {
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
        let handler = Arc::new(Countdown {
            calls: AtomicUsize::new(0),
            done: done_tx,
        });
        let queue = OperationQueue::bounded(8);
        let shutdown = CancellationToken::new();
        let worker = queue.spawn_worker(handler.clone(), shutdown.clone());

        queue.push((1, 2)).await.unwrap();
        queue.push((2, 0)).await.unwrap();

        let mut finished = vec![done_rx.recv().await.unwrap(), done_rx.recv().await.unwrap()];
        finished.sort();
        assert_eq!(finished, vec![1, 2]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);

        shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_and_closed_queue() {
        let queue: OperationQueue<u32> = OperationQueue::bounded(1);
        queue.try_push(1).unwrap();
        assert!(matches!(queue.try_push(2), Err(LbaasError::ServiceUnavailable(_))));
        assert_eq!(queue.len(), 1);
        queue.close();
        assert!(queue.push(3).await.is_err());
    }
}
