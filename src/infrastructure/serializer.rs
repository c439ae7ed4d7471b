//! Per-owner task serializer
//!
//! A serializer executes queued tasks one at a time, in submission order, on
//! a dedicated worker. Every session gets one, and so does every transfer
//! progress monitor; anything needing ordering guarantees around a session
//! pushes its work here instead of touching the session concurrently.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SerializerError {
    #[error("Serializer has stopped")]
    Stopped,
}

/// Handle to a single-consumer task queue
#[derive(Clone)]
pub struct Serializer {
    name: Arc<String>,
    tx: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl Serializer {
    /// Spawn a serializer worker with a unique name derived from `prefix`.
    pub fn new(prefix: &str) -> Self {
        let name = Arc::new(format!("{}/{}", prefix, Uuid::new_v4()));
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        let worker_name = name.clone();
        tokio::spawn(async move {
            debug!("Serializer '{}' started", worker_name);
            while let Some(task) = rx.recv().await {
                task.await;
            }
            debug!("Serializer '{}' stopped", worker_name);
        });
        Self { name, tx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a task without waiting for it to run.
    pub fn push<F>(&self, task: F) -> std::result::Result<(), SerializerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx
            .send(Box::pin(task))
            .map_err(|_| SerializerError::Stopped)
    }

    /// Queue a task and wait for its completion, returning its result.
    ///
    /// Must not be called from a task already running on this serializer,
    /// and the caller must not hold a lock the queued task needs.
    pub async fn push_synchronous<F, T>(&self, task: F) -> std::result::Result<T, SerializerError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.push(async move {
            let _ = done_tx.send(task.await);
        })?;
        done_rx.await.map_err(|_| SerializerError::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_tasks_run_in_submission_order() {
        let serializer = Serializer::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100u32 {
            let seen = seen.clone();
            serializer
                .push(async move {
                    seen.lock().unwrap().push(i);
                })
                .unwrap();
        }
        serializer.push_synchronous(async {}).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 100);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_push_synchronous_returns_value() {
        let serializer = Serializer::new("test");
        let value = serializer.push_synchronous(async { 7 + 35 }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_unique_names() {
        let a = Serializer::new("test");
        let b = Serializer::new("test");
        assert_ne!(a.name(), b.name());
    }
}
