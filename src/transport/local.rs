use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use crate::cluster::messages::{CoordinatorMessage, WorkerMessage};
use super::ClusterTransport;

type Inbox<T> = (mpsc::UnboundedSender<T>, Arc<Mutex<mpsc::UnboundedReceiver<T>>>);

fn inbox<T>() -> Inbox<T> {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Arc::new(Mutex::new(rx)))
}

/// In-process transport over tokio channels
pub struct LocalTransport {
    coordinator: Inbox<CoordinatorMessage>,
    workers: Mutex<HashMap<String, Inbox<WorkerMessage>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            coordinator: inbox(),
            workers: Mutex::new(HashMap::new()),
        }
    }

    async fn worker_inbox(&self, worker_id: &str) -> Inbox<WorkerMessage> {
        let mut workers = self.workers.lock().await;
        let entry = workers.entry(worker_id.to_string()).or_insert_with(inbox);
        (entry.0.clone(), entry.1.clone())
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

async fn receive<T>(rx: &Mutex<mpsc::UnboundedReceiver<T>>, wait: Duration) -> Option<T> {
    let mut rx = rx.lock().await;
    timeout(wait, rx.recv()).await.ok().flatten()
}

#[async_trait]
impl ClusterTransport for LocalTransport {
    async fn send_to_coordinator(&self, message: &CoordinatorMessage) -> Result<()> {
        self.coordinator
            .0
            .send(message.clone())
            .map_err(|_| anyhow::anyhow!("Coordinator inbox is closed"))
    }

    async fn next_for_coordinator(&self, wait: Duration) -> Result<Option<CoordinatorMessage>> {
        Ok(receive(&self.coordinator.1, wait).await)
    }

    async fn send_to_worker(&self, worker_id: &str, message: &WorkerMessage) -> Result<()> {
        let (tx, _) = self.worker_inbox(worker_id).await;
        tx.send(message.clone())
            .map_err(|_| anyhow::anyhow!("Inbox of worker {} is closed", worker_id))
    }

    async fn next_for_worker(&self, worker_id: &str, wait: Duration) -> Result<Option<WorkerMessage>> {
        let (_, rx) = self.worker_inbox(worker_id).await;
        Ok(receive(&rx, wait).await)
    }
}
