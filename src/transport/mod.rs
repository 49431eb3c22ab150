pub mod local;
pub mod redis;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::config::TransportSettings;
use crate::cluster::messages::{CoordinatorMessage, WorkerMessage};

pub use local::LocalTransport;
pub use self::redis::RedisTransport;

/// Message transport between the coordinator and its workers
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Deliver a message to the coordinator inbox
    async fn send_to_coordinator(&self, message: &CoordinatorMessage) -> Result<()>;

    /// Wait up to `wait` for the next coordinator message
    async fn next_for_coordinator(&self, wait: Duration) -> Result<Option<CoordinatorMessage>>;

    /// Deliver a message to a worker inbox
    async fn send_to_worker(&self, worker_id: &str, message: &WorkerMessage) -> Result<()>;

    /// Wait up to `wait` for the next message addressed to a worker
    async fn next_for_worker(&self, worker_id: &str, wait: Duration) -> Result<Option<WorkerMessage>>;
}

/// Factory for creating a ClusterTransport implementation
pub struct TransportFactory;

impl TransportFactory {
    pub async fn create(settings: &TransportSettings) -> Result<Arc<dyn ClusterTransport>> {
        match settings.transport_type.as_str() {
            "redis" => Ok(Arc::new(RedisTransport::new(settings).await?)),
            "local" => Ok(Arc::new(LocalTransport::new())),
            _ => anyhow::bail!("Unsupported transport type: {}", settings.transport_type),
        }
    }
}
