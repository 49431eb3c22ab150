use anyhow::{Result, Context};
use async_trait::async_trait;
use redis::{Client, aio::MultiplexedConnection};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cli::config::TransportSettings;
use crate::cluster::messages::{CoordinatorMessage, WorkerMessage};
use super::ClusterTransport;

const COORDINATOR_INBOX: &str = "harvester:coordinator:inbox";

fn worker_inbox(worker_id: &str) -> String {
    format!("harvester:worker:{}:inbox", worker_id)
}

/// Transport over Redis lists, one list per inbox
pub struct RedisTransport {
    /// Inbox key TTL in seconds
    message_ttl: u64,

    /// Connection used for pushes
    send_conn: Arc<Mutex<MultiplexedConnection>>,

    /// Connection reserved for blocking pops
    recv_conn: Arc<Mutex<MultiplexedConnection>>,
}

impl RedisTransport {
    /// Connect to Redis
    pub async fn new(config: &TransportSettings) -> Result<Self> {
        let client = Client::open(config.redis_url.clone())
            .context(format!("Failed to connect to Redis at {}", config.redis_url))?;

        let send_conn = client.get_multiplexed_async_connection().await
            .context("Failed to get Redis connection")?;
        let recv_conn = client.get_multiplexed_async_connection().await
            .context("Failed to get Redis connection")?;

        Ok(Self {
            message_ttl: config.message_ttl_secs,
            send_conn: Arc::new(Mutex::new(send_conn)),
            recv_conn: Arc::new(Mutex::new(recv_conn)),
        })
    }

    async fn push<T: Serialize>(&self, key: &str, message: &T) -> Result<()> {
        let json = serde_json::to_string(message)
            .context("Failed to serialize message")?;

        let mut conn = self.send_conn.lock().await;

        redis::cmd("LPUSH")
            .arg(key)
            .arg(&json)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context(format!("Failed to push message to {}", key))?;

        // Abandoned inboxes expire
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(self.message_ttl)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context(format!("Failed to set TTL on {}", key))?;

        debug!("Pushed message to {}", key);

        Ok(())
    }

    async fn pop<T: DeserializeOwned>(&self, key: &str, wait: Duration) -> Result<Option<T>> {
        let mut conn = self.recv_conn.lock().await;

        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(key)
            .arg(wait.as_secs().max(1))
            .query_async(&mut *conn)
            .await
            .context(format!("Failed to pop message from {}", key))?;

        match popped {
            Some((_, json)) => {
                let message = serde_json::from_str(&json)
                    .context("Failed to deserialize message")?;
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ClusterTransport for RedisTransport {
    async fn send_to_coordinator(&self, message: &CoordinatorMessage) -> Result<()> {
        self.push(COORDINATOR_INBOX, message).await
    }

    async fn next_for_coordinator(&self, wait: Duration) -> Result<Option<CoordinatorMessage>> {
        self.pop(COORDINATOR_INBOX, wait).await
    }

    async fn send_to_worker(&self, worker_id: &str, message: &WorkerMessage) -> Result<()> {
        self.push(&worker_inbox(worker_id), message).await
    }

    async fn next_for_worker(&self, worker_id: &str, wait: Duration) -> Result<Option<WorkerMessage>> {
        self.pop(&worker_inbox(worker_id), wait).await
    }
}
