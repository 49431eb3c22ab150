pub mod accountant;
pub mod coordinator;
pub mod limiter;
pub mod loader;
pub mod messages;
pub mod restarter;

use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

// Re-export common types
pub use accountant::{AccountantHandle, TaskLedger, Transition};
pub use coordinator::Coordinator;
pub use limiter::{LimiterHandle, SlotTable};
pub use loader::JobLoader;
pub use messages::{CoordinatorMessage, WorkerMessage};
pub use restarter::JobRestarter;

/// How long a caller waits for a single-owner unit to answer
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure to talk to a single-owner unit
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActorError {
    #[error("{0} is no longer running")]
    Closed(&'static str),

    #[error("{0} did not reply in time")]
    Timeout(&'static str),
}

/// Send a command carrying a reply channel and wait for the answer
pub(crate) async fn ask<C, T>(
    tx: &mpsc::Sender<C>,
    name: &'static str,
    command: impl FnOnce(oneshot::Sender<T>) -> C,
) -> Result<T, ActorError> {
    let (reply_tx, reply_rx) = oneshot::channel();

    tx.send(command(reply_tx))
        .await
        .map_err(|_| ActorError::Closed(name))?;

    match timeout(REPLY_TIMEOUT, reply_rx).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(ActorError::Closed(name)),
        Err(_) => Err(ActorError::Timeout(name)),
    }
}
