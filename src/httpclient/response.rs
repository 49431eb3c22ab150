use anyhow::{Result, Context};
use reqwest::header::HeaderMap;
use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::domain::{RetrievalOutcome, RetrieveState, Task, TaskId, JobId};

/// Where the body of a response is kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    MemoryStorage,
    DiskStorage,
    NoStorage,
}

/// Progress of one retrieval attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalState {
    Initial,
    Connecting,
    StatusReceived,
    HeadersReceived,
    Completed,
    Error,
    FinishedTimeLimit,
    FinishedSizeLimit,
    FinishedRateLimit,
}

impl RetrievalState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RetrievalState::Completed
                | RetrievalState::Error
                | RetrievalState::FinishedTimeLimit
                | RetrievalState::FinishedSizeLimit
                | RetrievalState::FinishedRateLimit
        )
    }

    fn as_retrieve_state(self) -> RetrieveState {
        match self {
            RetrievalState::Completed => RetrieveState::Success,
            RetrievalState::FinishedTimeLimit => RetrieveState::FinishedTimeLimit,
            RetrievalState::FinishedSizeLimit => RetrieveState::FinishedSizeLimit,
            RetrievalState::FinishedRateLimit => RetrieveState::FinishedRateLimit,
            // An attempt that never reached a terminal state did not complete
            _ => RetrieveState::Error,
        }
    }
}

/// Body sink selected from the configured response type
#[derive(Debug)]
enum BodySink {
    Memory(Vec<u8>),
    Disk { path: PathBuf, file: Option<File> },
    Discard,
}

/// Mutable record of one download attempt
#[derive(Debug)]
pub struct RetrievalResponse {
    pub task_id: TaskId,

    pub job_id: JobId,

    pub url: String,

    state: RetrievalState,

    pub http_status: Option<u16>,

    /// Resolved address of the remote host
    pub source_ip: String,

    /// Lower-cased response headers
    pub headers: BTreeMap<String, String>,

    pub bytes_read: u64,

    pub connection_setup: Duration,

    pub duration: Duration,

    pub log: Option<String>,

    pub error: Option<String>,

    sink: BodySink,

    closes: u32,

    released: bool,
}

impl RetrievalResponse {
    /// Create an empty response for a task
    pub fn new(task: &Task, response_type: ResponseType, path_to_save: &Path) -> Self {
        let sink = match response_type {
            ResponseType::MemoryStorage => BodySink::Memory(Vec::new()),
            ResponseType::DiskStorage => BodySink::Disk {
                path: path_to_save.join(&task.job_id).join(&task.id),
                file: None,
            },
            ResponseType::NoStorage => BodySink::Discard,
        };

        Self {
            task_id: task.id.clone(),
            job_id: task.job_id.clone(),
            url: task.url.clone(),
            state: RetrievalState::Initial,
            http_status: None,
            source_ip: String::new(),
            headers: BTreeMap::new(),
            bytes_read: 0,
            connection_setup: Duration::ZERO,
            duration: Duration::ZERO,
            log: None,
            error: None,
            sink,
            closes: 0,
            released: false,
        }
    }

    pub fn state(&self) -> RetrievalState {
        self.state
    }

    /// Move to an intermediate state; ignored once the attempt is terminal
    pub fn advance(&mut self, state: RetrievalState) {
        if !self.state.is_terminal() {
            self.state = state;
        }
    }

    /// Set the terminal state. The first terminal state wins, so a threshold trip
    /// is never replaced by an error raised while aborting.
    pub fn finish(&mut self, state: RetrievalState, log: impl Into<String>) -> bool {
        if self.state.is_terminal() {
            debug!("Ignoring {:?} for {}: already {:?}", state, self.url, self.state);
            return false;
        }
        self.state = state;
        let log = log.into();
        if !log.is_empty() {
            self.log = Some(log);
        }
        true
    }

    /// Record a transport fault, keeping any earlier terminal state
    pub fn fail(&mut self, error: impl Into<String>) {
        let error = error.into();
        if self.finish(RetrievalState::Error, error.clone()) {
            self.error = Some(error);
        }
    }

    /// Store the response headers, lower-casing names and joining repeats
    pub fn record_headers(&mut self, headers: &HeaderMap) {
        for (name, value) in headers {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            self.headers
                .entry(name.as_str().to_lowercase())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }

    /// Append a body chunk to the sink
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.bytes_read += chunk.len() as u64;

        match &mut self.sink {
            BodySink::Memory(buffer) => buffer.extend_from_slice(chunk),
            BodySink::Disk { path, file } => {
                if file.is_none() {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)
                            .await
                            .context(format!("Failed to create directory: {}", parent.display()))?;
                    }
                    let created = File::create(&*path)
                        .await
                        .context(format!("Failed to create response file: {}", path.display()))?;
                    *file = Some(created);
                }
                if let Some(file) = file {
                    file.write_all(chunk)
                        .await
                        .context(format!("Failed to write response file: {}", path.display()))?;
                }
            }
            BodySink::Discard => {}
        }

        Ok(())
    }

    /// Finalise the sink. Only the first call has an effect.
    pub async fn close(&mut self) -> Result<()> {
        if self.closes > 0 {
            return Ok(());
        }
        self.closes += 1;

        if let BodySink::Disk { path, file } = &mut self.sink {
            if let Some(mut file) = file.take() {
                file.flush()
                    .await
                    .context(format!("Failed to flush response file: {}", path.display()))?;
            }
        }

        debug!("Closed response for {} ({} bytes)", self.url, self.bytes_read);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closes > 0
    }

    /// How many times the sink was actually finalised
    pub fn close_count(&self) -> u32 {
        self.closes
    }

    /// Whether a body is available for processing
    pub fn has_body(&self) -> bool {
        match &self.sink {
            BodySink::Memory(_) => self.bytes_read > 0,
            BodySink::Disk { .. } => self.bytes_read > 0 && !self.released,
            BodySink::Discard => false,
        }
    }

    /// Read the stored body back
    pub async fn content(&self) -> Result<Option<Vec<u8>>> {
        match &self.sink {
            BodySink::Memory(buffer) => Ok(Some(buffer.clone())),
            BodySink::Disk { path, .. } => {
                if self.bytes_read == 0 || self.released {
                    return Ok(None);
                }
                let bytes = fs::read(path)
                    .await
                    .context(format!("Failed to read response file: {}", path.display()))?;
                Ok(Some(bytes))
            }
            BodySink::Discard => Ok(None),
        }
    }

    /// Reclaim storage held by the body
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        match &mut self.sink {
            BodySink::Memory(buffer) => {
                buffer.clear();
                buffer.shrink_to_fit();
            }
            BodySink::Disk { path, file } => {
                file.take();
                if self.bytes_read > 0 {
                    if let Err(e) = fs::remove_file(&*path).await {
                        warn!("Failed to remove response file {}: {}", path.display(), e);
                    }
                }
            }
            BodySink::Discard => {}
        }
    }

    /// Summary sent to the coordinator
    pub fn outcome(&self) -> RetrievalOutcome {
        RetrievalOutcome {
            state: self.state.as_retrieve_state(),
            http_status: self.http_status,
            source_ip: self.source_ip.clone(),
            headers: self.headers.clone(),
            bytes_read: self.bytes_read,
            duration_ms: self.duration.as_millis() as u64,
            connection_setup_ms: self.connection_setup.as_millis() as u64,
            log: self.log.clone(),
            error: self.error.clone(),
        }
    }
}

impl Drop for RetrievalResponse {
    // Attempts aborted before `release` leave no body on disk
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let BodySink::Disk { path, file } = &mut self.sink {
            file.take();
            if self.bytes_read > 0 {
                if let Err(e) = std::fs::remove_file(&*path) {
                    warn!("Failed to remove response file {}: {}", path.display(), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskLimits, TaskType};
    use reqwest::header::HeaderValue;

    fn task() -> Task {
        Task {
            id: "task-1".to_string(),
            job_id: "job-1".to_string(),
            reference_id: "ref-1".to_string(),
            url: "http://a.org/x".to_string(),
            host: "a.org".to_string(),
            task_type: TaskType::UnconditionalDownload,
            sub_tasks: vec![],
            limits: TaskLimits::default(),
            previous_headers: BTreeMap::new(),
        }
    }

    #[test]
    fn test_first_terminal_state_wins() {
        let mut response = RetrievalResponse::new(&task(), ResponseType::NoStorage, Path::new("."));

        response.advance(RetrievalState::Connecting);
        assert!(response.finish(RetrievalState::FinishedSizeLimit, "size limit"));
        response.fail("connection reset");
        response.advance(RetrievalState::HeadersReceived);

        assert_eq!(response.state(), RetrievalState::FinishedSizeLimit);
        assert_eq!(response.error, None);
        assert_eq!(response.outcome().state, RetrieveState::FinishedSizeLimit);
    }

    #[test]
    fn test_headers_are_lower_cased_and_joined() {
        let mut headers = HeaderMap::new();
        headers.append("ETag", HeaderValue::from_static("\"v1\""));
        headers.append("Set-Cookie", HeaderValue::from_static("a=1"));
        headers.append("Set-Cookie", HeaderValue::from_static("b=2"));

        let mut response = RetrievalResponse::new(&task(), ResponseType::NoStorage, Path::new("."));
        response.record_headers(&headers);

        assert_eq!(response.headers.get("etag").map(String::as_str), Some("\"v1\""));
        assert_eq!(response.headers.get("set-cookie").map(String::as_str), Some("a=1, b=2"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut response = RetrievalResponse::new(&task(), ResponseType::MemoryStorage, Path::new("."));
        response.write(b"abc").await.unwrap();

        response.close().await.unwrap();
        response.close().await.unwrap();

        assert_eq!(response.close_count(), 1);
        assert_eq!(response.content().await.unwrap(), Some(b"abc".to_vec()));
    }

    #[tokio::test]
    async fn test_disk_storage_write_and_release() {
        let dir = std::env::temp_dir().join(format!("harvester-response-{}", uuid::Uuid::new_v4()));
        let mut response = RetrievalResponse::new(&task(), ResponseType::DiskStorage, &dir);

        response.write(b"hello ").await.unwrap();
        response.write(b"world").await.unwrap();
        response.close().await.unwrap();

        let path = dir.join("job-1").join("task-1");
        assert!(path.exists());
        assert!(response.has_body());
        assert_eq!(response.content().await.unwrap(), Some(b"hello world".to_vec()));

        response.release().await;
        assert!(!path.exists());
        assert!(!response.has_body());

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_dropped_response_removes_disk_body() {
        let dir = std::env::temp_dir().join(format!("harvester-response-{}", uuid::Uuid::new_v4()));
        let mut response = RetrievalResponse::new(&task(), ResponseType::DiskStorage, &dir);
        response.write(b"partial").await.unwrap();

        let path = dir.join("job-1").join("task-1");
        assert!(path.exists());

        drop(response);
        assert!(!path.exists());

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_no_storage_only_counts() {
        let mut response = RetrievalResponse::new(&task(), ResponseType::NoStorage, Path::new("."));
        response.write(&[0u8; 64]).await.unwrap();

        assert_eq!(response.bytes_read, 64);
        assert!(!response.has_body());
        assert_eq!(response.content().await.unwrap(), None);
    }
}
