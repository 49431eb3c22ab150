use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cluster::messages::CoordinatorMessage;
use crate::cluster::REPLY_TIMEOUT;
use crate::domain::{RetrieveState, SubTaskStats, Task, TaskId, TaskResult};
use crate::httpclient::{RetrievalEngine, RetrievalState};
use crate::storage::MediaStorage;
use crate::transport::ClusterTransport;
use super::processing::{process, MediaProcessor};
use super::supervisor::SupervisorEvent;
use super::watchdog::Activity;

/// Commands accepted by the executor
#[derive(Debug)]
pub enum ExecutorCommand {
    Execute(Task),
    Heartbeat,
    RequestTasks,
    SlotReply { request_id: u64, granted: bool },
}

/// Tasks handed to the executor and not yet reported to the coordinator
pub type Outstanding = Arc<Mutex<HashMap<TaskId, Task>>>;

/// Slot confirmations waiting for the coordinator's answer
#[derive(Clone, Default)]
pub struct SlotRequests {
    next_id: Arc<AtomicU64>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<bool>>>>,
}

impl SlotRequests {
    async fn open(&self) -> (u64, oneshot::Receiver<bool>) {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);
        (request_id, rx)
    }

    async fn resolve(&self, request_id: u64, granted: bool) {
        match self.pending.lock().await.remove(&request_id) {
            Some(tx) => {
                let _ = tx.send(granted);
            }
            None => debug!("Late slot reply for request {}", request_id),
        }
    }

    async fn forget(&self, request_id: u64) {
        self.pending.lock().await.remove(&request_id);
    }
}

/// Everything an executor needs; cloned into every replacement
#[derive(Clone)]
pub struct ExecutorConfig {
    pub worker_id: String,
    pub task_limit: usize,
    pub hard_deadline: Duration,
    pub transport: Arc<dyn ClusterTransport>,
    pub engine: Arc<RetrievalEngine>,
    pub processor: Arc<dyn MediaProcessor>,
    pub media: Arc<dyn MediaStorage>,
    pub activity: Activity,
    pub outstanding: Outstanding,
    pub events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl ExecutorConfig {
    async fn send(&self, message: CoordinatorMessage) {
        if let Err(e) = self.transport.send_to_coordinator(&message).await {
            warn!("Worker {} failed to reach the coordinator: {:#}", self.worker_id, e);
        }
    }
}

/// Handle to the running retrieval-and-processing executor
pub struct ExecutorHandle {
    tx: mpsc::UnboundedSender<ExecutorCommand>,
    pub(crate) join: JoinHandle<()>,
}

impl ExecutorHandle {
    pub fn spawn(config: ExecutorConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(run(config, rx));
        Self { tx, join }
    }

    pub fn send(&self, command: ExecutorCommand) {
        if self.tx.send(command).is_err() {
            warn!("Executor is not running, command dropped");
        }
    }

    /// Stop the executor, dropping every running task
    pub fn stop(&self) {
        self.join.abort();
    }
}

#[cfg(test)]
impl ExecutorHandle {
    /// A handle whose executor never looks at its commands
    pub(crate) fn stalled() -> (Self, mpsc::UnboundedReceiver<ExecutorCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(std::future::pending::<()>());
        (Self { tx, join }, rx)
    }
}

async fn run(config: ExecutorConfig, mut rx: mpsc::UnboundedReceiver<ExecutorCommand>) {
    let context = Arc::new(TaskContext { config: config.clone(), slots: SlotRequests::default() });
    let mut running = JoinSet::new();
    info!("Executor of worker {} started", config.worker_id);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(ExecutorCommand::Execute(task)) => {
                    debug!("Executing task {} ({})", task.id, task.url);
                    config.outstanding.lock().await.insert(task.id.clone(), task.clone());
                    running.spawn(run_task(context.clone(), task));
                }
                Some(ExecutorCommand::Heartbeat) => {
                    let _ = config.events.send(SupervisorEvent::ExecutorPong);
                }
                Some(ExecutorCommand::RequestTasks) => {
                    request_tasks(&config, running.len()).await;
                }
                Some(ExecutorCommand::SlotReply { request_id, granted }) => {
                    context.slots.resolve(request_id, granted).await;
                }
                None => break,
            },
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    warn!("Task execution aborted: {}", e);
                }
                config.activity.touch();
                request_tasks(&config, running.len()).await;
            }
        }
    }

    debug!("Executor of worker {} stopped", config.worker_id);
}

async fn request_tasks(config: &ExecutorConfig, running: usize) {
    let capacity = config.task_limit.saturating_sub(running);
    if capacity == 0 {
        return;
    }
    config
        .send(CoordinatorMessage::RequestTasks { worker_id: config.worker_id.clone(), capacity })
        .await;
}

struct TaskContext {
    config: ExecutorConfig,
    slots: SlotRequests,
}

async fn run_task(context: Arc<TaskContext>, task: Task) {
    let config = &context.config;

    // The attempt and its response are dropped here on expiry
    let attempt = timeout(config.hard_deadline, execute(&context, &task)).await;
    let result = match attempt {
        Ok(result) => result,
        Err(_) => {
            warn!("Task {} exceeded the hard deadline of {:?}", task.id, config.hard_deadline);
            config
                .send(CoordinatorMessage::ReturnConnectionSlot {
                    worker_id: config.worker_id.clone(),
                    task_id: task.id.clone(),
                })
                .await;
            TaskResult::abandoned(
                &task,
                format!("hard deadline of {:?} exceeded", config.hard_deadline),
            )
        }
    };

    debug!("Task {} finished as {:?}", task.id, result.overall);
    config
        .send(CoordinatorMessage::DoneProcessing { worker_id: config.worker_id.clone(), result })
        .await;
    config.outstanding.lock().await.remove(&task.id);
}

/// Ask the coordinator to confirm the slot taken at dispatch. An unanswered request counts as granted.
async fn confirm_slot(context: &TaskContext, task: &Task) -> bool {
    let config = &context.config;
    let (request_id, reply) = context.slots.open().await;

    config
        .send(CoordinatorMessage::ReserveConnectionSlot {
            worker_id: config.worker_id.clone(),
            request_id,
            host: task.host.clone(),
            task_id: task.id.clone(),
        })
        .await;

    match timeout(REPLY_TIMEOUT, reply).await {
        Ok(Ok(granted)) => granted,
        _ => {
            context.slots.forget(request_id).await;
            debug!("No slot confirmation for task {}, proceeding", task.id);
            true
        }
    }
}

async fn execute(context: &TaskContext, task: &Task) -> TaskResult {
    let config = &context.config;

    if !confirm_slot(context, task).await {
        let log = format!("no connection slot available on {}", task.host);
        let stats = SubTaskStats::default().with_retrieve_state(RetrieveState::Error, Some(log));
        return TaskResult::new(task, stats, None);
    }

    let mut response = config.engine.retrieve(task).await;

    config
        .send(CoordinatorMessage::ReturnConnectionSlot {
            worker_id: config.worker_id.clone(),
            task_id: task.id.clone(),
        })
        .await;

    let outcome = response.outcome();
    config
        .send(CoordinatorMessage::DoneDownload {
            worker_id: config.worker_id.clone(),
            task_id: task.id.clone(),
            outcome: outcome.clone(),
        })
        .await;

    let retrieve_log = outcome.error.clone().or_else(|| outcome.log.clone());
    let stats = SubTaskStats::default().with_retrieve_state(outcome.state, retrieve_log);
    let mut result = TaskResult::new(task, stats.clone(), Some(outcome));

    if response.state() == RetrievalState::Completed && response.has_body() && task.needs_processing() {
        match response.content().await {
            Ok(Some(content)) => {
                let processed = process(
                    task,
                    stats,
                    &content,
                    response.content_type(),
                    config.processor.as_ref(),
                    config.media.as_ref(),
                )
                .await;
                result.overall = processed.stats.overall_state();
                result.stats = processed.stats;
                result.meta_info = processed.meta_info;
                result.color_tags = processed.color_tags;
                result.thumbnails = processed.thumbnails;
            }
            Ok(None) => debug!("Task {} has no stored body to process", task.id),
            Err(e) => warn!("Failed to read body of task {}: {:#}", task.id, e),
        }
    }

    response.release().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SubTask, SubTaskState, TaskLimits, TaskType};
    use crate::httpclient::ResponseType;
    use crate::storage::FileSystemMediaStorage;
    use crate::transport::LocalTransport;
    use crate::worker::processing::BasicMediaProcessor;
    use std::collections::BTreeMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const WAIT: Duration = Duration::from_secs(5);

    fn config(
        transport: Arc<LocalTransport>,
        hard_deadline: Duration,
    ) -> (ExecutorConfig, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let root = std::env::temp_dir().join(format!("harvester-executor-{}", uuid::Uuid::new_v4()));
        let config = ExecutorConfig {
            worker_id: "w1".to_string(),
            task_limit: 4,
            hard_deadline,
            transport,
            engine: Arc::new(RetrievalEngine::new(ResponseType::MemoryStorage, root.join("responses"))),
            processor: Arc::new(BasicMediaProcessor),
            media: Arc::new(FileSystemMediaStorage::new(root.join("media"))),
            activity: Activity::new(),
            outstanding: Arc::new(Mutex::new(HashMap::new())),
            events,
        };
        (config, events_rx)
    }

    fn task(url: String, sub_tasks: Vec<SubTask>) -> Task {
        Task {
            id: "t1".to_string(),
            job_id: "j1".to_string(),
            reference_id: "r1".to_string(),
            url,
            host: "127.0.0.1".to_string(),
            task_type: TaskType::UnconditionalDownload,
            sub_tasks,
            limits: TaskLimits::default(),
            previous_headers: BTreeMap::new(),
        }
    }

    async fn next(transport: &LocalTransport) -> CoordinatorMessage {
        transport.next_for_coordinator(WAIT).await.unwrap().expect("coordinator message")
    }

    #[tokio::test]
    async fn test_task_reports_download_and_processing() {
        let server = MockServer::start().await;
        let mut png = b"\x89PNG\r\n\x1a\n\x00\x00\x00\x0dIHDR".to_vec();
        png.extend_from_slice(&[0, 0, 0, 4, 0, 0, 0, 3, 8, 6, 0, 0, 0]);
        Mock::given(method("GET"))
            .and(path("/img.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(png))
            .mount(&server)
            .await;

        let transport = Arc::new(LocalTransport::new());
        let (config, mut events) = config(transport.clone(), Duration::from_secs(30));
        let outstanding = config.outstanding.clone();
        let executor = ExecutorHandle::spawn(config);

        executor.send(ExecutorCommand::Execute(task(format!("{}/img.png", server.uri()), vec![SubTask::MetaExtraction])));

        let CoordinatorMessage::ReserveConnectionSlot { request_id, task_id, .. } = next(&transport).await else {
            panic!("expected a slot request");
        };
        assert_eq!(task_id, "t1");
        executor.send(ExecutorCommand::SlotReply { request_id, granted: true });

        assert!(matches!(next(&transport).await, CoordinatorMessage::ReturnConnectionSlot { .. }));
        let CoordinatorMessage::DoneDownload { outcome, .. } = next(&transport).await else {
            panic!("expected a download report");
        };
        assert_eq!(outcome.state, RetrieveState::Success);
        assert_eq!(outcome.http_status, Some(200));

        let CoordinatorMessage::DoneProcessing { result, .. } = next(&transport).await else {
            panic!("expected a processing report");
        };
        assert_eq!(result.overall, SubTaskState::Success);
        let meta = result.meta_info.unwrap();
        assert_eq!((meta.width, meta.height), (Some(4), Some(3)));

        // Finished task frees capacity
        assert_eq!(
            next(&transport).await,
            CoordinatorMessage::RequestTasks { worker_id: "w1".to_string(), capacity: 4 }
        );
        assert!(outstanding.lock().await.is_empty());

        executor.send(ExecutorCommand::Heartbeat);
        assert!(matches!(events.recv().await, Some(SupervisorEvent::ExecutorPong)));
        executor.stop();
    }

    #[tokio::test]
    async fn test_denied_slot_reports_error() {
        let transport = Arc::new(LocalTransport::new());
        let (config, _events) = config(transport.clone(), Duration::from_secs(30));
        let executor = ExecutorHandle::spawn(config);

        executor.send(ExecutorCommand::Execute(task("http://127.0.0.1:9/x".to_string(), vec![])));

        let CoordinatorMessage::ReserveConnectionSlot { request_id, .. } = next(&transport).await else {
            panic!("expected a slot request");
        };
        executor.send(ExecutorCommand::SlotReply { request_id, granted: false });

        let CoordinatorMessage::DoneProcessing { result, .. } = next(&transport).await else {
            panic!("expected a processing report");
        };
        assert!(result.is_error());
        assert!(result.stats.retrieve_log.unwrap().contains("no connection slot"));
        executor.stop();
    }

    #[tokio::test]
    async fn test_hard_deadline_bounds_a_task() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let transport = Arc::new(LocalTransport::new());
        let (config, _events) = config(transport.clone(), Duration::from_millis(300));
        let executor = ExecutorHandle::spawn(config);

        executor.send(ExecutorCommand::Execute(task(format!("{}/slow", server.uri()), vec![])));

        let CoordinatorMessage::ReserveConnectionSlot { request_id, .. } = next(&transport).await else {
            panic!("expected a slot request");
        };
        executor.send(ExecutorCommand::SlotReply { request_id, granted: true });

        assert!(matches!(next(&transport).await, CoordinatorMessage::ReturnConnectionSlot { .. }));
        let CoordinatorMessage::DoneProcessing { result, .. } = next(&transport).await else {
            panic!("expected a processing report");
        };
        assert!(result.is_error());
        assert!(result.stats.retrieve_log.unwrap().contains("hard deadline of 300ms"));
        executor.stop();
    }

    #[tokio::test]
    async fn test_hard_deadline_removes_partial_disk_body() {
        // Sends the headers and a few body bytes, then stalls
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100000\r\n\r\n0123456789")
                .await
                .unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let transport = Arc::new(LocalTransport::new());
        let (mut config, _events) = config(transport.clone(), Duration::from_millis(800));
        let responses = std::env::temp_dir().join(format!("harvester-disk-{}", uuid::Uuid::new_v4()));
        config.engine = Arc::new(RetrievalEngine::new(ResponseType::DiskStorage, responses.clone()));
        let executor = ExecutorHandle::spawn(config);

        executor.send(ExecutorCommand::Execute(task(format!("http://{}/big", address), vec![])));

        let CoordinatorMessage::ReserveConnectionSlot { request_id, .. } = next(&transport).await else {
            panic!("expected a slot request");
        };
        executor.send(ExecutorCommand::SlotReply { request_id, granted: true });

        // Body bytes reach the disk before the deadline fires
        let body = responses.join("j1").join("t1");
        let started = tokio::time::Instant::now();
        while !body.exists() && started.elapsed() < Duration::from_millis(700) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(body.exists());

        assert!(matches!(next(&transport).await, CoordinatorMessage::ReturnConnectionSlot { .. }));
        let CoordinatorMessage::DoneProcessing { result, .. } = next(&transport).await else {
            panic!("expected a processing report");
        };
        assert!(result.stats.retrieve_log.unwrap().contains("hard deadline"));
        assert!(!body.exists());

        executor.stop();
        let _ = std::fs::remove_dir_all(responses);
    }
}
