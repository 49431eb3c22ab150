use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::cli::config::HarvesterConfig;
use crate::domain::{JobId, JobState, RetrievalOutcome, Task, TaskId, TaskResult, TaskState};
use crate::storage::{JobStore, WriteAck};
use crate::transport::ClusterTransport;
use super::accountant::{AccountantHandle, Transition};
use super::limiter::{LimiterHandle, SlotTable};
use super::loader::{JobLoader, LoadedBatch};
use super::messages::{CoordinatorMessage, WorkerMessage};
use super::restarter::JobRestarter;

/// Everything the coordinator reacts to, one at a time
#[derive(Debug)]
pub enum CoordinatorEvent {
    Remote(CoordinatorMessage),
    LoadJobs,
    Monitor,
    Clean,
    CheckForTaskTimeout,
}

/// A task handed to a worker and not yet reported finished
#[derive(Debug)]
struct Dispatched {
    task: Task,
    worker_id: String,
    dispatched_at: Instant,
}

#[derive(Debug, Default)]
struct JobProgress {
    remaining: usize,
    total: usize,
    errors: usize,
}

#[derive(Debug)]
struct WorkerPresence {
    first_seen: Instant,
    last_seen: Instant,
    unreachable: bool,
}

/// Cluster master: hands out tasks, tracks their state and persists results
pub struct Coordinator {
    config: HarvesterConfig,
    store: Arc<dyn JobStore>,
    transport: Arc<dyn ClusterTransport>,
    accountant: AccountantHandle,
    limiter: LimiterHandle,
    loader: JobLoader,

    /// Loaded tasks waiting for a worker
    pool: VecDeque<Task>,

    in_flight: HashMap<TaskId, Dispatched>,
    jobs: HashMap<JobId, JobProgress>,
    workers: HashMap<String, WorkerPresence>,

    events_tx: mpsc::UnboundedSender<CoordinatorEvent>,
    events_rx: mpsc::UnboundedReceiver<CoordinatorEvent>,
}

impl Coordinator {
    pub fn new(config: HarvesterConfig, store: Arc<dyn JobStore>, transport: Arc<dyn ClusterTransport>) -> Self {
        let accountant = AccountantHandle::spawn();
        let limiter = LimiterHandle::spawn(SlotTable::new(&config.limits, &config.host_exceptions));
        let loader = JobLoader::new(
            store.clone(),
            accountant.clone(),
            limiter.clone(),
            config.coordinator.clone(),
            config.host_exceptions.clone(),
            config.limits.task_limits(),
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            config,
            store,
            transport,
            accountant,
            limiter,
            loader,
            pool: VecDeque::new(),
            in_flight: HashMap::new(),
            jobs: HashMap::new(),
            workers: HashMap::new(),
            events_tx,
            events_rx,
        }
    }

    /// Run until `shutdown` resolves
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        info!("Coordinator starting");

        match self.store.requeue_loaded_jobs().await {
            Ok(0) => {}
            Ok(count) => info!("Requeued {} jobs left loaded by a previous run", count),
            Err(e) => error!("Failed to requeue loaded jobs: {:#}", e),
        }

        let pump = self.spawn_inbox_pump();
        let restarter = self.spawn_restarter();

        for event in [CoordinatorEvent::LoadJobs, CoordinatorEvent::Monitor, CoordinatorEvent::CheckForTaskTimeout] {
            let _ = self.events_tx.send(event);
        }
        self.schedule(CoordinatorEvent::Clean, self.clean_interval());

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }

        pump.abort();
        if let Some(restarter) = restarter {
            restarter.abort();
        }
        info!("Coordinator stopped");
    }

    fn spawn_inbox_pump(&self) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let events = self.events_tx.clone();
        let wait = Duration::from_secs(self.config.transport.poll_timeout_secs.max(1));

        tokio::spawn(async move {
            loop {
                match transport.next_for_coordinator(wait).await {
                    Ok(Some(message)) => {
                        if events.send(CoordinatorEvent::Remote(message)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Failed to read coordinator inbox: {:#}", e);
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    }

    fn spawn_restarter(&self) -> Option<JoinHandle<()>> {
        let settings = &self.config.coordinator.restarter;
        if !settings.enabled {
            return None;
        }
        let restarter = JobRestarter::new(self.store.clone(), settings);
        Some(tokio::spawn(restarter.run()))
    }

    fn schedule(&self, event: CoordinatorEvent, delay: Duration) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = events.send(event);
        });
    }

    fn clean_interval(&self) -> Duration {
        Duration::from_secs(self.config.coordinator.cleanup_interval_hours * 3600)
    }

    async fn handle(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Remote(message) => {
                self.touch_worker(message.worker_id());
                self.handle_message(message).await;
            }
            CoordinatorEvent::LoadJobs => {
                let batch = self.loader.load_batch().await;
                self.merge(batch);
            }
            CoordinatorEvent::Monitor => {
                self.monitor().await;
                self.schedule(
                    CoordinatorEvent::Monitor,
                    Duration::from_secs(self.config.coordinator.monitor_interval_secs),
                );
            }
            CoordinatorEvent::Clean => {
                self.clean().await;
                self.schedule(CoordinatorEvent::Clean, self.clean_interval());
            }
            CoordinatorEvent::CheckForTaskTimeout => {
                self.check_for_task_timeout().await;
                self.schedule(
                    CoordinatorEvent::CheckForTaskTimeout,
                    Duration::from_secs(self.config.coordinator.task_timeout_check_interval_secs),
                );
            }
        }
    }

    async fn handle_message(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::RequestTasks { worker_id, capacity } => {
                self.request_tasks(&worker_id, capacity).await;
            }
            CoordinatorMessage::StartedTask { worker_id, task_id } => {
                debug!("Worker {} started task {}", worker_id, task_id);
            }
            CoordinatorMessage::DoneDownload { worker_id, task_id, outcome } => {
                self.done_download(&worker_id, &task_id, &outcome).await;
            }
            CoordinatorMessage::DoneProcessing { worker_id, result } => {
                self.done_processing(&worker_id, result).await;
            }
            CoordinatorMessage::ReserveConnectionSlot { worker_id, request_id, host, task_id } => {
                let granted = match self.limiter.reserve(&host, &task_id).await {
                    Ok(granted) => granted,
                    Err(e) => {
                        warn!("Denying slot on {} for task {}: {}", host, task_id, e);
                        false
                    }
                };
                self.reply(&worker_id, WorkerMessage::SlotReservation { request_id, granted }).await;
            }
            CoordinatorMessage::ReturnConnectionSlot { worker_id, task_id } => {
                match self.limiter.release(&task_id).await {
                    Ok(Some(host)) => debug!("Worker {} returned slot on {} for {}", worker_id, host, task_id),
                    Ok(None) => warn!("Worker {} returned an unheld slot for task {}", worker_id, task_id),
                    Err(e) => warn!("Failed to return slot for task {}: {}", task_id, e),
                }
            }
            CoordinatorMessage::Ping { worker_id } => {
                self.reply(&worker_id, WorkerMessage::Pong).await;
            }
        }
    }

    async fn reply(&self, worker_id: &str, message: WorkerMessage) {
        if let Err(e) = self.transport.send_to_worker(worker_id, &message).await {
            warn!("Failed to reply to worker {}: {:#}", worker_id, e);
        }
    }

    fn merge(&mut self, batch: LoadedBatch) {
        for (job_id, tasks) in batch.jobs {
            self.jobs.insert(job_id, JobProgress { remaining: tasks, total: tasks, errors: 0 });
        }
        self.pool.extend(batch.tasks);
    }

    async fn request_tasks(&mut self, worker_id: &str, capacity: usize) {
        if capacity == 0 {
            return;
        }

        if self.pool.len() < capacity {
            let batch = self.loader.load_batch().await;
            self.merge(batch);
        }

        // A task only leaves with a held slot
        let mut bag = Vec::new();
        let mut deferred = Vec::new();
        while bag.len() < capacity {
            let Some(task) = self.pool.pop_front() else { break };
            match self.limiter.reserve(&task.host, &task.id).await {
                Ok(true) => bag.push(task),
                Ok(false) => deferred.push(task),
                Err(e) => {
                    warn!("Admission controller unavailable: {}", e);
                    deferred.push(task);
                    break;
                }
            }
        }
        for task in deferred.into_iter().rev() {
            self.pool.push_front(task);
        }

        if bag.is_empty() {
            debug!("No dispatchable task for worker {}", worker_id);
            return;
        }

        for task in &bag {
            if let Err(e) = self.accountant.transition(&task.id, TaskState::Downloading).await {
                warn!("Failed to mark task {} as downloading: {}", task.id, e);
            }
        }

        let message = WorkerMessage::BagOfTasks { tasks: bag.clone() };
        if let Err(e) = self.transport.send_to_worker(worker_id, &message).await {
            warn!("Failed to send {} tasks to worker {}: {:#}", bag.len(), worker_id, e);
            for task in bag.into_iter().rev() {
                let _ = self.limiter.release(&task.id).await;
                let _ = self.accountant.set_state(&task.id, TaskState::Ready).await;
                self.pool.push_front(task);
            }
            return;
        }

        info!("Dispatched {} tasks to worker {}", bag.len(), worker_id);
        let now = Instant::now();
        for task in bag {
            self.in_flight.insert(
                task.id.clone(),
                Dispatched { task, worker_id: worker_id.to_string(), dispatched_at: now },
            );
        }
    }

    async fn done_download(&mut self, worker_id: &str, task_id: &str, outcome: &RetrievalOutcome) {
        debug!("Worker {} downloaded task {}: {:?}", worker_id, task_id, outcome.state);

        match self.accountant.transition(task_id, TaskState::Processing).await {
            Ok(Transition::Applied(_)) => {}
            Ok(Transition::Rejected(current)) => debug!("Task {} already {:?}", task_id, current),
            Ok(Transition::Unknown) => warn!("Download reported for unknown task {}", task_id),
            Err(e) => warn!("Failed to record download of task {}: {}", task_id, e),
        }
    }

    async fn done_processing(&mut self, worker_id: &str, result: TaskResult) {
        let task_id = result.task_id.clone();
        let state = if result.is_error() { TaskState::Error } else { TaskState::Done };
        debug!("Worker {} finished task {}: {:?}", worker_id, task_id, result.overall);

        self.finish_task(result, state).await;
    }

    /// Record a terminal state: persist the result, update the accountant, free the slot
    async fn finish_task(&mut self, result: TaskResult, state: TaskState) {
        let task_id = result.task_id.clone();

        // Keyed by task id, so a replay overwrites the same record
        if let Err(e) = self.store.write_result(&result, WriteAck::Acknowledged).await {
            error!("Failed to store result of task {}: {:#}", task_id, e);
        }

        let first_terminal = match self.accountant.transition(&task_id, state).await {
            Ok(Transition::Applied(_)) => true,
            Ok(Transition::Rejected(current)) => {
                debug!("Task {} already {:?}, ignoring repeated report", task_id, current);
                false
            }
            Ok(Transition::Unknown) => {
                warn!("Completion reported for unknown task {}", task_id);
                false
            }
            Err(e) => {
                warn!("Failed to record completion of task {}: {}", task_id, e);
                false
            }
        };

        if let Ok(Some(host)) = self.limiter.release(&task_id).await {
            debug!("Released slot on {} for task {}", host, task_id);
        }
        self.in_flight.remove(&task_id);

        if first_terminal {
            self.job_task_finished(&result.job_id, state == TaskState::Error).await;
        }
    }

    async fn job_task_finished(&mut self, job_id: &str, failed: bool) {
        let Some(progress) = self.jobs.get_mut(job_id) else {
            return;
        };

        progress.remaining = progress.remaining.saturating_sub(1);
        if failed {
            progress.errors += 1;
        }
        if progress.remaining > 0 {
            return;
        }

        let state = if progress.errors == progress.total { JobState::Error } else { JobState::Finished };
        self.jobs.remove(job_id);

        match self.store.update_job_state(job_id, state).await {
            Ok(()) => info!("Job {} is {}", job_id, state.as_str()),
            Err(e) => error!("Failed to mark job {} as {}: {:#}", job_id, state.as_str(), e),
        }
    }

    async fn check_for_task_timeout(&mut self) {
        let max_duration = self.config.limits.max_job_processing_duration();

        // Reservations taken directly by workers
        match self.limiter.sweep().await {
            Ok(released) if !released.is_empty() => {
                info!("Force-released {} stale connection slots", released.len());
            }
            Ok(_) => {}
            Err(e) => warn!("Stale slot sweep failed: {}", e),
        }

        let stale: Vec<TaskId> = self
            .in_flight
            .iter()
            .filter(|(_, dispatched)| dispatched.dispatched_at.elapsed() > max_duration)
            .map(|(task_id, _)| task_id.clone())
            .collect();

        for task_id in stale {
            let Some(dispatched) = self.in_flight.remove(&task_id) else { continue };
            warn!(
                "Task {} on worker {} timed out after {:?}",
                task_id, dispatched.worker_id, max_duration
            );
            let result = TaskResult::abandoned(
                &dispatched.task,
                format!("no completion report within {}s", max_duration.as_secs()),
            );
            self.finish_task(result, TaskState::Error).await;
        }
    }

    async fn clean(&mut self) {
        match self.accountant.active_count().await {
            Ok(0) => {
                if let Err(e) = self.accountant.clear().await {
                    warn!("Failed to clear accountant: {}", e);
                }
                info!("Cleared task accounting");
            }
            Ok(_) => match self.accountant.clean_terminal().await {
                Ok(removed) => info!("Removed {} finished tasks from accounting", removed),
                Err(e) => warn!("Failed to clean accountant: {}", e),
            },
            Err(e) => warn!("Skipping cleanup: {}", e),
        }
    }

    fn touch_worker(&mut self, worker_id: &str) {
        let now = Instant::now();
        match self.workers.get_mut(worker_id) {
            Some(presence) => {
                if presence.unreachable {
                    info!(
                        "Worker {} is reachable again, member for {:?}",
                        worker_id,
                        presence.first_seen.elapsed()
                    );
                    presence.unreachable = false;
                }
                presence.last_seen = now;
            }
            None => {
                info!("Worker {} joined", worker_id);
                self.workers.insert(worker_id.to_string(), WorkerPresence { first_seen: now, last_seen: now, unreachable: false });
            }
        }
    }

    async fn monitor(&mut self) {
        let unreachable_after = Duration::from_secs(self.config.coordinator.worker_unreachable_after_secs);
        for (worker_id, presence) in self.workers.iter_mut() {
            if !presence.unreachable && presence.last_seen.elapsed() > unreachable_after {
                warn!("Worker {} unreachable, silent for {:?}", worker_id, presence.last_seen.elapsed());
                presence.unreachable = true;
            }
        }
        let reachable = self.workers.values().filter(|p| !p.unreachable).count();

        match self.accountant.summary().await {
            Ok(summary) => info!(
                "Tasks: {} ready, {} downloading, {} processing, {} done, {} error across {} hosts; pool {}, in flight {}, workers {}/{}",
                summary.ready,
                summary.downloading,
                summary.processing,
                summary.done,
                summary.error,
                summary.hosts,
                self.pool.len(),
                self.in_flight.len(),
                reachable,
                self.workers.len()
            ),
            Err(e) => warn!("Monitor could not read accounting: {}", e),
        }

        if let Ok(hosts) = self.accountant.overloaded_hosts(self.config.coordinator.tasks_per_host).await {
            if !hosts.is_empty() {
                info!("Hosts with more than {} queued tasks: {}", self.config.coordinator.tasks_per_host, hosts.join(", "));
            }
        }

        if let Ok(occupancy) = self.limiter.occupancy().await {
            for (host, slots) in occupancy.iter().take(10) {
                debug!("Host {} holds {} connection slots", host, slots);
            }
        }

        match self.store.count_by_state().await {
            Ok(counts) => {
                let line: Vec<String> = counts
                    .iter()
                    .map(|(state, count)| format!("{}={}", state.as_str(), count))
                    .collect();
                info!("Jobs: {}", line.join(" "));
            }
            Err(e) => warn!("Monitor could not count jobs: {:#}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DocumentReference, Job, RetrieveState, SubTaskStats, TaskType};
    use crate::storage::MemoryJobStore;
    use crate::transport::LocalTransport;
    use tokio::sync::oneshot;

    const WAIT: Duration = Duration::from_millis(300);

    struct Harness {
        store: Arc<MemoryJobStore>,
        transport: Arc<LocalTransport>,
        stop: Option<oneshot::Sender<()>>,
        join: JoinHandle<()>,
    }

    impl Harness {
        async fn start(config: HarvesterConfig, store: Arc<MemoryJobStore>) -> Self {
            let transport = Arc::new(LocalTransport::new());
            let coordinator = Coordinator::new(config, store.clone(), transport.clone());
            let (stop, stopped) = oneshot::channel::<()>();
            let join = tokio::spawn(coordinator.run(async move {
                let _ = stopped.await;
            }));
            Self { store, transport, stop: Some(stop), join }
        }

        async fn send(&self, message: CoordinatorMessage) {
            self.transport.send_to_coordinator(&message).await.unwrap();
        }

        async fn request(&self, worker_id: &str, capacity: usize) -> Vec<Task> {
            self.send(CoordinatorMessage::RequestTasks { worker_id: worker_id.to_string(), capacity }).await;
            match self.transport.next_for_worker(worker_id, WAIT).await.unwrap() {
                Some(WorkerMessage::BagOfTasks { tasks }) => tasks,
                Some(other) => panic!("unexpected message {:?}", other),
                None => Vec::new(),
            }
        }

        async fn stop(mut self) {
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
            self.join.await.unwrap();
        }
    }

    fn config(batch_size: usize, max_in_flight: usize, per_host: usize) -> HarvesterConfig {
        let mut config = HarvesterConfig::default();
        config.coordinator.batch_size = batch_size;
        config.coordinator.max_tasks_in_flight = max_in_flight;
        config.limits.max_concurrent_connections = per_host;
        config.store.storage_type = "memory".to_string();
        config.transport.transport_type = "local".to_string();
        config
    }

    async fn submit(store: &MemoryJobStore, url: &str) -> Job {
        let job = Job::new(vec![DocumentReference::new(url, TaskType::UnconditionalDownload)]);
        store.submit_job(&job, WriteAck::Acknowledged).await.unwrap();
        job
    }

    fn success(task: &Task) -> TaskResult {
        let stats = SubTaskStats::default().with_retrieve_state(RetrieveState::Success, None);
        TaskResult::new(task, stats, None)
    }

    #[tokio::test]
    async fn test_third_host_waits_for_a_free_slot() {
        let store = Arc::new(MemoryJobStore::new());
        let mut jobs = Vec::new();
        for host in ["a.org", "b.org", "c.org"] {
            jobs.push(submit(&store, &format!("https://{}/img", host)).await);
        }

        let harness = Harness::start(config(2, 2, 1), store.clone()).await;

        let first = harness.request("w1", 10).await;
        assert_eq!(first.len(), 2);
        assert!(harness.request("w1", 10).await.is_empty());

        harness
            .send(CoordinatorMessage::DoneProcessing { worker_id: "w1".to_string(), result: success(&first[0]) })
            .await;

        let second = harness.request("w1", 10).await;
        assert_eq!(second.len(), 1);
        let hosts: Vec<&str> = first.iter().chain(second.iter()).map(|t| t.host.as_str()).collect();
        assert!(hosts.contains(&"a.org") && hosts.contains(&"b.org") && hosts.contains(&"c.org"));

        let finished = store.job(&first[0].job_id).await.unwrap();
        assert_eq!(finished.state, JobState::Finished);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_ignored_host_is_never_dispatched() {
        let store = Arc::new(MemoryJobStore::new());
        for i in 0..10 {
            submit(&store, &format!("https://ignored.org/{}", i)).await;
        }

        let mut config = config(100, 5000, 2);
        config.host_exceptions.ignored_hosts = vec!["ignored.org".to_string()];
        let harness = Harness::start(config, store.clone()).await;

        assert!(harness.request("w1", 50).await.is_empty());
        assert_eq!(store.count_by_state().await.unwrap().get(&JobState::Ready), Some(&10));

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_replayed_done_processing_is_idempotent() {
        let store = Arc::new(MemoryJobStore::new());
        submit(&store, "https://a.org/1").await;

        let harness = Harness::start(config(10, 100, 2), store.clone()).await;

        let tasks = harness.request("w1", 1).await;
        assert_eq!(tasks.len(), 1);
        let result = success(&tasks[0]);

        harness
            .send(CoordinatorMessage::DoneProcessing { worker_id: "w1".to_string(), result: result.clone() })
            .await;
        harness.send(CoordinatorMessage::Ping { worker_id: "w1".to_string() }).await;
        assert_eq!(harness.transport.next_for_worker("w1", WAIT).await.unwrap(), Some(WorkerMessage::Pong));
        let once = store.read_result(&result.task_id).await.unwrap();

        harness
            .send(CoordinatorMessage::DoneProcessing { worker_id: "w1".to_string(), result: result.clone() })
            .await;
        harness.send(CoordinatorMessage::Ping { worker_id: "w1".to_string() }).await;
        assert_eq!(harness.transport.next_for_worker("w1", WAIT).await.unwrap(), Some(WorkerMessage::Pong));
        let twice = store.read_result(&result.task_id).await.unwrap();

        assert_eq!(once, Some(result));
        assert_eq!(once, twice);
        assert_eq!(store.result_count().await, 1);
        assert_eq!(store.job(&tasks[0].job_id).await.unwrap().state, JobState::Finished);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_slot_requests_are_forwarded() {
        let store = Arc::new(MemoryJobStore::new());
        let harness = Harness::start(config(10, 100, 1), store).await;

        harness
            .send(CoordinatorMessage::ReserveConnectionSlot {
                worker_id: "w1".to_string(),
                request_id: 1,
                host: "a.org".to_string(),
                task_id: "t1".to_string(),
            })
            .await;
        harness
            .send(CoordinatorMessage::ReserveConnectionSlot {
                worker_id: "w1".to_string(),
                request_id: 2,
                host: "a.org".to_string(),
                task_id: "t2".to_string(),
            })
            .await;

        let w = harness.transport.clone();
        assert_eq!(
            w.next_for_worker("w1", WAIT).await.unwrap(),
            Some(WorkerMessage::SlotReservation { request_id: 1, granted: true })
        );
        assert_eq!(
            w.next_for_worker("w1", WAIT).await.unwrap(),
            Some(WorkerMessage::SlotReservation { request_id: 2, granted: false })
        );

        harness
            .send(CoordinatorMessage::ReturnConnectionSlot { worker_id: "w1".to_string(), task_id: "t1".to_string() })
            .await;
        harness
            .send(CoordinatorMessage::ReserveConnectionSlot {
                worker_id: "w1".to_string(),
                request_id: 3,
                host: "a.org".to_string(),
                task_id: "t2".to_string(),
            })
            .await;
        assert_eq!(
            w.next_for_worker("w1", WAIT).await.unwrap(),
            Some(WorkerMessage::SlotReservation { request_id: 3, granted: true })
        );

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_errored_tasks_fail_the_job() {
        let store = Arc::new(MemoryJobStore::new());
        let job = submit(&store, "https://a.org/1").await;

        let harness = Harness::start(config(10, 100, 2), store.clone()).await;
        let tasks = harness.request("w1", 1).await;

        let stats = SubTaskStats::default().with_retrieve_state(RetrieveState::Error, Some("refused".to_string()));
        let result = TaskResult::new(&tasks[0], stats, None);
        harness
            .send(CoordinatorMessage::DoneProcessing { worker_id: "w1".to_string(), result })
            .await;
        harness.send(CoordinatorMessage::Ping { worker_id: "w1".to_string() }).await;
        assert_eq!(harness.transport.next_for_worker("w1", WAIT).await.unwrap(), Some(WorkerMessage::Pong));

        assert_eq!(store.job(&job.id).await.unwrap().state, JobState::Error);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_loaded_jobs_are_requeued_on_start() {
        let store = Arc::new(MemoryJobStore::new());
        let job = submit(&store, "https://a.org/1").await;
        store.update_job_state(&job.id, JobState::Loaded).await.unwrap();

        let harness = Harness::start(config(10, 100, 2), store.clone()).await;
        let tasks = harness.request("w1", 5).await;

        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].job_id, job.id);

        harness.stop().await;
    }
}
