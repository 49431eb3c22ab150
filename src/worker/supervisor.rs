use anyhow::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cli::config::WorkerSettings;
use crate::cluster::messages::{CoordinatorMessage, WorkerMessage};
use crate::domain::TaskResult;
use crate::httpclient::RetrievalEngine;
use crate::storage::{FileSystemMediaStorage, MediaStorage};
use crate::transport::ClusterTransport;
use crate::utils::shutdown;
use super::executor::{ExecutorCommand, ExecutorConfig, ExecutorHandle};
use super::heartbeat::HeartbeatMonitor;
use super::processing::{BasicMediaProcessor, MediaProcessor};
use super::watchdog::{watch as watchdog, Activity};

/// What the supervisor reacts to
#[derive(Debug)]
pub enum SupervisorEvent {
    HeartbeatTick,
    ExecutorPong,
    Remote(WorkerMessage),
}

/// Why a supervisor stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    CoordinatorUnreachable,
    Watchdog,
    Shutdown,
}

enum Step {
    Watchdog,
    ExecutorExited,
    Event(Option<SupervisorEvent>),
}

/// Owns the executor of one worker and keeps it alive
pub struct WorkerSupervisor {
    settings: WorkerSettings,
    executor_config: ExecutorConfig,
    executor: ExecutorHandle,
    executor_heartbeat: HeartbeatMonitor,
    coordinator_heartbeat: HeartbeatMonitor,
    restarts: u32,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
    events_rx: mpsc::UnboundedReceiver<SupervisorEvent>,
}

impl WorkerSupervisor {
    pub fn new(
        worker_id: &str,
        settings: &WorkerSettings,
        transport: Arc<dyn ClusterTransport>,
        processor: Arc<dyn MediaProcessor>,
        media: Arc<dyn MediaStorage>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let executor_config = ExecutorConfig {
            worker_id: worker_id.to_string(),
            task_limit: settings.task_limit,
            hard_deadline: Duration::from_secs(settings.hard_deadline_secs),
            transport,
            engine: Arc::new(RetrievalEngine::new(settings.response_type, settings.path_to_save.clone())),
            processor,
            media,
            activity: Activity::new(),
            outstanding: Arc::new(Mutex::new(HashMap::new())),
            events: events_tx.clone(),
        };
        let executor = ExecutorHandle::spawn(executor_config.clone());

        Self {
            settings: settings.clone(),
            executor_config,
            executor,
            executor_heartbeat: HeartbeatMonitor::new(settings.missed_heartbeat_limit),
            coordinator_heartbeat: HeartbeatMonitor::new(settings.coordinator_missed_pong_limit),
            restarts: 0,
            events_tx,
            events_rx,
        }
    }

    fn worker_id(&self) -> &str {
        &self.executor_config.worker_id
    }

    /// Supervise until shutdown, coordinator loss or inactivity
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> SupervisorExit {
        info!("Worker {} supervisor started", self.worker_id());

        let pump = self.spawn_inbox_pump();
        let ticker = self.spawn_heartbeat_ticker();
        let watchdog_timeout = Duration::from_secs(self.settings.watchdog_timeout_secs);

        // Register with the coordinator by asking for work
        self.executor.send(ExecutorCommand::RequestTasks);

        tokio::pin!(shutdown);
        let exit = loop {
            let step = tokio::select! {
                _ = &mut shutdown => break SupervisorExit::Shutdown,
                _ = watchdog(self.executor_config.activity.clone(), watchdog_timeout) => Step::Watchdog,
                _ = &mut self.executor.join => Step::ExecutorExited,
                event = self.events_rx.recv() => Step::Event(event),
            };

            match step {
                Step::Watchdog => {
                    warn!("Worker {} saw no activity for {:?}", self.worker_id(), watchdog_timeout);
                    break SupervisorExit::Watchdog;
                }
                Step::ExecutorExited => {
                    error!("Executor of worker {} exited, recreating it", self.worker_id());
                    self.restart_executor().await;
                }
                Step::Event(Some(event)) => {
                    if let Some(exit) = self.handle(event).await {
                        break exit;
                    }
                }
                Step::Event(None) => break SupervisorExit::Shutdown,
            }
        };

        pump.abort();
        ticker.abort();
        self.executor.stop();
        info!("Worker {} supervisor stopped: {:?}", self.worker_id(), exit);
        exit
    }

    async fn handle(&mut self, event: SupervisorEvent) -> Option<SupervisorExit> {
        match event {
            SupervisorEvent::HeartbeatTick => {
                // Refill in case a request or a bag got lost
                self.executor.send(ExecutorCommand::RequestTasks);

                if self.executor_heartbeat.on_tick() {
                    warn!("Executor of worker {} missed its heartbeats, restarting it", self.worker_id());
                    self.restart_executor().await;
                }
                self.executor.send(ExecutorCommand::Heartbeat);

                if self.coordinator_heartbeat.on_tick() {
                    warn!("Coordinator did not answer worker {}", self.worker_id());
                    return Some(SupervisorExit::CoordinatorUnreachable);
                }
                self.send(CoordinatorMessage::Ping { worker_id: self.worker_id().to_string() }).await;
            }
            SupervisorEvent::ExecutorPong => self.executor_heartbeat.on_pong(),
            SupervisorEvent::Remote(WorkerMessage::Pong) => self.coordinator_heartbeat.on_pong(),
            SupervisorEvent::Remote(WorkerMessage::BagOfTasks { tasks }) => {
                info!("Worker {} received {} tasks", self.worker_id(), tasks.len());
                self.coordinator_heartbeat.on_pong();
                self.executor_config.activity.touch();
                for task in tasks {
                    self.send(CoordinatorMessage::StartedTask {
                        worker_id: self.worker_id().to_string(),
                        task_id: task.id.clone(),
                    })
                    .await;
                    self.executor.send(ExecutorCommand::Execute(task));
                }
            }
            SupervisorEvent::Remote(WorkerMessage::SlotReservation { request_id, granted }) => {
                self.executor.send(ExecutorCommand::SlotReply { request_id, granted });
            }
        }
        None
    }

    async fn send(&self, message: CoordinatorMessage) {
        if let Err(e) = self.executor_config.transport.send_to_coordinator(&message).await {
            warn!("Worker {} failed to reach the coordinator: {:#}", self.worker_id(), e);
        }
    }

    /// Replace the executor; tasks it was running are reported as failed
    async fn restart_executor(&mut self) {
        self.executor.stop();
        self.restarts += 1;
        info!("Starting executor #{} of worker {}", self.restarts + 1, self.worker_id());

        let abandoned: Vec<_> = self.executor_config.outstanding.lock().await.drain().map(|(_, task)| task).collect();
        for task in abandoned {
            let result = TaskResult::abandoned(&task, "executor restarted");
            self.send(CoordinatorMessage::DoneProcessing { worker_id: self.worker_id().to_string(), result }).await;
        }

        self.executor = ExecutorHandle::spawn(self.executor_config.clone());
        self.executor.send(ExecutorCommand::RequestTasks);
    }

    fn spawn_inbox_pump(&self) -> JoinHandle<()> {
        let transport = self.executor_config.transport.clone();
        let worker_id = self.worker_id().to_string();
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            loop {
                match transport.next_for_worker(&worker_id, Duration::from_secs(1)).await {
                    Ok(Some(message)) => {
                        if events.send(SupervisorEvent::Remote(message)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Failed to read inbox of worker {}: {:#}", worker_id, e);
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    }

    fn spawn_heartbeat_ticker(&self) -> JoinHandle<()> {
        let period = Duration::from_secs(self.settings.heartbeat_interval_secs.max(1));
        let first = period.min(Duration::from_secs(10));
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            sleep(first).await;
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if events.send(SupervisorEvent::HeartbeatTick).is_err() {
                    break;
                }
            }
        })
    }
}

/// Run a worker until shutdown, rebuilding everything when the coordinator is lost
pub async fn run_worker<F, Fut>(
    settings: WorkerSettings,
    connect: F,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Arc<dyn ClusterTransport>>>,
{
    let worker_id = settings.worker_id.clone().unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));
    let grace = Duration::from_secs(settings.coordinator_grace_secs);
    info!("Starting worker {}", worker_id);

    loop {
        let exit = match connect().await {
            Ok(transport) => {
                let supervisor = WorkerSupervisor::new(
                    &worker_id,
                    &settings,
                    transport,
                    Arc::new(BasicMediaProcessor),
                    Arc::new(FileSystemMediaStorage::new(settings.media_storage_path.clone())),
                );
                supervisor.run(shutdown::signalled(shutdown_rx.clone())).await
            }
            Err(e) => {
                error!("Worker {} failed to connect: {:#}", worker_id, e);
                SupervisorExit::CoordinatorUnreachable
            }
        };

        match exit {
            SupervisorExit::Shutdown => return Ok(()),
            SupervisorExit::Watchdog => info!("Restarting worker {} after inactivity", worker_id),
            SupervisorExit::CoordinatorUnreachable => {
                info!("Worker {} restarting in {:?}", worker_id, grace);
                tokio::select! {
                    _ = shutdown::signalled(shutdown_rx.clone()) => return Ok(()),
                    _ = sleep(grace) => {}
                }
            }
        }
    }
}
