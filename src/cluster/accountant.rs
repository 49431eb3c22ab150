use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::domain::{Task, TaskId, TaskState};
use super::{ask, ActorError};

const NAME: &str = "task accountant";

/// Result of a guarded state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Applied; carries the previous state
    Applied(TaskState),

    /// Not a forward move; carries the current state
    Rejected(TaskState),

    Unknown,
}

/// Per-state task counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSummary {
    pub ready: usize,
    pub downloading: usize,
    pub processing: usize,
    pub done: usize,
    pub error: usize,

    /// Hosts with at least one outstanding task
    pub hosts: usize,
}

#[derive(Debug, Clone)]
struct Entry {
    state: TaskState,
    host: String,
}

/// Task id to state map plus the outstanding task ids of every host
#[derive(Debug, Default)]
pub struct TaskLedger {
    states: HashMap<TaskId, Entry>,
    tasks_per_host: HashMap<String, Vec<TaskId>>,
}

impl TaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly loaded task as READY
    pub fn register(&mut self, task: &Task) {
        let previous = self.states.insert(
            task.id.clone(),
            Entry { state: TaskState::Ready, host: task.host.clone() },
        );
        if previous.is_none() {
            self.tasks_per_host
                .entry(task.host.clone())
                .or_default()
                .push(task.id.clone());
        }
    }

    /// Overwrite the state of a task. Unknown ids are logged and ignored.
    pub fn set_state(&mut self, task_id: &str, state: TaskState) -> Option<TaskState> {
        match self.states.get_mut(task_id) {
            Some(entry) => Some(std::mem::replace(&mut entry.state, state)),
            None => {
                warn!("State {:?} reported for unknown task {}", state, task_id);
                None
            }
        }
    }

    /// Change the state only if it moves the task forward
    pub fn transition(&mut self, task_id: &str, next: TaskState) -> Transition {
        match self.states.get_mut(task_id) {
            Some(entry) if entry.state.can_transition_to(next) => {
                Transition::Applied(std::mem::replace(&mut entry.state, next))
            }
            Some(entry) => Transition::Rejected(entry.state),
            None => {
                debug!("Transition to {:?} for unknown task {}", next, task_id);
                Transition::Unknown
            }
        }
    }

    pub fn get_state(&self, task_id: &str) -> Option<TaskState> {
        self.states.get(task_id).map(|entry| entry.state)
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.states.clear();
        self.tasks_per_host.clear();
    }

    /// Drop the hosts whose tasks are all terminal, with their tasks. Returns the number of tasks removed.
    pub fn clean_terminal(&mut self) -> usize {
        let states = &self.states;
        let finished_hosts: Vec<String> = self
            .tasks_per_host
            .iter()
            .filter(|(_, ids)| {
                ids.iter().all(|id| states.get(id).map_or(true, |entry| entry.state.is_terminal()))
            })
            .map(|(host, _)| host.clone())
            .collect();

        let mut removed = 0;
        for host in finished_hosts {
            if let Some(ids) = self.tasks_per_host.remove(&host) {
                for id in ids {
                    if self.states.remove(&id).is_some() {
                        removed += 1;
                    }
                }
            }
        }
        removed
    }

    /// READY tasks per host
    pub fn ready_per_host(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for entry in self.states.values().filter(|entry| entry.state == TaskState::Ready) {
            *counts.entry(entry.host.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Hosts with more than `threshold` queued-but-not-started tasks
    pub fn overloaded_hosts(&self, threshold: usize) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .ready_per_host()
            .into_iter()
            .filter(|(_, count)| *count > threshold)
            .map(|(host, _)| host)
            .collect();
        hosts.sort();
        hosts
    }

    /// Number of non-terminal tasks
    pub fn active_count(&self) -> usize {
        self.states.values().filter(|entry| !entry.state.is_terminal()).count()
    }

    pub fn summary(&self) -> LedgerSummary {
        let mut summary = LedgerSummary::default();
        let mut hosts = HashSet::new();

        for entry in self.states.values() {
            match entry.state {
                TaskState::Ready => summary.ready += 1,
                TaskState::Downloading => summary.downloading += 1,
                TaskState::Processing => summary.processing += 1,
                TaskState::Done => summary.done += 1,
                TaskState::Error => summary.error += 1,
            }
            if !entry.state.is_terminal() {
                hosts.insert(entry.host.as_str());
            }
        }

        summary.hosts = hosts.len();
        summary
    }
}

enum Command {
    Register(Vec<Task>),
    SetState { task_id: TaskId, state: TaskState, reply: oneshot::Sender<Option<TaskState>> },
    Transition { task_id: TaskId, next: TaskState, reply: oneshot::Sender<Transition> },
    GetState { task_id: TaskId, reply: oneshot::Sender<Option<TaskState>> },
    Clear,
    CleanTerminal { reply: oneshot::Sender<usize> },
    ReadyPerHost { reply: oneshot::Sender<HashMap<String, usize>> },
    OverloadedHosts { threshold: usize, reply: oneshot::Sender<Vec<String>> },
    ActiveCount { reply: oneshot::Sender<usize> },
    Summary { reply: oneshot::Sender<LedgerSummary> },
}

/// Handle to the accountant; every operation runs one at a time inside the accountant task
#[derive(Clone)]
pub struct AccountantHandle {
    tx: mpsc::Sender<Command>,
}

impl AccountantHandle {
    /// Start the accountant with an empty ledger
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel(1024);

        tokio::spawn(async move {
            let mut ledger = TaskLedger::new();
            while let Some(command) = rx.recv().await {
                handle(&mut ledger, command);
            }
            debug!("Task accountant stopped");
        });

        Self { tx }
    }

    pub async fn register(&self, tasks: Vec<Task>) -> Result<(), ActorError> {
        self.tx
            .send(Command::Register(tasks))
            .await
            .map_err(|_| ActorError::Closed(NAME))
    }

    pub async fn set_state(&self, task_id: &str, state: TaskState) -> Result<Option<TaskState>, ActorError> {
        let task_id = task_id.to_string();
        ask(&self.tx, NAME, |reply| Command::SetState { task_id, state, reply }).await
    }

    pub async fn transition(&self, task_id: &str, next: TaskState) -> Result<Transition, ActorError> {
        let task_id = task_id.to_string();
        ask(&self.tx, NAME, |reply| Command::Transition { task_id, next, reply }).await
    }

    pub async fn get_state(&self, task_id: &str) -> Result<Option<TaskState>, ActorError> {
        let task_id = task_id.to_string();
        ask(&self.tx, NAME, |reply| Command::GetState { task_id, reply }).await
    }

    pub async fn clear(&self) -> Result<(), ActorError> {
        self.tx.send(Command::Clear).await.map_err(|_| ActorError::Closed(NAME))
    }

    pub async fn clean_terminal(&self) -> Result<usize, ActorError> {
        ask(&self.tx, NAME, |reply| Command::CleanTerminal { reply }).await
    }

    pub async fn ready_per_host(&self) -> Result<HashMap<String, usize>, ActorError> {
        ask(&self.tx, NAME, |reply| Command::ReadyPerHost { reply }).await
    }

    pub async fn overloaded_hosts(&self, threshold: usize) -> Result<Vec<String>, ActorError> {
        ask(&self.tx, NAME, |reply| Command::OverloadedHosts { threshold, reply }).await
    }

    pub async fn active_count(&self) -> Result<usize, ActorError> {
        ask(&self.tx, NAME, |reply| Command::ActiveCount { reply }).await
    }

    pub async fn summary(&self) -> Result<LedgerSummary, ActorError> {
        ask(&self.tx, NAME, |reply| Command::Summary { reply }).await
    }
}

fn handle(ledger: &mut TaskLedger, command: Command) {
    // A dropped reply receiver only means the caller gave up waiting
    match command {
        Command::Register(tasks) => {
            for task in &tasks {
                ledger.register(task);
            }
            debug!("Registered {} tasks", tasks.len());
        }
        Command::SetState { task_id, state, reply } => {
            let _ = reply.send(ledger.set_state(&task_id, state));
        }
        Command::Transition { task_id, next, reply } => {
            let _ = reply.send(ledger.transition(&task_id, next));
        }
        Command::GetState { task_id, reply } => {
            let _ = reply.send(ledger.get_state(&task_id));
        }
        Command::Clear => ledger.clear(),
        Command::CleanTerminal { reply } => {
            let _ = reply.send(ledger.clean_terminal());
        }
        Command::ReadyPerHost { reply } => {
            let _ = reply.send(ledger.ready_per_host());
        }
        Command::OverloadedHosts { threshold, reply } => {
            let _ = reply.send(ledger.overloaded_hosts(threshold));
        }
        Command::ActiveCount { reply } => {
            let _ = reply.send(ledger.active_count());
        }
        Command::Summary { reply } => {
            let _ = reply.send(ledger.summary());
        }
    }
}
