use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::cli::config::{HostExceptionSettings, LimitSettings};
use crate::domain::TaskId;
use super::{ask, ActorError};

const NAME: &str = "admission controller";

/// One held connection slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub task_id: TaskId,
    pub host: String,
    pub reserved_at: Instant,
}

/// Connection slots held per host, keyed by the task holding them
#[derive(Debug)]
pub struct SlotTable {
    default_limit: usize,
    exception_limit: usize,
    exception_hosts: HashSet<String>,
    max_duration: Duration,
    reservations: HashMap<TaskId, Reservation>,
    per_host: HashMap<String, usize>,
}

impl SlotTable {
    pub fn new(limits: &LimitSettings, exceptions: &HostExceptionSettings) -> Self {
        Self {
            default_limit: limits.max_concurrent_connections,
            exception_limit: exceptions.max_concurrent_connections,
            exception_hosts: exceptions.hosts.iter().map(|host| host.to_lowercase()).collect(),
            max_duration: limits.max_job_processing_duration(),
            reservations: HashMap::new(),
            per_host: HashMap::new(),
        }
    }

    /// Connection limit for a host, with the exception override applied
    pub fn effective_limit(&self, host: &str) -> usize {
        if self.exception_hosts.contains(&host.to_lowercase()) {
            self.exception_limit
        } else {
            self.default_limit
        }
    }

    pub fn reserved(&self, host: &str) -> usize {
        self.per_host.get(host).copied().unwrap_or(0)
    }

    pub fn free_slots(&self, host: &str) -> usize {
        self.effective_limit(host).saturating_sub(self.reserved(host))
    }

    /// Take a slot on `host` for `task_id`. A task already holding a slot on the same host keeps it.
    pub fn reserve(&mut self, host: &str, task_id: &str, now: Instant) -> bool {
        if let Some(existing) = self.reservations.get(task_id) {
            if existing.host == host {
                return true;
            }
            warn!("Task {} already holds a slot on {}, refusing {}", task_id, existing.host, host);
            return false;
        }

        if self.reserved(host) >= self.effective_limit(host) {
            debug!("No free slot on {} for task {}", host, task_id);
            return false;
        }

        self.reservations.insert(
            task_id.to_string(),
            Reservation { task_id: task_id.to_string(), host: host.to_string(), reserved_at: now },
        );
        *self.per_host.entry(host.to_string()).or_insert(0) += 1;
        true
    }

    /// Give back the slot held by a task; returns the host it was held on
    pub fn release(&mut self, task_id: &str) -> Option<String> {
        let reservation = self.reservations.remove(task_id)?;

        if let Some(count) = self.per_host.get_mut(&reservation.host) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_host.remove(&reservation.host);
            }
        }

        Some(reservation.host)
    }

    /// Force-release reservations held longer than the maximum processing duration
    pub fn sweep(&mut self, now: Instant) -> Vec<Reservation> {
        let expired: Vec<TaskId> = self
            .reservations
            .values()
            .filter(|r| now.saturating_duration_since(r.reserved_at) > self.max_duration)
            .map(|r| r.task_id.clone())
            .collect();

        let mut released = Vec::with_capacity(expired.len());
        for task_id in expired {
            if let Some(reservation) = self.reservations.get(&task_id).cloned() {
                self.release(&task_id);
                released.push(reservation);
            }
        }
        released
    }

    /// Hosts whose every slot is currently held
    pub fn saturated_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .per_host
            .keys()
            .filter(|host| self.free_slots(host) == 0)
            .cloned()
            .collect();
        hosts.sort();
        hosts
    }

    /// Reserved slots per host, busiest first
    pub fn occupancy(&self) -> Vec<(String, usize)> {
        let mut hosts: Vec<(String, usize)> = self.per_host.iter().map(|(h, c)| (h.clone(), *c)).collect();
        hosts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hosts
    }
}

enum Command {
    Reserve { host: String, task_id: TaskId, reply: oneshot::Sender<bool> },
    Release { task_id: TaskId, reply: oneshot::Sender<Option<String>> },
    FreeSlots { hosts: Vec<String>, reply: oneshot::Sender<HashMap<String, usize>> },
    Saturated { reply: oneshot::Sender<Vec<String>> },
    Sweep { reply: oneshot::Sender<Vec<Reservation>> },
    Occupancy { reply: oneshot::Sender<Vec<(String, usize)>> },
}

/// Handle to the admission controller; the slot table is only touched by the controller task
#[derive(Clone)]
pub struct LimiterHandle {
    tx: mpsc::Sender<Command>,
}

impl LimiterHandle {
    pub fn spawn(table: SlotTable) -> Self {
        let (tx, mut rx) = mpsc::channel(1024);

        tokio::spawn(async move {
            let mut table = table;
            while let Some(command) = rx.recv().await {
                handle(&mut table, command);
            }
            debug!("Admission controller stopped");
        });

        Self { tx }
    }

    pub async fn reserve(&self, host: &str, task_id: &str) -> Result<bool, ActorError> {
        let (host, task_id) = (host.to_string(), task_id.to_string());
        ask(&self.tx, NAME, |reply| Command::Reserve { host, task_id, reply }).await
    }

    pub async fn release(&self, task_id: &str) -> Result<Option<String>, ActorError> {
        let task_id = task_id.to_string();
        ask(&self.tx, NAME, |reply| Command::Release { task_id, reply }).await
    }

    pub async fn free_slots(&self, hosts: Vec<String>) -> Result<HashMap<String, usize>, ActorError> {
        ask(&self.tx, NAME, |reply| Command::FreeSlots { hosts, reply }).await
    }

    pub async fn saturated_hosts(&self) -> Result<Vec<String>, ActorError> {
        ask(&self.tx, NAME, |reply| Command::Saturated { reply }).await
    }

    pub async fn sweep(&self) -> Result<Vec<Reservation>, ActorError> {
        ask(&self.tx, NAME, |reply| Command::Sweep { reply }).await
    }

    pub async fn occupancy(&self) -> Result<Vec<(String, usize)>, ActorError> {
        ask(&self.tx, NAME, |reply| Command::Occupancy { reply }).await
    }
}

fn handle(table: &mut SlotTable, command: Command) {
    match command {
        Command::Reserve { host, task_id, reply } => {
            let _ = reply.send(table.reserve(&host, &task_id, Instant::now()));
        }
        Command::Release { task_id, reply } => {
            let _ = reply.send(table.release(&task_id));
        }
        Command::FreeSlots { hosts, reply } => {
            let free = hosts
                .into_iter()
                .map(|host| {
                    let free = table.free_slots(&host);
                    (host, free)
                })
                .collect();
            let _ = reply.send(free);
        }
        Command::Saturated { reply } => {
            let _ = reply.send(table.saturated_hosts());
        }
        Command::Sweep { reply } => {
            let released = table.sweep(Instant::now());
            for reservation in &released {
                info!(
                    "Force-released slot on {} held by task {} for {:?}",
                    reservation.host,
                    reservation.task_id,
                    reservation.reserved_at.elapsed()
                );
            }
            let _ = reply.send(released);
        }
        Command::Occupancy { reply } => {
            let _ = reply.send(table.occupancy());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn table(default_limit: usize, exception_limit: usize, exception_hosts: &[&str]) -> SlotTable {
        let limits = LimitSettings {
            max_concurrent_connections: default_limit,
            max_job_processing_duration_secs: 60,
            ..LimitSettings::default()
        };
        let exceptions = HostExceptionSettings {
            max_concurrent_connections: exception_limit,
            hosts: exception_hosts.iter().map(|h| h.to_string()).collect(),
            ignored_hosts: vec![],
        };
        SlotTable::new(&limits, &exceptions)
    }

    #[test]
    fn test_reserve_denies_at_limit() {
        let mut slots = table(1, 3, &["big.org"]);
        let now = Instant::now();

        assert!(slots.reserve("a.org", "t1", now));
        assert!(!slots.reserve("a.org", "t2", now));
        // Same task asking again keeps its slot
        assert!(slots.reserve("a.org", "t1", now));
        assert_eq!(slots.reserved("a.org"), 1);

        assert!(slots.reserve("big.org", "b1", now));
        assert!(slots.reserve("big.org", "b2", now));
        assert!(slots.reserve("big.org", "b3", now));
        assert!(!slots.reserve("big.org", "b4", now));
        assert_eq!(slots.free_slots("big.org"), 0);
    }

    #[test]
    fn test_release_unheld_slot_is_harmless() {
        let mut slots = table(1, 1, &[]);
        assert_eq!(slots.release("nobody"), None);

        assert!(slots.reserve("a.org", "t1", Instant::now()));
        assert_eq!(slots.release("t1"), Some("a.org".to_string()));
        assert_eq!(slots.release("t1"), None);
        assert_eq!(slots.free_slots("a.org"), 1);
    }

    #[test]
    fn test_saturated_hosts() {
        let mut slots = table(1, 2, &["big.org"]);
        let now = Instant::now();

        assert!(slots.reserve("a.org", "t1", now));
        assert!(slots.reserve("big.org", "b1", now));
        assert_eq!(slots.saturated_hosts(), vec!["a.org".to_string()]);

        assert!(slots.reserve("big.org", "b2", now));
        assert_eq!(slots.saturated_hosts(), vec!["a.org".to_string(), "big.org".to_string()]);

        slots.release("t1");
        assert_eq!(slots.saturated_hosts(), vec!["big.org".to_string()]);
    }

    #[test]
    fn test_sweep_releases_stale_reservations() {
        let mut slots = table(2, 2, &[]);
        let start = Instant::now();

        assert!(slots.reserve("a.org", "old", start));
        assert!(slots.reserve("a.org", "new", start + Duration::from_secs(50)));

        let released = slots.sweep(start + Duration::from_secs(61));
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].task_id, "old");
        assert_eq!(slots.reserved("a.org"), 1);
        assert_eq!(slots.occupancy(), vec![("a.org".to_string(), 1)]);
    }

    #[test]
    fn test_random_reserve_release_never_exceeds_limit() {
        let hosts = ["a.org", "b.org", "c.org", "vip.org"];
        let mut rng = StdRng::seed_from_u64(7);

        for round in 0..20 {
            let default_limit = rng.gen_range(1..4);
            let exception_limit = rng.gen_range(1..6);
            let mut slots = table(default_limit, exception_limit, &["vip.org"]);
            let mut held: Vec<String> = Vec::new();
            let now = Instant::now();

            for step in 0..500 {
                if held.is_empty() || rng.gen_bool(0.6) {
                    let host = hosts[rng.gen_range(0..hosts.len())];
                    let task_id = format!("{}-{}", round, step);
                    if slots.reserve(host, &task_id, now) {
                        held.push(task_id);
                    }
                } else {
                    let index = rng.gen_range(0..held.len());
                    let task_id = held.swap_remove(index);
                    assert!(slots.release(&task_id).is_some());
                }

                for host in hosts {
                    assert!(slots.reserved(host) <= slots.effective_limit(host));
                }
                assert_eq!(slots.occupancy().iter().map(|(_, c)| c).sum::<usize>(), held.len());
            }
        }
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let limiter = LimiterHandle::spawn(table(1, 1, &[]));

        assert!(limiter.reserve("a.org", "t1").await.unwrap());
        assert!(!limiter.reserve("a.org", "t2").await.unwrap());

        let free = limiter.free_slots(vec!["a.org".to_string(), "b.org".to_string()]).await.unwrap();
        assert_eq!(free.get("a.org"), Some(&0));
        assert_eq!(free.get("b.org"), Some(&1));

        assert_eq!(limiter.release("t1").await.unwrap(), Some("a.org".to_string()));
        assert!(limiter.sweep().await.unwrap().is_empty());
    }
}
