use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Last time work arrived or finished on this worker
#[derive(Debug, Clone)]
pub struct Activity {
    base: Instant,
    last_millis: Arc<AtomicU64>,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            last_millis: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn touch(&self) {
        let millis = self.base.elapsed().as_millis() as u64;
        self.last_millis.fetch_max(millis, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.base.elapsed().saturating_sub(last)
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once no activity was seen for `timeout`
pub async fn watch(activity: Activity, timeout: Duration) {
    loop {
        let idle = activity.idle_for();
        if idle >= timeout {
            return;
        }
        sleep(timeout - idle).await;
    }
}
