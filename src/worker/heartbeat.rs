/// Counts heartbeat ticks that went unanswered
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    missed: u32,
    limit: u32,
}

impl HeartbeatMonitor {
    pub fn new(limit: u32) -> Self {
        Self { missed: 0, limit }
    }

    /// Register a tick. Returns true when the peer must be restarted; the
    /// counter then starts over and the current tick counts as the first miss.
    pub fn on_tick(&mut self) -> bool {
        let restart = self.missed >= self.limit;
        if restart {
            self.missed = 0;
        }
        self.missed += 1;
        restart
    }

    pub fn on_pong(&mut self) {
        self.missed = 0;
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }
}
