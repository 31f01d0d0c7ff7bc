use super::CheckpointPolicy;

/// Tracks how far a pass may move its checkpoint.
///
/// Records must be reported in fetch order (ascending timestamp). The
/// tracked value never drops below the starting checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointTracker {
    policy: CheckpointPolicy,
    start: i64,
    high: i64,
    blocked: bool,
}

impl CheckpointTracker {
    pub fn new(start: i64, policy: CheckpointPolicy) -> Self {
        Self {
            policy,
            start,
            high: start,
            blocked: false,
        }
    }

    pub fn succeed(&mut self, timestamp: i64) {
        if self.blocked {
            return;
        }
        self.high = self.high.max(timestamp);
    }

    pub fn fail(&mut self) {
        if self.policy == CheckpointPolicy::Stall {
            self.blocked = true;
        }
    }

    pub fn value(&self) -> i64 {
        self.high
    }

    pub fn advanced(&self) -> bool {
        self.high > self.start
    }
}
