//! Point-in-time pool status

use serde::{Deserialize, Serialize};

/// Health snapshot of the pool
///
/// Published by the coordinator after every state change; reading it never
/// blocks and never changes pool state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    /// Whether `initialize` has completed and shutdown has not started
    pub initialized: bool,
    /// Live units (starting, idle, or busy)
    pub total_units: usize,
    /// Units currently running a task
    pub busy_units: usize,
    /// Tasks waiting for a free unit
    pub queued_tasks: usize,
    /// Configured pool size
    pub target_units: usize,
    /// Units launched but not yet ready
    pub starting_units: usize,
    /// Slots whose replacement was abandoned
    pub degraded: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub units_replaced: u64,
}

impl PoolSnapshot {
    /// Units ready to take a task right now
    pub fn idle_units(&self) -> usize {
        self.total_units
            .saturating_sub(self.busy_units)
            .saturating_sub(self.starting_units)
    }

    /// Initialized and running at full strength
    pub fn is_healthy(&self) -> bool {
        self.initialized && self.degraded == 0 && self.total_units == self.target_units
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_units() {
        let snapshot = PoolSnapshot {
            initialized: true,
            total_units: 4,
            busy_units: 2,
            starting_units: 1,
            target_units: 4,
            ..Default::default()
        };
        assert_eq!(snapshot.idle_units(), 1);
        assert!(snapshot.is_healthy());
    }

    #[test]
    fn test_unhealthy_when_degraded() {
        let snapshot = PoolSnapshot {
            initialized: true,
            total_units: 1,
            target_units: 2,
            degraded: 1,
            ..Default::default()
        };
        assert!(!snapshot.is_healthy());
        assert!(!PoolSnapshot::default().is_healthy());
    }
}
