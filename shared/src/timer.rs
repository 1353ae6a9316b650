use std::time::{Duration, Instant};

/// An interval deadline the event loop schedules around. The loop computes
/// its poll timeout from `remaining()`, dispatches the owning action when
/// `ringing()`, and the action re-arms with `reset()`.
pub struct Timer {
    interval: Duration,
    deadline: Instant,
}

impl Timer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: Instant::now() + interval,
        }
    }

    /// Whether the deadline has passed
    pub fn ringing(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Re-arm for one interval from now
    pub fn reset(&mut self) {
        self.deadline = Instant::now() + self.interval;
    }

    /// Time until the deadline; zero once ringing
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}
