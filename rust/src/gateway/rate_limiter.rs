use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Fixed-window request counter.
///
/// The window restarts on the first request after it has elapsed; requests
/// beyond `max_requests` inside a window are refused without blocking.
#[derive(Debug, Clone)]
pub struct FixedWindow {
    max_requests: u32,
    window: Duration,
    count: u32,
    window_start: Instant,
}

impl FixedWindow {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            count: 0,
            window_start: Instant::now(),
        }
    }

    /// Count one request. Returns false if the window budget is spent.
    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 0;
        }
        if self.count >= self.max_requests {
            return false;
        }
        self.count += 1;
        true
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn window_start(&self) -> Instant {
        self.window_start
    }
}

/// Sliding-window event log: how many events happened in the last `window`.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    window: Duration,
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            hits: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(first) = self.hits.front() {
            if now.duration_since(*first) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record one event and return the count inside the window, this one included.
    pub fn record(&mut self) -> usize {
        let now = Instant::now();
        self.prune(now);
        self.hits.push_back(now);
        self.hits.len()
    }

    /// True when nothing happened inside the window (safe to forget this source).
    pub fn is_idle(&mut self) -> bool {
        self.prune(Instant::now());
        self.hits.is_empty()
    }
}
