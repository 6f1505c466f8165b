use h2sec_harness::Config;
use h2sec_traits::{Setting, SettingId};
use std::time::Duration;

/// Flow-control credit handed out per stream, and how long to sit on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBudget {
    pub step: u32,
    pub interval: Duration,
}

impl WindowBudget {
    pub fn from_config(config: &Config) -> Self {
        Self {
            step: config.slow_read_step,
            interval: config.slow_read_interval(),
        }
    }

    /// SETTINGS that shrink every stream's initial window to one step.
    pub fn settings(&self) -> Vec<Setting> {
        vec![Setting::new(SettingId::INITIAL_WINDOW_SIZE, self.step)]
    }
}

/// Work assigned to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Share {
    /// Streams kept open at once.
    pub concurrent: usize,
    /// Requests issued over the connection's lifetime.
    pub requests: usize,
}

/// Splits the configured requests and concurrency over connections as they
/// are dialed, since each connection's limit is only known after its
/// handshake.
#[derive(Debug, Clone)]
pub struct SharePlanner {
    total_requests: usize,
    total_concurrency: usize,
    remaining_requests: usize,
    remaining_concurrency: usize,
}

impl SharePlanner {
    /// `concurrency == 0` puts everything on a single connection.
    pub fn new(requests: usize, concurrency: usize) -> Self {
        Self {
            total_requests: requests,
            total_concurrency: concurrency,
            remaining_requests: requests,
            remaining_concurrency: concurrency,
        }
    }

    pub fn is_done(&self) -> bool {
        self.remaining_requests == 0
            || (self.total_concurrency > 0 && self.remaining_concurrency == 0)
    }

    /// Share of the next connection. `peer_limit` is its advertised
    /// SETTINGS_MAX_CONCURRENT_STREAMS; absent or zero means unbounded.
    pub fn next_share(&mut self, peer_limit: Option<u32>) -> Share {
        let limit = peer_limit
            .filter(|&n| n > 0)
            .map_or(usize::MAX, |n| n as usize);

        if self.total_concurrency == 0 {
            let share = Share {
                concurrent: limit.min(self.remaining_requests),
                requests: self.remaining_requests,
            };
            self.remaining_requests = 0;
            return share;
        }

        let concurrent = limit
            .min(self.remaining_concurrency)
            .min(self.remaining_requests);
        self.remaining_concurrency -= concurrent;

        let requests = if self.remaining_concurrency == 0 {
            self.remaining_requests
        } else {
            let proportional = (self.total_requests * concurrent + self.total_concurrency - 1)
                / self.total_concurrency;
            proportional.max(concurrent).min(self.remaining_requests)
        };
        self.remaining_requests -= requests;

        Share {
            concurrent,
            requests,
        }
    }
}
