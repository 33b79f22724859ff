use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sliding window in-memory rate limiter (pod local).
#[derive(Clone)]
pub struct InMemoryRateLimiter {
    store: Arc<DashMap<String, VecDeque<Instant>>>,
    pub enabled: bool,
}

impl InMemoryRateLimiter {
    pub fn new(enabled: bool) -> Self {
        Self {
            store: Arc::new(DashMap::new()),
            enabled,
        }
    }

    /// Returns true if allowed, false if limited.
    pub fn check(&self, key: &str, limit: usize, window: Duration) -> bool {
        if !self.enabled {
            return true;
        }
        let now = Instant::now();
        let mut entry = self.store.entry(key.to_string()).or_default();
        while let Some(front) = entry.front() {
            if now.duration_since(*front) >= window {
                entry.pop_front();
            } else {
                break;
            }
        }
        if entry.len() < limit {
            entry.push_back(now);
            true
        } else {
            false
        }
    }
}

/// Convenience wrapper holding per-action config derived from env.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub thread_limit: usize,
    pub thread_window: Duration,
    pub post_limit: usize,
    pub post_window: Duration,
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        fn usize_env(name: &str, default: usize) -> usize {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }
        fn dur_env(name: &str, default: u64) -> Duration {
            Duration::from_secs(
                std::env::var(name)
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(default),
            )
        }
        Self {
            thread_limit: usize_env("RL_THREAD_LIMIT", 1),
            thread_window: dur_env("RL_THREAD_WINDOW", 300),
            post_limit: usize_env("RL_POST_LIMIT", 10),
            post_window: dur_env("RL_POST_WINDOW", 60),
        }
    }
}

/// High level guard used by handlers.
#[derive(Clone)]
pub struct RateLimiterFacade {
    pub limiter: InMemoryRateLimiter,
    pub cfg: RateLimitConfig,
}

impl RateLimiterFacade {
    pub fn new(limiter: InMemoryRateLimiter, cfg: RateLimitConfig) -> Self {
        Self { limiter, cfg }
    }

    pub fn allow_thread(&self, ip: &str) -> bool {
        self.limiter
            .check(&format!("thread:{ip}"), self.cfg.thread_limit, self.cfg.thread_window)
    }

    pub fn allow_post(&self, ip: &str) -> bool {
        self.limiter
            .check(&format!("post:{ip}"), self.cfg.post_limit, self.cfg.post_window)
    }
}
