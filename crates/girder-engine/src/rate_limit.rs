//! Rate limiters
//!
//! Token-bucket and sliding-window limiters, a keyed variant that
//! partitions limits by an arbitrary key, and a composite with
//! all-must-pass semantics. All variants are non-blocking and safe under
//! concurrent access.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

/// Non-blocking rate limiter
pub trait RateLimiter: Send + Sync {
    /// Try to take `permits`; returns whether they were granted
    fn try_acquire(&self, permits: u32) -> bool;

    /// Return permits taken by a failed composite acquire. Limiters that
    /// cannot meaningfully refund may ignore this.
    fn release(&self, permits: u32) {
        let _ = permits;
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: sustained `rate` tokens/second with bursts up to
/// `capacity`
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate: f64, capacity: u32) -> Self {
        let capacity = f64::from(capacity);
        Self {
            rate: rate.max(0.0),
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_refill = now;
    }

    /// Tokens currently available (after refill)
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }
}

impl RateLimiter for TokenBucket {
    fn try_acquire(&self, permits: u32) -> bool {
        let needed = f64::from(permits);
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= needed {
            state.tokens -= needed;
            true
        } else {
            false
        }
    }

    fn release(&self, permits: u32) {
        let mut state = self.state.lock();
        state.tokens = (state.tokens + f64::from(permits)).min(self.capacity);
    }
}

/// Sliding window: at most `max_calls` in the most recent `window`
pub struct SlidingWindow {
    max_calls: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1),
            window,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    fn prune(&self, calls: &mut VecDeque<Instant>) {
        let cutoff = Instant::now() - self.window;
        while calls.front().is_some_and(|&at| at < cutoff) {
            calls.pop_front();
        }
    }

    /// Calls inside the current window
    pub fn current_count(&self) -> usize {
        let mut calls = self.calls.lock();
        self.prune(&mut calls);
        calls.len()
    }
}

impl RateLimiter for SlidingWindow {
    fn try_acquire(&self, permits: u32) -> bool {
        let permits = permits as usize;
        let mut calls = self.calls.lock();
        self.prune(&mut calls);
        if calls.len() + permits <= self.max_calls {
            let now = Instant::now();
            for _ in 0..permits {
                calls.push_back(now);
            }
            true
        } else {
            false
        }
    }

    fn release(&self, permits: u32) {
        let mut calls = self.calls.lock();
        for _ in 0..permits {
            calls.pop_back();
        }
    }
}

/// Partitions limits by an arbitrary key (endpoint, tenant, ...)
pub struct KeyedRateLimiter {
    factory: Box<dyn Fn() -> Arc<dyn RateLimiter> + Send + Sync>,
    limiters: DashMap<String, Arc<dyn RateLimiter>>,
}

impl KeyedRateLimiter {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Arc<dyn RateLimiter> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            limiters: DashMap::new(),
        }
    }

    fn limiter(&self, key: &str) -> Arc<dyn RateLimiter> {
        self.limiters
            .entry(key.to_string())
            .or_insert_with(|| (self.factory)())
            .clone()
    }

    pub fn try_acquire(&self, key: &str, permits: u32) -> bool {
        self.limiter(key).try_acquire(permits)
    }

    pub fn release(&self, key: &str, permits: u32) {
        self.limiter(key).release(permits);
    }

    pub fn partition_count(&self) -> usize {
        self.limiters.len()
    }
}

/// All-must-pass combination of limiters.
///
/// Acquires from each in order; on the first refusal, permits already
/// taken are returned so a rejected call leaves no residue.
pub struct CompositeRateLimiter {
    limiters: Vec<Arc<dyn RateLimiter>>,
}

impl CompositeRateLimiter {
    pub fn new(limiters: Vec<Arc<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for CompositeRateLimiter {
    fn try_acquire(&self, permits: u32) -> bool {
        for (i, limiter) in self.limiters.iter().enumerate() {
            if !limiter.try_acquire(permits) {
                for taken in &self.limiters[..i] {
                    taken.release(permits);
                }
                return false;
            }
        }
        true
    }

    fn release(&self, permits: u32) {
        for limiter in &self.limiters {
            limiter.release(permits);
        }
    }
}
