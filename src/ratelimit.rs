//! Fixed 60-second window rate limiting, keyed by (API key, tool?). Two
//! scopes per key — global and per-(key,tool) — each with its own counter
//! and window boundary. Deliberately a fixed window, not the sliding window
//! this codebase uses elsewhere for LLM request-rate tracking: a single
//! monotone reset instant is part of the contract here, which a sliding
//! window can't give you.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_in_ms: u64,
}

struct Window {
    count: u32,
    window_start: Instant,
    last_touched: Instant,
}

impl Window {
    fn fresh(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            last_touched: now,
        }
    }

    fn roll_if_expired(&mut self, now: Instant, window: Duration) {
        if now.duration_since(self.window_start) >= window {
            self.count = 0;
            self.window_start = now;
        }
        self.last_touched = now;
    }
}

const WINDOW: Duration = Duration::from_secs(60);
const SWEEP_IDLE_AFTER: Duration = Duration::from_secs(10 * 60);

/// `check(scopeKey, limitPerMin) -> {allowed, remaining, resetInMs}`.
/// Counter bumps only on allowed calls, per the contract — callers must
/// only invoke `check` when they intend to actually charge the call through.
pub struct RateLimiter {
    scopes: Mutex<HashMap<String, Window>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            scopes: Mutex::new(HashMap::new()),
        }
    }

    fn scope_key(key: &str, tool: Option<&str>) -> String {
        match tool {
            Some(t) => format!("{key}\0{t}"),
            None => key.to_string(),
        }
    }

    /// Read-only: reports whether a call would be allowed and what
    /// `remaining`/`resetInMs` would result, without bumping the counter.
    /// Window rollover still happens here (it's a function of wall-clock
    /// time, not of whether this particular call is allowed) but the count
    /// itself is only mutated by [`commit`](Self::commit).
    pub fn peek(&self, key: &str, tool: Option<&str>, limit_per_min: u32) -> CheckResult {
        let now = Instant::now();
        let scope = Self::scope_key(key, tool);
        let mut scopes = self.scopes.lock().unwrap();
        let window = scopes.entry(scope).or_insert_with(|| Window::fresh(now));
        window.roll_if_expired(now, WINDOW);

        let reset_in_ms = WINDOW
            .saturating_sub(now.duration_since(window.window_start))
            .as_millis() as u64;

        if window.count >= limit_per_min {
            CheckResult {
                allowed: false,
                remaining: 0,
                reset_in_ms,
            }
        } else {
            CheckResult {
                allowed: true,
                remaining: limit_per_min - window.count - 1,
                reset_in_ms,
            }
        }
    }

    /// Bumps the scope's counter. Callers must only call this for a call
    /// that was actually allowed through end to end — this is the only
    /// place the count changes, per the "counter bumps only on allowed
    /// calls" contract.
    pub fn commit(&self, key: &str, tool: Option<&str>) {
        let now = Instant::now();
        let scope = Self::scope_key(key, tool);
        let mut scopes = self.scopes.lock().unwrap();
        let window = scopes.entry(scope).or_insert_with(|| Window::fresh(now));
        window.roll_if_expired(now, WINDOW);
        window.count += 1;
    }

    /// Convenience atomic `peek` + `commit`-if-allowed, for callers (tests,
    /// simple gates) that don't need to defer the bump past other checks.
    pub fn check(&self, key: &str, tool: Option<&str>, limit_per_min: u32) -> CheckResult {
        let result = self.peek(key, tool, limit_per_min);
        if result.allowed {
            self.commit(key, tool);
        }
        result
    }

    /// Evict scopes idle longer than 10 minutes, bounding memory for keys
    /// that stop calling entirely. Run from a periodic sweep task.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut scopes = self.scopes.lock().unwrap();
        scopes.retain(|_, w| now.duration_since(w.last_touched) < SWEEP_IDLE_AFTER);
    }

    pub fn len(&self) -> usize {
        self.scopes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Spawn the periodic idle-scope sweep, same `tokio::spawn` + interval idiom
/// used for the keystore's debounced flush.
pub fn spawn_sweep_task(limiter: std::sync::Arc<RateLimiter>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            limiter.sweep();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_plus_remaining_equals_limit() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            let r = limiter.check("k1", None, 5);
            assert!(r.allowed);
        }
        let r = limiter.check("k1", None, 5);
        assert_eq!(r.remaining + 4, 5);
    }

    #[test]
    fn denies_once_limit_reached_and_counter_does_not_move() {
        let limiter = RateLimiter::new();
        for _ in 0..2 {
            assert!(limiter.check("k1", None, 2).allowed);
        }
        let denied = limiter.check("k1", None, 2);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        let still_denied = limiter.check("k1", None, 2);
        assert!(!still_denied.allowed);
    }

    #[test]
    fn global_and_per_tool_scopes_are_independent() {
        let limiter = RateLimiter::new();
        assert!(limiter.check("k1", None, 1).allowed);
        assert!(limiter.check("k1", Some("search"), 1).allowed);
        assert!(!limiter.check("k1", None, 1).allowed);
        assert!(!limiter.check("k1", Some("search"), 1).allowed);
        assert!(limiter.check("k1", Some("other"), 1).allowed);
    }
}
