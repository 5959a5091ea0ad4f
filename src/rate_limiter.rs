// Sliding-window rate limiter shared by every caller of one external API.

use std::{collections::VecDeque, time::Duration};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::Notify,
    time::{sleep_until, Instant},
};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_calls: usize,
    pub interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: 500,
            interval_ms: 60_000,
        }
    }
}

#[derive(Debug)]
struct Slot {
    id: u64,
    started: Instant,
    released: bool,
}

#[derive(Debug, Default)]
struct Window {
    slots: VecDeque<Slot>,
    next_id: u64,
}

impl Window {
    // A slot leaves the window once its call has finished and `interval` has
    // passed since the call started.
    fn evict(&mut self, now: Instant, interval: Duration) {
        self.slots
            .retain(|slot| !(slot.released && now.duration_since(slot.started) >= interval));
    }

    fn admit(&mut self, now: Instant) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.slots.push_back(Slot {
            id,
            started: now,
            released: false,
        });
        id
    }

    fn next_expiry(&self, now: Instant, interval: Duration) -> Option<Instant> {
        self.slots
            .iter()
            .map(|slot| slot.started + interval)
            .filter(|expiry| *expiry > now)
            .min()
    }
}

/// Admits at most `max_calls` call starts per rolling `interval`.
///
/// A call occupies its slot from `acquire` until both the call is released
/// and `interval` has elapsed since it started, so a call that finishes early
/// still counts for the full window.
#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    interval: Duration,
    window: Mutex<Window>,
    released: Notify,
}

impl RateLimiter {
    pub fn new(max_calls: usize, interval: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1),
            interval,
            window: Mutex::new(Window::default()),
            released: Notify::new(),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_calls, Duration::from_millis(config.interval_ms))
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits until one more call fits in the window, then records its start.
    pub async fn acquire(&self) -> RatePermit<'_> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);

            let deadline = {
                let mut window = self.window.lock();
                let now = Instant::now();
                window.evict(now, self.interval);
                if window.slots.len() < self.max_calls {
                    let id = window.admit(now);
                    return RatePermit {
                        limiter: self,
                        id,
                        done: false,
                    };
                }
                // Register interest before unlocking so a release in between is not missed
                notified.as_mut().enable();
                window.next_expiry(now, self.interval)
            };

            debug!(
                max_calls = self.max_calls,
                wait_until = ?deadline,
                "Rate limit reached, waiting for a slot"
            );
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = sleep_until(deadline) => {}
                        _ = notified.as_mut() => {}
                    }
                }
                // Every slot is past its interval but still in flight
                None => notified.await,
            }
        }
    }

    // Number of slots currently counted against the quota
    pub fn in_window(&self) -> usize {
        let mut window = self.window.lock();
        window.evict(Instant::now(), self.interval);
        window.slots.len()
    }

    fn release(&self, id: u64) {
        {
            let mut window = self.window.lock();
            if let Some(slot) = window.slots.iter_mut().find(|slot| slot.id == id) {
                slot.released = true;
            }
        }
        self.released.notify_waiters();
    }
}

/// Proof of an admitted call. Dropping it marks the call finished.
#[derive(Debug)]
pub struct RatePermit<'a> {
    limiter: &'a RateLimiter,
    id: u64,
    done: bool,
}

impl RatePermit<'_> {
    pub fn release(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if !self.done {
            self.done = true;
            self.limiter.release(self.id);
        }
    }
}

impl Drop for RatePermit<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}
