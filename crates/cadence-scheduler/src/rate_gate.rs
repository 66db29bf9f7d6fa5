//! RateGate — per-resource fixed-window send throttling.
//!
//! Each resource (mailbox) has a 1-second and a 60-second window, each with a
//! counter and a window-start. `acquire` rolls expired windows forward, then
//! either takes a slot in both or sleeps a short quantum and re-checks.
//! Slots are never returned: counters decay by window rollover.
//!
//! RAM: ~100 bytes per resource.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadence_core::config::RateLimitConfig;
use tokio::time::Instant;

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);

/// One fixed window.
#[derive(Debug)]
struct Window {
    len: Duration,
    limit: u32,
    started: Instant,
    count: u32,
}

impl Window {
    fn new(len: Duration, limit: u32, now: Instant) -> Self {
        Self {
            len,
            limit,
            started: now,
            count: 0,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now.duration_since(self.started) >= self.len {
            self.started = now;
            self.count = 0;
        }
    }

    fn has_room(&self) -> bool {
        self.count < self.limit
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.len.saturating_sub(now.duration_since(self.started))
    }
}

/// Both windows for one resource.
#[derive(Debug)]
struct Slot {
    second: Window,
    minute: Window,
}

impl Slot {
    /// Take a slot, or return how long until the blocking window rolls over.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.second.roll(now);
        self.minute.roll(now);
        match (self.second.has_room(), self.minute.has_room()) {
            (true, true) => {
                self.second.count += 1;
                self.minute.count += 1;
                Ok(())
            }
            (false, _) => Err(self.second.remaining(now)),
            (true, false) => Err(self.minute.remaining(now)),
        }
    }
}

/// Shared per-resource rate limiter. Cheap to clone.
#[derive(Clone)]
pub struct RateGate {
    config: Arc<RateLimitConfig>,
    slots: Arc<Mutex<HashMap<String, Arc<Mutex<Slot>>>>>,
}

impl RateGate {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: Arc::new(config),
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn slot(&self, resource: &str) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry(resource.to_string())
            .or_insert_with(|| {
                let (per_second, per_minute) = self.config.limits_for(resource);
                let now = Instant::now();
                Arc::new(Mutex::new(Slot {
                    second: Window::new(SECOND, per_second, now),
                    minute: Window::new(MINUTE, per_minute, now),
                }))
            })
            .clone()
    }

    /// Take a slot without waiting. Returns false if either window is full.
    pub fn try_acquire(&self, resource: &str) -> bool {
        let slot = self.slot(resource);
        let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.try_take(Instant::now()).is_ok()
    }

    /// Wait until a slot is available for `resource`, then take it.
    pub async fn acquire(&self, resource: &str) {
        let slot = self.slot(resource);
        let quantum = Duration::from_millis(self.config.quantum_ms.max(1));
        let mut waited = false;
        loop {
            let outcome = {
                let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
                slot.try_take(Instant::now())
            };
            match outcome {
                Ok(()) => {
                    if waited {
                        tracing::debug!("🚦 Rate gate opened for {resource}");
                    }
                    return;
                }
                Err(until_roll) => {
                    if !waited {
                        tracing::debug!("🚦 Rate gate closed for {resource} ({until_roll:?} to rollover)");
                        waited = true;
                    }
                    // Never oversleep the rollover so a waiter gets in within one window.
                    tokio::time::sleep(quantum.min(until_roll.max(Duration::from_millis(1)))).await;
                }
            }
        }
    }
}
