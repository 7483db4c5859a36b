//! Cross-process heartbeat
//!
//! A worker ticks a counter that lives in an anonymous shared mapping, so a
//! supervisor that forked the worker sees every tick. The monitor side never
//! writes; it only remembers the last value it saw and when it saw it:
//! - `notify()` advances the tick, wrapping at [`WRAP_TICK_AT`]
//! - `sleep()` parks the tick on [`SLEEP_TICK`], which always reads as fresh
//! - `last_update()` answers "when did this worker last make progress"

use chrono::{DateTime, Utc};
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{Error, Result};

/// Tick value right after creation
pub const INITIAL_TICK: i64 = 0;

/// Tick value while the worker is in a safe blocking call
pub const SLEEP_TICK: i64 = -1;

/// Ticks wrap back to zero once they reach this value
pub const WRAP_TICK_AT: i64 = 1 << 30;

/// Tick that follows `current`
pub fn next_tick(current: i64) -> i64 {
    let next = current + 1;
    if next >= WRAP_TICK_AT {
        INITIAL_TICK
    } else {
        next
    }
}

/// The shared cell. Unmapped when the last handle in this process drops.
struct SharedTicker {
    cell: NonNull<AtomicI64>,
    len: NonZeroUsize,
}

// The mapping is only ever accessed through the atomic.
unsafe impl Send for SharedTicker {}
unsafe impl Sync for SharedTicker {}

impl SharedTicker {
    fn map() -> Result<Self> {
        let len = NonZeroUsize::new(std::mem::size_of::<AtomicI64>())
            .ok_or_else(|| Error::Heartbeat("zero-sized ticker".to_string()))?;

        // SAFETY: a fresh anonymous mapping aliases no Rust object, and its
        // page alignment satisfies AtomicI64.
        let cell = unsafe {
            let addr = mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
            .map_err(|e| Error::Heartbeat(format!("mmap failed: {}", e)))?;
            let cell = addr.cast::<AtomicI64>();
            cell.as_ptr().write(AtomicI64::new(INITIAL_TICK));
            cell
        };

        Ok(Self { cell, len })
    }

    fn atomic(&self) -> &AtomicI64 {
        // SAFETY: the mapping stays valid for the lifetime of `self`.
        unsafe { self.cell.as_ref() }
    }
}

impl Drop for SharedTicker {
    fn drop(&mut self) {
        // SAFETY: no references into the mapping outlive `self`.
        unsafe {
            let _ = munmap(self.cell.cast(), self.len.get());
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    last_seen: i64,
    last_updated: DateTime<Utc>,
}

/// Liveness counter shared with the supervisor.
///
/// Cloning shares the counter; each clone keeps its own observation state,
/// so one clone can be handed to a monitor while the worker keeps another.
pub struct Heartbeat {
    ticker: Arc<SharedTicker>,
    observed: Mutex<Observation>,
}

impl Heartbeat {
    /// Create a heartbeat at the initial tick, observed as of now
    pub fn new() -> Result<Self> {
        let ticker = Arc::new(SharedTicker::map()?);
        let heartbeat = Self {
            ticker,
            observed: Mutex::new(Observation {
                last_seen: INITIAL_TICK,
                last_updated: Utc::now(),
            }),
        };
        heartbeat.saw(heartbeat.tick());
        Ok(heartbeat)
    }

    /// Advance the tick
    pub fn notify(&self) {
        // Single writer per worker, so the update never actually retries.
        let _ = self
            .ticker
            .atomic()
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(next_tick(v)));
    }

    /// Park the tick on the safe-sleep sentinel
    pub fn sleep(&self) {
        self.ticker.atomic().store(SLEEP_TICK, Ordering::Release);
    }

    /// Current raw tick
    pub fn tick(&self) -> i64 {
        self.ticker.atomic().load(Ordering::Acquire)
    }

    /// Check if the worker is in a safe sleep
    pub fn is_sleeping(&self) -> bool {
        self.tick() == SLEEP_TICK
    }

    /// Timestamp of the most recent observed progress
    pub fn last_update(&self) -> DateTime<Utc> {
        let tick = self.tick();
        let mut observed = self.observation();
        if tick == SLEEP_TICK || tick != observed.last_seen {
            *observed = Observation {
                last_seen: tick,
                last_updated: Utc::now(),
            };
        }
        observed.last_updated
    }

    /// Check if no progress was seen for longer than `timeout`
    pub fn is_stale(&self, timeout: Duration) -> bool {
        let since = Utc::now().signed_duration_since(self.last_update());
        since.to_std().map(|d| d > timeout).unwrap_or(false)
    }

    fn saw(&self, tick: i64) {
        let mut observed = self.observation();
        observed.last_seen = tick;
        observed.last_updated = Utc::now();
    }

    fn observation(&self) -> std::sync::MutexGuard<'_, Observation> {
        self.observed.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    fn set_tick(&self, value: i64) {
        self.ticker.atomic().store(value, Ordering::Release);
    }
}

impl Clone for Heartbeat {
    fn clone(&self) -> Self {
        Self {
            ticker: Arc::clone(&self.ticker),
            observed: Mutex::new(*self.observation()),
        }
    }
}

impl std::fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heartbeat")
            .field("tick", &self.tick())
            .finish_non_exhaustive()
    }
}
