// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Rate-limited versions of the [`tracing`] event macros.
//!
//! Device code uses these for any event a guest can trigger at will (a
//! malformed descriptor chain, an unexpected vsock op). Each call site gets
//! its own limiter, so a noisy site cannot starve the others. When events are
//! dropped, the next logged event carries the count in a
//! `dropped_ratelimited` field.

#![forbid(unsafe_code)]

use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;
#[doc(hidden)]
pub use tracing;

const PERIOD: Duration = Duration::from_secs(5);
const EVENTS_PER_PERIOD: u32 = 10;

static DISABLE_RATE_LIMITING: AtomicBool = AtomicBool::new(false);

/// Disables or reenables rate limiting for every call site.
///
/// Rate limiting is on by default. Tests that assert on log output can turn
/// it off.
pub fn disable_rate_limiting(disabled: bool) {
    DISABLE_RATE_LIMITING.store(disabled, Ordering::Relaxed);
}

#[doc(hidden)]
pub struct RateLimiter {
    state: Mutex<Window>,
    events_per_period: u32,
}

struct Window {
    start: Option<Instant>,
    events: u32,
    missed: u64,
}

impl RateLimiter {
    pub const fn new(events_per_period: u32) -> Self {
        Self {
            state: Mutex::new(Window {
                start: None,
                events: 0,
                missed: 0,
            }),
            events_per_period,
        }
    }

    pub const fn new_default() -> Self {
        Self::new(EVENTS_PER_PERIOD)
    }

    /// Returns `Some(missed)` if the event should be emitted, where `missed`
    /// is the number of events dropped since the last emitted one.
    pub fn event(&self) -> Option<u64> {
        self.event_at(Instant::now())
    }

    fn event_at(&self, now: Instant) -> Option<u64> {
        if DISABLE_RATE_LIMITING.load(Ordering::Relaxed) {
            return Some(0);
        }
        // Contention means another thread is logging from this site right
        // now; dropping this one is fine.
        let mut window = self.state.try_lock()?;
        let start = *window.start.get_or_insert(now);
        if now.duration_since(start) > PERIOD {
            window.start = Some(now);
            window.events = 0;
        }
        if window.events >= self.events_per_period {
            window.missed += 1;
            return None;
        }
        window.events += 1;
        Some(std::mem::take(&mut window.missed))
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __ratelimited {
    ($level:ident, $($rest:tt)*) => {{
        static RATE_LIMITER: $crate::RateLimiter = $crate::RateLimiter::new_default();
        if let Some(missed) = RATE_LIMITER.event() {
            if missed != 0 {
                $crate::tracing::$level!(dropped_ratelimited = missed, $($rest)*);
            } else {
                $crate::tracing::$level!($($rest)*);
            }
        }
    }};
}

/// As [`tracing::error!`], but rate limited per call site.
#[macro_export]
macro_rules! error_ratelimited {
    ($($rest:tt)*) => { $crate::__ratelimited!(error, $($rest)*) };
}

/// As [`tracing::warn!`], but rate limited per call site.
#[macro_export]
macro_rules! warn_ratelimited {
    ($($rest:tt)*) => { $crate::__ratelimited!(warn, $($rest)*) };
}

/// As [`tracing::info!`], but rate limited per call site.
#[macro_export]
macro_rules! info_ratelimited {
    ($($rest:tt)*) => { $crate::__ratelimited!(info, $($rest)*) };
}
