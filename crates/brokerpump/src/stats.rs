// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pump statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters shared by a pump, its receivers and its workers.
#[derive(Debug)]
pub struct PumpStats {
    /// Owning pump.
    pub pump_id: u64,

    /// Messages taken from links.
    pub messages_received: AtomicU64,

    /// Messages settled as complete.
    pub messages_completed: AtomicU64,

    /// Messages settled as abandoned.
    pub messages_abandoned: AtomicU64,

    /// Handler errors and panics.
    pub handler_errors: AtomicU64,

    /// Failed settlements.
    pub settlement_errors: AtomicU64,

    /// Sessions adopted by rolling receivers.
    pub sessions_acquired: AtomicU64,

    /// Sessions closed after their stream ended.
    pub sessions_closed: AtomicU64,

    /// Renewal operations that ended in failure.
    pub renewal_failures: AtomicU64,

    /// Pump creation time.
    pub created: Instant,
}

impl PumpStats {
    pub fn new(pump_id: u64) -> Self {
        Self {
            pump_id,
            messages_received: AtomicU64::new(0),
            messages_completed: AtomicU64::new(0),
            messages_abandoned: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            settlement_errors: AtomicU64::new(0),
            sessions_acquired: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            renewal_failures: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> PumpStatsSnapshot {
        PumpStatsSnapshot {
            pump_id: self.pump_id,
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_completed: self.messages_completed.load(Ordering::Relaxed),
            messages_abandoned: self.messages_abandoned.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            settlement_errors: self.settlement_errors.load(Ordering::Relaxed),
            sessions_acquired: self.sessions_acquired.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            renewal_failures: self.renewal_failures.load(Ordering::Relaxed),
            uptime_secs: self.created.elapsed().as_secs(),
        }
    }
}

/// Snapshot of pump statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PumpStatsSnapshot {
    pub pump_id: u64,
    pub messages_received: u64,
    pub messages_completed: u64,
    pub messages_abandoned: u64,
    pub handler_errors: u64,
    pub settlement_errors: u64,
    pub sessions_acquired: u64,
    pub sessions_closed: u64,
    pub renewal_failures: u64,
    pub uptime_secs: u64,
}

impl PumpStatsSnapshot {
    /// Calculate messages per second.
    pub fn messages_per_second(&self) -> f64 {
        if self.uptime_secs > 0 {
            self.messages_received as f64 / self.uptime_secs as f64
        } else {
            0.0
        }
    }
}
