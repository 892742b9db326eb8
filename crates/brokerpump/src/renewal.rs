// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lock renewal.
//!
//! A [`LockRenewalOperation`] keeps one message or session lock alive by
//! renewing it roughly halfway through each validity window, until its
//! renewal budget runs out, it is closed, or a renewal fails.
//!
//! # Schedule
//!
//! ```text
//! remaining = locked_until - now
//! delay     = 0                                        if remaining < threshold
//!           = remaining - min(remaining / 2, buffer)   otherwise
//! ```
//!
//! No renewal is scheduled past `start + max_renewal_duration`; the operation
//! completes at that instant instead.

use crate::error::LinkError;
use crate::link::ManagementChannel;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Renew function: lock id in, new expiry out.
pub type RenewFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<SystemTime, LinkError>> + Send + Sync>;

/// Default threshold below which renewal fires immediately.
pub const RENEW_IMMEDIATELY_THRESHOLD: Duration = Duration::from_millis(400);

/// Default cap on how far before expiry a renewal is scheduled.
pub const RENEWAL_BUFFER_CAP: Duration = Duration::from_secs(10);

/// Minimum spacing between back-to-back renewals when every renewal returns
/// a lock that is already below the immediate threshold.
pub const MIN_RENEWAL_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Renewal operation status. Everything but `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalStatus {
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl RenewalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Scheduling constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalTiming {
    pub renew_immediately_threshold: Duration,
    pub renewal_buffer_cap: Duration,
}

impl Default for RenewalTiming {
    fn default() -> Self {
        Self {
            renew_immediately_threshold: RENEW_IMMEDIATELY_THRESHOLD,
            renewal_buffer_cap: RENEWAL_BUFFER_CAP,
        }
    }
}

impl RenewalTiming {
    /// Delay before the next renewal of a lock valid until `locked_until`.
    ///
    /// Expired locks and clock skew give a zero delay.
    pub fn next_delay(&self, locked_until: SystemTime, now: SystemTime) -> Duration {
        let remaining = locked_until.duration_since(now).unwrap_or(Duration::ZERO);
        if remaining < self.renew_immediately_threshold {
            return Duration::ZERO;
        }
        let buffer = (remaining / 2).min(self.renewal_buffer_cap);
        remaining.saturating_sub(buffer)
    }
}

struct RenewalState {
    lock_id: String,
    is_session: bool,
    locked_until: Mutex<SystemTime>,
    status: watch::Sender<RenewalStatus>,
    error: Mutex<Option<LinkError>>,
    cancel: CancellationToken,
}

impl RenewalState {
    /// Move to `next` unless already terminal.
    fn transition(&self, next: RenewalStatus) -> bool {
        self.status.send_if_modified(|status| {
            if status.is_terminal() {
                false
            } else {
                *status = next;
                true
            }
        })
    }
}

/// Keeps one lock alive in the background.
///
/// Must be created inside a Tokio runtime. Dropping the operation cancels it.
pub struct LockRenewalOperation {
    state: Arc<RenewalState>,
    max_renewal_duration: Duration,
}

impl LockRenewalOperation {
    /// Start renewing `lock_id`.
    ///
    /// A zero `max_renewal_duration` never renews and completes immediately.
    pub fn new(
        lock_id: impl Into<String>,
        is_session: bool,
        locked_until: SystemTime,
        max_renewal_duration: Duration,
        timing: RenewalTiming,
        renew: RenewFn,
    ) -> Self {
        let (status, _) = watch::channel(RenewalStatus::Running);
        let state = Arc::new(RenewalState {
            lock_id: lock_id.into(),
            is_session,
            locked_until: Mutex::new(locked_until),
            status,
            error: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        if max_renewal_duration.is_zero() {
            state.transition(RenewalStatus::Complete);
        } else {
            let budget_end = Instant::now() + max_renewal_duration;
            tokio::spawn(run_renewals(Arc::clone(&state), budget_end, timing, renew));
        }

        Self {
            state,
            max_renewal_duration,
        }
    }

    /// Renew a message lock through the management channel.
    pub fn for_message(
        management: Arc<dyn ManagementChannel>,
        lock_token: impl Into<String>,
        locked_until: SystemTime,
        max_renewal_duration: Duration,
        timing: RenewalTiming,
    ) -> Self {
        let renew: RenewFn = Arc::new(move |token: String| {
            let management = Arc::clone(&management);
            async move { management.renew_message_lock(&token).await }.boxed()
        });
        Self::new(
            lock_token,
            false,
            locked_until,
            max_renewal_duration,
            timing,
            renew,
        )
    }

    /// Renew a session lock through the management channel.
    pub fn for_session(
        management: Arc<dyn ManagementChannel>,
        session_id: impl Into<String>,
        locked_until: SystemTime,
        max_renewal_duration: Duration,
        timing: RenewalTiming,
    ) -> Self {
        let renew: RenewFn = Arc::new(move |session_id: String| {
            let management = Arc::clone(&management);
            async move { management.renew_session_lock(&session_id).await }.boxed()
        });
        Self::new(
            session_id,
            true,
            locked_until,
            max_renewal_duration,
            timing,
            renew,
        )
    }

    /// Message lock token or session id.
    pub fn lock_id(&self) -> &str {
        &self.state.lock_id
    }

    pub fn is_session(&self) -> bool {
        self.state.is_session
    }

    pub fn max_renewal_duration(&self) -> Duration {
        self.max_renewal_duration
    }

    /// Most recent known expiry.
    pub fn locked_until(&self) -> SystemTime {
        *self.state.locked_until.lock()
    }

    pub fn status(&self) -> RenewalStatus {
        *self.state.status.borrow()
    }

    /// Error that moved the operation to `Failed`.
    pub fn error(&self) -> Option<LinkError> {
        self.state.error.lock().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<RenewalStatus> {
        self.state.status.subscribe()
    }

    /// Resolves with the terminal status.
    #[allow(clippy::let_and_return)] // the watch borrow must end before `rx` drops
    pub async fn completion(&self) -> RenewalStatus {
        let mut rx = self.state.status.subscribe();
        let status = match rx.wait_for(|status| status.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };
        status
    }

    /// Stop renewing. Idempotent; a terminal status is left as is.
    pub fn close(&self) {
        if self.state.transition(RenewalStatus::Cancelled) {
            tracing::debug!(
                lock_id = %self.state.lock_id,
                is_session = self.state.is_session,
                "Lock renewal cancelled"
            );
        }
        self.state.cancel.cancel();
    }
}

impl Drop for LockRenewalOperation {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for LockRenewalOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockRenewalOperation")
            .field("lock_id", &self.state.lock_id)
            .field("is_session", &self.state.is_session)
            .field("status", &self.status())
            .finish()
    }
}

async fn run_renewals(
    state: Arc<RenewalState>,
    budget_end: Instant,
    timing: RenewalTiming,
    renew: RenewFn,
) {
    let mut renewed = false;
    loop {
        let locked_until = *state.locked_until.lock();
        let mut delay = timing.next_delay(locked_until, SystemTime::now());
        if renewed && delay.is_zero() {
            // Renewal came back nearly expired (clock skew); don't spin.
            delay = MIN_RENEWAL_RETRY_INTERVAL;
        }
        let wake = Instant::now() + delay;

        if wake >= budget_end {
            tokio::select! {
                _ = state.cancel.cancelled() => {}
                _ = tokio::time::sleep_until(budget_end) => {
                    if state.transition(RenewalStatus::Complete) {
                        tracing::debug!(lock_id = %state.lock_id, "Lock renewal budget exhausted");
                    }
                }
            }
            return;
        }

        tokio::select! {
            _ = state.cancel.cancelled() => return,
            _ = tokio::time::sleep_until(wake) => {}
        }

        let result = tokio::select! {
            _ = state.cancel.cancelled() => return,
            result = renew(state.lock_id.clone()) => result,
        };

        match result {
            Ok(next) => {
                renewed = true;
                *state.locked_until.lock() = next;
                tracing::trace!(
                    lock_id = %state.lock_id,
                    is_session = state.is_session,
                    "Lock renewed"
                );
            }
            Err(err) => {
                tracing::warn!(
                    lock_id = %state.lock_id,
                    is_session = state.is_session,
                    "Lock renewal failed: {}",
                    err
                );
                *state.error.lock() = Some(err);
                state.transition(RenewalStatus::Failed);
                return;
            }
        }
    }
}
