// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Rolling session receiver.
//!
//! One per concurrency slot. Each roller loops: acquire the next session,
//! adopt it, stream it through its workers until the session ends, drain the
//! workers, close the session, and acquire again.
//!
//! # Rotation
//!
//! ```text
//! Init ──adopt──► Active(r1) ──adopt──► Active(r2) ──► ...
//!   │                 │                     │
//!   └─────────────────┴──── terminate ──────┴──► Terminated (absorbing)
//! ```
//!
//! Adoption is a compare-and-swap on the state. A session acquired after (or
//! racing with) termination is closed instead of adopted, so no link outlives
//! its slot. The tracker is only updated once the swap has been won.

use super::receiver::{SessionMessages, SessionReceiver, SessionReceiverOptions};
use super::tracker::SessionReceiversTracker;
use crate::dispatch::{Dispatcher, WorkerPool};
use crate::error::{LinkError, TerminationCause};
use crate::handler::{ErrorSource, Settler};
use crate::link::SessionAcquirer;
use crate::message::WireMessage;
use crate::stats::PumpStats;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/// Slot state.
#[derive(Debug)]
pub(crate) enum RollerState {
    Init,
    Active(Arc<SessionReceiver>),
    Terminated,
}

/// Adoption refused because the slot terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RollerTerminated;

/// Collaborators shared by every roller of a pump.
pub(crate) struct RollerContext {
    pub pump_id: u64,
    pub acquirer: Arc<dyn SessionAcquirer>,
    pub tracker: Arc<SessionReceiversTracker>,
    pub dispatcher: Arc<Dispatcher>,
    pub settler: Arc<dyn Settler>,
    pub options: SessionReceiverOptions,
    pub calls_per_session: usize,
    pub stats: Arc<PumpStats>,
    pub runtime: Handle,
}

pub(crate) struct RollingSessionReceiver {
    roller_id: usize,
    context: Arc<RollerContext>,
    state: ArcSwap<RollerState>,
    workers: WorkerPool,
    cancel: CancellationToken,
}

impl RollingSessionReceiver {
    pub(crate) fn new(roller_id: usize, context: Arc<RollerContext>) -> Self {
        let cancel = CancellationToken::new();
        let workers = WorkerPool::new(
            format!("pump-{}-roller-{}", context.pump_id, roller_id),
            context.calls_per_session,
            cancel.child_token(),
        );
        Self {
            roller_id,
            context,
            state: ArcSwap::from_pointee(RollerState::Init),
            workers,
            cancel,
        }
    }

    pub(crate) fn roller_id(&self) -> usize {
        self.roller_id
    }

    pub(crate) fn is_terminated(&self) -> bool {
        matches!(**self.state.load(), RollerState::Terminated)
    }

    /// Session currently adopted by this slot.
    pub(crate) fn current_session_id(&self) -> Option<String> {
        match &**self.state.load() {
            RollerState::Active(receiver) if !receiver.is_disposed() => {
                Some(receiver.session_id().to_string())
            }
            _ => None,
        }
    }

    /// Handler executions submitted to separate tasks.
    pub(crate) fn submitted(&self) -> u64 {
        self.workers.submitted()
    }

    /// Rotate through sessions until terminated.
    ///
    /// Returns `Err` only for failures that must take the whole pump down.
    pub(crate) async fn run(self: Arc<Self>) -> Result<(), TerminationCause> {
        loop {
            // Exactly one acquisition in flight for this slot.
            let acquired = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                acquired = self.context.acquirer.acquire() => acquired,
            };

            let opened = match acquired {
                Ok(link) => SessionReceiver::open(link, &self.context.options).await,
                Err(err) => Err(err),
            };
            let (receiver, messages) = match opened {
                Ok(opened) => opened,
                Err(err) => return self.acquire_failed(err).await,
            };

            if self.adopt(&receiver).await.is_err() {
                return Ok(());
            }

            self.stream_session(&receiver, messages).await;
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            self.release(&receiver).await;
        }
    }

    async fn acquire_failed(&self, err: LinkError) -> Result<(), TerminationCause> {
        if self.is_terminated() {
            return Ok(());
        }
        tracing::error!(
            pump_id = self.context.pump_id,
            roller_id = self.roller_id,
            "Session acquisition failed: {}",
            err
        );
        self.context
            .dispatcher
            .report(Arc::new(err.clone()), ErrorSource::AcceptSession, None)
            .await;
        Err(TerminationCause::AcquireFailed(err))
    }

    /// Make `receiver` the active session, or close it if the slot terminated.
    pub(crate) async fn adopt(
        &self,
        receiver: &Arc<SessionReceiver>,
    ) -> Result<(), RollerTerminated> {
        let current = self.state.load_full();
        let won = match &*current {
            RollerState::Terminated => false,
            _ => {
                let next = Arc::new(RollerState::Active(Arc::clone(receiver)));
                let previous = self.state.compare_and_swap(&current, next);
                Arc::ptr_eq(&current, &*previous)
            }
        };

        if !won {
            tracing::debug!(
                pump_id = self.context.pump_id,
                roller_id = self.roller_id,
                session_id = %receiver.session_id(),
                "Slot terminated, closing acquired session"
            );
            receiver.close().await;
            return Err(RollerTerminated);
        }

        if let RollerState::Active(old) = &*current {
            self.context.tracker.untrack(old);
        }
        self.context.tracker.track(receiver);
        PumpStats::incr(&self.context.stats.sessions_acquired);
        tracing::info!(
            pump_id = self.context.pump_id,
            roller_id = self.roller_id,
            session_id = %receiver.session_id(),
            "Session acquired"
        );
        Ok(())
    }

    async fn stream_session(&self, receiver: &Arc<SessionReceiver>, mut messages: SessionMessages) {
        let renewal_failed = receiver.renewal_failed();
        tokio::pin!(renewal_failed);
        let mut renewal_watched = true;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = &mut renewal_failed, if renewal_watched => {
                    renewal_watched = false;
                    self.report_renewal_failure(receiver).await;
                    continue;
                }
                next = messages.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    receiver.link().add_credits(1);
                    self.dispatch(message).await;
                }
                Some(Err(err)) => {
                    tracing::warn!(
                        roller_id = self.roller_id,
                        session_id = %receiver.session_id(),
                        "Session link failed: {}",
                        err
                    );
                    self.context
                        .dispatcher
                        .report(Arc::new(err), ErrorSource::Receive, Some(receiver.session_id()))
                        .await;
                    return;
                }
                None => return,
            }
        }
    }

    async fn dispatch(&self, message: WireMessage) {
        let dispatcher = Arc::clone(&self.context.dispatcher);
        let settler = Arc::clone(&self.context.settler);

        if self.workers.size() == 1 {
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = dispatcher.dispatch(message, settler) => {}
            }
        } else {
            self.workers
                .submit(async move { dispatcher.dispatch(message, settler).await })
                .await;
        }
    }

    /// Drain the ending session's handlers, then close it.
    async fn release(&self, receiver: &Arc<SessionReceiver>) {
        self.workers.wait_idle().await;
        self.report_renewal_failure(receiver).await;

        receiver.close().await;
        self.context.tracker.untrack(receiver);
        PumpStats::incr(&self.context.stats.sessions_closed);
        tracing::info!(
            pump_id = self.context.pump_id,
            roller_id = self.roller_id,
            session_id = %receiver.session_id(),
            "Session released"
        );
    }

    /// Report a failed session lock renewal. At most once per session.
    async fn report_renewal_failure(&self, receiver: &SessionReceiver) {
        let Some(err) = receiver.take_renewal_error() else {
            return;
        };
        PumpStats::incr(&self.context.stats.renewal_failures);
        tracing::warn!(
            roller_id = self.roller_id,
            session_id = %receiver.session_id(),
            "Session lock renewal failed: {}",
            err
        );
        self.context
            .dispatcher
            .report(Arc::new(err), ErrorSource::RenewLock, Some(receiver.session_id()))
            .await;
    }

    /// Terminate the slot. Never blocks; the active link is closed in the
    /// background. Idempotent.
    pub(crate) fn terminate(&self) {
        let previous = self.state.swap(Arc::new(RollerState::Terminated));
        self.cancel.cancel();
        self.workers.shutdown();

        if let RollerState::Active(receiver) = &*previous {
            let receiver = Arc::clone(receiver);
            self.context.runtime.spawn(async move {
                receiver.close().await;
            });
        }
    }
}

impl std::fmt::Debug for RollingSessionReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollingSessionReceiver")
            .field("roller_id", &self.roller_id)
            .field("state", &**self.state.load())
            .finish()
    }
}
