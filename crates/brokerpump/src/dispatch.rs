// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-message dispatch.
//!
//! Both pumps hand every arriving message to a [`Dispatcher`], either inline
//! (concurrency 1) or through a [`WorkerPool`]. The dispatcher owns the
//! per-message contract: deserialize, optional lock renewal, user callback,
//! auto-disposition, error reporting.

use crate::error::HandlerError;
use crate::handler::{ErrorContext, ErrorSource, MessageContext, MessageHandler, Settler};
use crate::link::ManagementChannel;
use crate::message::{DeliveryOutcome, MessageSerializer, ReceivedMessage, WireMessage};
use crate::renewal::{LockRenewalOperation, RenewalStatus, RenewalTiming};
use crate::stats::PumpStats;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Bounded pool of handler tasks.
///
/// `submit` waits for a free slot, so a busy pool stops the caller from
/// pulling more messages off its link.
pub(crate) struct WorkerPool {
    name: String,
    size: usize,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    submitted: AtomicU64,
}

impl WorkerPool {
    pub(crate) fn new(name: impl Into<String>, size: usize, cancel: CancellationToken) -> Self {
        let size = size.max(1);
        Self {
            name: name.into(),
            size,
            permits: Arc::new(Semaphore::new(size)),
            cancel,
            submitted: AtomicU64::new(0),
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Work items handed to a separate task so far.
    pub(crate) fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Run `work` on its own task once a slot frees up.
    ///
    /// Returns `false` if the pool was shut down first.
    pub(crate) async fn submit<F>(&self, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };

        self.submitted.fetch_add(1, Ordering::Relaxed);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = work => {}
            }
            drop(permit);
        });
        true
    }

    /// Wait until every submitted item has finished, or the pool shuts down.
    pub(crate) async fn wait_idle(&self) {
        let Ok(total) = u32::try_from(self.size) else {
            return;
        };
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            all = self.permits.acquire_many(total) => drop(all),
        }
    }

    /// Abort in-flight items and refuse new ones. Idempotent.
    pub(crate) fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(pool = %self.name, "Worker pool shut down");
        }
        self.cancel.cancel();
    }
}

/// Message lock renewal settings for non-session pumps.
#[derive(Clone)]
pub(crate) struct MessageLockRenewal {
    pub management: Arc<dyn ManagementChannel>,
    pub max_duration: Duration,
    pub timing: RenewalTiming,
}

impl MessageLockRenewal {
    fn start(&self, message: &ReceivedMessage) -> Option<LockRenewalOperation> {
        let token = message.lock_token()?;
        let locked_until = message.locked_until()?;
        Some(LockRenewalOperation::for_message(
            Arc::clone(&self.management),
            token,
            locked_until,
            self.max_duration,
            self.timing,
        ))
    }
}

/// Per-message contract shared by both pumps.
pub(crate) struct Dispatcher {
    pub handler: Arc<dyn MessageHandler>,
    pub serializer: Arc<dyn MessageSerializer>,
    pub auto_disposition: bool,
    pub message_renewal: Option<MessageLockRenewal>,
    pub namespace: String,
    pub entity_path: String,
    pub stats: Arc<PumpStats>,
}

impl Dispatcher {
    /// Process one wire message to completion. Never fails: every error is
    /// routed to the user error handler.
    pub(crate) async fn dispatch(&self, wire: WireMessage, settler: Arc<dyn Settler>) {
        PumpStats::incr(&self.stats.messages_received);
        let session_id = wire.session_id.clone();

        let message = match self.serializer.deserialize(wire) {
            Ok(message) => message,
            Err(err) => {
                self.report(Arc::new(err), ErrorSource::Receive, session_id.as_deref())
                    .await;
                return;
            }
        };

        let renewal = self
            .message_renewal
            .as_ref()
            .and_then(|renewal| renewal.start(&message));

        let context = MessageContext::new(message, settler);
        let failure = match AssertUnwindSafe(self.handler.process_message(&context))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(panic) => Some(panic_error(panic)),
        };

        let succeeded = failure.is_none();
        if let Some(err) = failure {
            PumpStats::incr(&self.stats.handler_errors);
            tracing::warn!(
                message_id = %context.message().message_id(),
                session_id = ?context.session_id(),
                "Message handler failed: {}",
                err
            );
            self.report(Arc::from(err), ErrorSource::UserCallback, context.session_id())
                .await;
        }

        if self.auto_disposition && !context.is_settled() {
            let outcome = if succeeded {
                DeliveryOutcome::Complete
            } else {
                DeliveryOutcome::abandon()
            };
            self.auto_settle(&context, outcome).await;
        }

        if let Some(renewal) = renewal {
            if renewal.status() == RenewalStatus::Failed {
                PumpStats::incr(&self.stats.renewal_failures);
                if let Some(err) = renewal.error() {
                    self.report(Arc::new(err), ErrorSource::RenewLock, context.session_id())
                        .await;
                }
            }
            renewal.close();
        }
    }

    async fn auto_settle(&self, context: &MessageContext, outcome: DeliveryOutcome) {
        let source = ErrorSource::for_outcome(&outcome);
        let completing = matches!(outcome, DeliveryOutcome::Complete);

        match context.settle(outcome).await {
            Ok(()) => {
                if completing {
                    PumpStats::incr(&self.stats.messages_completed);
                } else {
                    PumpStats::incr(&self.stats.messages_abandoned);
                }
            }
            Err(err) => {
                PumpStats::incr(&self.stats.settlement_errors);
                tracing::warn!(
                    message_id = %context.message().message_id(),
                    "Auto-settlement failed: {}",
                    err
                );
                self.report(Arc::new(err), source, context.session_id()).await;
            }
        }
    }

    /// Hand an error to the user error handler. Panics there are logged.
    pub(crate) async fn report(
        &self,
        error: Arc<dyn std::error::Error + Send + Sync>,
        source: ErrorSource,
        session_id: Option<&str>,
    ) {
        let context = ErrorContext::new(
            error,
            source,
            &self.namespace,
            &self.entity_path,
            session_id,
        );
        if AssertUnwindSafe(self.handler.process_error(&context))
            .catch_unwind()
            .await
            .is_err()
        {
            tracing::error!(source = ?source, "Error handler panicked");
        }
    }
}

fn panic_error(panic: Box<dyn Any + Send>) -> HandlerError {
    let detail = if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    };
    HandlerError::from(format!("message handler panicked: {}", detail))
}
