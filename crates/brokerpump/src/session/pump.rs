// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session-aware message pump.

use super::acquirer::LinkSessionAcquirer;
use super::receiver::SessionReceiverOptions;
use super::rolling::{RollerContext, RollingSessionReceiver};
use super::tracker::{SessionReceiversTracker, TrackerSettler};
use crate::config::ProcessorConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Result, TerminationCause};
use crate::handler::MessageHandler;
use crate::link::{LinkProvider, ManagementChannel, SessionAcquirer};
use crate::message::{DefaultSerializer, MessageSerializer};
use crate::pump::{
    initial_credits, next_pump_id, watch_connection, Lifecycle, OnTerminate, Pump, PumpHandle,
    Terminate,
};
use crate::stats::{PumpStats, PumpStatsSnapshot};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Pumps a session-enabled entity with `max_concurrent_sessions` rolling
/// receivers sharing one session tracker.
///
/// The pump is single use. Any roller failing to acquire a session, the
/// connection health check, or the owner's cancel terminates every slot;
/// [`SessionsMessagePump::on_terminate`] then fires exactly once.
pub struct SessionsMessagePump {
    lifecycle: Lifecycle,
    config: ProcessorConfig,
    provider: Arc<dyn LinkProvider>,
    acquirer: Arc<dyn SessionAcquirer>,
    handler: Arc<dyn MessageHandler>,
    serializer: Arc<dyn MessageSerializer>,
    management: Option<Arc<dyn ManagementChannel>>,
    tracker: Arc<SessionReceiversTracker>,
    stats: Arc<PumpStats>,
    rollers: Mutex<Vec<Arc<RollingSessionReceiver>>>,
}

impl SessionsMessagePump {
    pub fn new(
        config: ProcessorConfig,
        provider: Arc<dyn LinkProvider>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let pump_id = next_pump_id();
        let lifecycle = Lifecycle::new(pump_id, &config.fully_qualified_namespace, &config.entity_path);
        let acquirer = Arc::new(LinkSessionAcquirer::new(Arc::clone(&provider)));
        Self {
            lifecycle,
            config,
            provider,
            acquirer,
            handler,
            serializer: Arc::new(DefaultSerializer),
            management: None,
            tracker: Arc::new(SessionReceiversTracker::new()),
            stats: Arc::new(PumpStats::new(pump_id)),
            rollers: Mutex::new(Vec::new()),
        }
    }

    /// Renew session locks through `management`.
    pub fn with_management(mut self, management: Arc<dyn ManagementChannel>) -> Self {
        self.management = Some(management);
        self
    }

    /// Replace the default provider-backed acquirer.
    pub fn with_acquirer(mut self, acquirer: Arc<dyn SessionAcquirer>) -> Self {
        self.acquirer = acquirer;
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn MessageSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn on_terminate(self, callback: OnTerminate) -> Self {
        self.lifecycle.set_on_terminate(callback);
        self
    }

    /// Sessions currently held by this pump's slots.
    pub fn tracker(&self) -> &Arc<SessionReceiversTracker> {
        &self.tracker
    }

    /// Session ids adopted by live slots.
    pub fn active_sessions(&self) -> Vec<String> {
        self.rollers
            .lock()
            .iter()
            .filter_map(|roller| roller.current_session_id())
            .collect()
    }

    /// Handler executions handed to worker tasks, across all slots.
    pub fn worker_submissions(&self) -> u64 {
        self.rollers
            .lock()
            .iter()
            .map(|roller| roller.submitted())
            .sum()
    }

    fn roller_context(&self, runtime: tokio::runtime::Handle) -> Arc<RollerContext> {
        let calls_per_session = self.config.max_concurrent_calls_per_session;
        let management = self
            .management
            .as_ref()
            .filter(|_| self.config.renewal_enabled())
            .cloned();

        Arc::new(RollerContext {
            pump_id: self.lifecycle.pump_id,
            acquirer: Arc::clone(&self.acquirer),
            tracker: Arc::clone(&self.tracker),
            dispatcher: Arc::new(Dispatcher {
                handler: Arc::clone(&self.handler),
                serializer: Arc::clone(&self.serializer),
                auto_disposition: self.config.auto_disposition(),
                message_renewal: None,
                namespace: self.config.fully_qualified_namespace.clone(),
                entity_path: self.config.entity_path.clone(),
                stats: Arc::clone(&self.stats),
            }),
            settler: Arc::new(TrackerSettler::new(Arc::clone(&self.tracker))),
            options: SessionReceiverOptions {
                idle_timeout: self.config.session_idle_timeout(),
                initial_credits: initial_credits(self.config.prefetch_count, calls_per_session),
                max_renewal_duration: self.config.max_auto_lock_renew_duration(),
                timing: self.config.renewal_timing(),
                management,
            },
            calls_per_session,
            stats: Arc::clone(&self.stats),
            runtime,
        })
    }
}

impl Terminate for SessionsMessagePump {
    fn terminate(&self, cause: TerminationCause) {
        if !self.lifecycle.begin_termination(&cause) {
            return;
        }

        let rollers = std::mem::take(&mut *self.rollers.lock());
        for roller in &rollers {
            roller.terminate();
        }
        tracing::debug!(
            pump_id = self.lifecycle.pump_id,
            rollers = rollers.len(),
            "Rolling receivers terminated"
        );

        self.tracker.clear();
        self.lifecycle.finish_termination(&cause);
    }
}

impl Pump for SessionsMessagePump {
    fn pump_id(&self) -> u64 {
        self.lifecycle.pump_id
    }

    fn begin(self: Arc<Self>) -> Result<PumpHandle> {
        let runtime = self.lifecycle.start()?;
        let context = self.roller_context(runtime.clone());
        let slots = self.config.max_concurrent_sessions.max(1);

        let rollers: Vec<Arc<RollingSessionReceiver>> = (0..slots)
            .map(|roller_id| Arc::new(RollingSessionReceiver::new(roller_id, Arc::clone(&context))))
            .collect();
        *self.rollers.lock() = rollers.clone();

        let (failures, mut failed) = mpsc::unbounded_channel::<TerminationCause>();
        for roller in rollers {
            let failures = failures.clone();
            runtime.spawn(async move {
                let roller_id = roller.roller_id();
                if let Err(cause) = roller.run().await {
                    tracing::debug!(roller_id, "Rolling receiver failed: {}", cause);
                    let _ = failures.send(cause);
                }
            });
        }
        drop(failures);

        tracing::info!(
            pump_id = self.lifecycle.pump_id,
            entity_path = %self.config.entity_path,
            slots,
            calls_per_session = self.config.max_concurrent_calls_per_session,
            "Sessions pump started"
        );

        let pump = Arc::clone(&self);
        let task = runtime.spawn(async move {
            let provider = Arc::clone(&pump.provider);
            let interval = pump.config.connection_poll_interval();
            let cancel = pump.lifecycle.cancel_token().clone();

            let cause = tokio::select! {
                _ = cancel.cancelled() => TerminationCause::Cancelled,
                cause = failed.recv() => cause.unwrap_or(TerminationCause::Cancelled),
                cause = watch_connection(provider, interval) => cause,
            };
            pump.terminate(cause);
            pump.lifecycle.result()
        });

        let pump_id = self.lifecycle.pump_id;
        Ok(PumpHandle::new(pump_id, self, task))
    }

    fn stats(&self) -> PumpStatsSnapshot {
        self.stats.snapshot()
    }
}
