// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pump lifecycle and the non-session message pump.
//!
//! Pumps are single use: `begin()` once, run until terminated, never resumed.
//! Termination (owner cancel, link failure, connection health check) is
//! idempotent and notifies the owner exactly once through `on_terminate`, so
//! a [`crate::Processor`] can build a fresh pump after a backoff.

use crate::config::ProcessorConfig;
use crate::dispatch::{Dispatcher, MessageLockRenewal, WorkerPool};
use crate::error::{LinkError, PumpError, Result, TerminationCause};
use crate::handler::{ErrorSource, MessageHandler, Settler};
use crate::link::{LinkProvider, ManagementChannel, ReceiveLink};
use crate::message::{DefaultSerializer, DeliveryOutcome, MessageSerializer, ReceivedMessage};
use crate::stats::{PumpStats, PumpStatsSnapshot};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

static NEXT_PUMP_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_pump_id() -> u64 {
    NEXT_PUMP_ID.fetch_add(1, Ordering::Relaxed)
}

/// Called once when a pump terminates.
pub type OnTerminate = Arc<dyn Fn(&TerminationCause) + Send + Sync>;

/// A single-use message pump.
pub trait Pump: Send + Sync {
    fn pump_id(&self) -> u64;

    /// Start pumping. Fails with [`PumpError::IllegalState`] on a second call
    /// or outside a Tokio runtime.
    fn begin(self: Arc<Self>) -> Result<PumpHandle>;

    fn stats(&self) -> PumpStatsSnapshot;
}

pub(crate) trait Terminate: Send + Sync {
    fn terminate(&self, cause: TerminationCause);
}

/// Cancels a running pump. Cheap to clone.
#[derive(Clone)]
pub struct PumpCanceller {
    pump: Arc<dyn Terminate>,
}

impl PumpCanceller {
    /// Terminate the pump. Never blocks.
    pub fn cancel(&self) {
        self.pump.terminate(TerminationCause::Cancelled);
    }
}

/// Handle returned by [`Pump::begin`].
pub struct PumpHandle {
    pump_id: u64,
    canceller: PumpCanceller,
    task: JoinHandle<Result<()>>,
}

impl PumpHandle {
    pub(crate) fn new(pump_id: u64, pump: Arc<dyn Terminate>, task: JoinHandle<Result<()>>) -> Self {
        Self {
            pump_id,
            canceller: PumpCanceller { pump },
            task,
        }
    }

    pub fn pump_id(&self) -> u64 {
        self.pump_id
    }

    /// Terminate the pump. Never blocks; links close in the background.
    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    pub fn canceller(&self) -> PumpCanceller {
        self.canceller.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for termination. `Ok` after a cancel, otherwise
    /// [`PumpError::Terminated`] carrying the cause.
    pub async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(PumpError::IllegalState(format!(
                "pump {} supervisor failed: {}",
                self.pump_id, err
            ))),
        }
    }
}

impl std::fmt::Debug for PumpHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PumpHandle")
            .field("pump_id", &self.pump_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Empty,
    Running,
    Terminated,
}

/// State machine and termination guard shared by both pump kinds.
pub(crate) struct Lifecycle {
    pub pump_id: u64,
    namespace: String,
    entity_path: String,
    state: Mutex<LifecycleState>,
    terminated: AtomicBool,
    cause: Mutex<Option<TerminationCause>>,
    cancel: CancellationToken,
    on_terminate: Mutex<Option<OnTerminate>>,
    runtime: Mutex<Option<Handle>>,
}

impl Lifecycle {
    pub(crate) fn new(pump_id: u64, namespace: &str, entity_path: &str) -> Self {
        Self {
            pump_id,
            namespace: namespace.to_string(),
            entity_path: entity_path.to_string(),
            state: Mutex::new(LifecycleState::Empty),
            terminated: AtomicBool::new(false),
            cause: Mutex::new(None),
            cancel: CancellationToken::new(),
            on_terminate: Mutex::new(None),
            runtime: Mutex::new(None),
        }
    }

    pub(crate) fn set_on_terminate(&self, callback: OnTerminate) {
        *self.on_terminate.lock() = Some(callback);
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Empty -> Running, capturing the runtime to spawn on.
    pub(crate) fn start(&self) -> Result<Handle> {
        let runtime = Handle::try_current().map_err(|_| {
            PumpError::IllegalState("pump must be started inside a Tokio runtime".into())
        })?;

        let mut state = self.state.lock();
        match *state {
            LifecycleState::Empty => {
                *state = LifecycleState::Running;
                *self.runtime.lock() = Some(runtime.clone());
                Ok(runtime)
            }
            LifecycleState::Running => Err(PumpError::IllegalState(format!(
                "pump {} is already running",
                self.pump_id
            ))),
            LifecycleState::Terminated => Err(PumpError::IllegalState(format!(
                "pump {} is terminated and cannot be restarted",
                self.pump_id
            ))),
        }
    }

    /// Run `work` on the pump's runtime without waiting for it.
    pub(crate) fn spawn_detached<F>(&self, work: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let runtime = self.runtime.lock().clone();
        if let Some(runtime) = runtime {
            runtime.spawn(work);
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Win the termination race. Only the first caller gets `true`.
    pub(crate) fn begin_termination(&self, cause: &TerminationCause) -> bool {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.cause.lock() = Some(cause.clone());
        *self.state.lock() = LifecycleState::Terminated;
        self.cancel.cancel();
        true
    }

    /// Log and notify the owner. Called once, after slot resources are released.
    pub(crate) fn finish_termination(&self, cause: &TerminationCause) {
        if cause.is_failure() {
            tracing::error!(
                pump_id = self.pump_id,
                namespace = %self.namespace,
                entity_path = %self.entity_path,
                "Pump terminated: {}",
                cause
            );
        } else {
            tracing::info!(pump_id = self.pump_id, "Pump cancelled");
        }

        let callback = self.on_terminate.lock().take();
        if let Some(callback) = callback {
            callback(cause);
        }
    }

    /// Terminal result for the handle.
    pub(crate) fn result(&self) -> Result<()> {
        match self.cause.lock().clone() {
            Some(cause) if cause.is_failure() => Err(PumpError::Terminated {
                pump_id: self.pump_id,
                namespace: self.namespace.clone(),
                entity_path: self.entity_path.clone(),
                cause,
            }),
            _ => Ok(()),
        }
    }
}

/// Resolves once the provider reports its connection closed.
pub(crate) async fn watch_connection(
    provider: Arc<dyn LinkProvider>,
    interval: Duration,
) -> TerminationCause {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if provider.is_connection_closed() {
            tracing::warn!(
                entity = %provider.entity_path(),
                "Connection reported closed"
            );
            return TerminationCause::ConnectionClosed;
        }
    }
}

/// Credits granted when a link opens.
pub(crate) fn initial_credits(prefetch: u32, concurrency: usize) -> u32 {
    let concurrency = u32::try_from(concurrency).unwrap_or(u32::MAX);
    prefetch.max(concurrency).max(1)
}

/// Settles directly on the pump's single link.
struct LinkSettler {
    link: Arc<dyn ReceiveLink>,
}

#[async_trait]
impl Settler for LinkSettler {
    async fn settle(&self, message: &ReceivedMessage, outcome: DeliveryOutcome) -> Result<()> {
        let lock_token = message.lock_token().ok_or(PumpError::ReceiveAndDelete)?;
        self.link.update_disposition(lock_token, outcome).await?;
        Ok(())
    }
}

/// Pumps a non-session queue or subscription over one continuous link.
///
/// With concurrency 1 the handler runs inline on the pump's own task;
/// otherwise each message goes to a worker pool bounded by concurrency.
pub struct MessagePump {
    lifecycle: Lifecycle,
    config: ProcessorConfig,
    provider: Arc<dyn LinkProvider>,
    handler: Arc<dyn MessageHandler>,
    serializer: Arc<dyn MessageSerializer>,
    management: Option<Arc<dyn ManagementChannel>>,
    stats: Arc<PumpStats>,
    workers: WorkerPool,
    link: Mutex<Option<Arc<dyn ReceiveLink>>>,
}

impl MessagePump {
    pub fn new(
        config: ProcessorConfig,
        provider: Arc<dyn LinkProvider>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let pump_id = next_pump_id();
        let lifecycle = Lifecycle::new(pump_id, &config.fully_qualified_namespace, &config.entity_path);
        let workers = WorkerPool::new(
            format!("pump-{}", pump_id),
            config.max_concurrent_calls,
            lifecycle.cancel_token().child_token(),
        );
        Self {
            lifecycle,
            config,
            provider,
            handler,
            serializer: Arc::new(DefaultSerializer),
            management: None,
            stats: Arc::new(PumpStats::new(pump_id)),
            workers,
            link: Mutex::new(None),
        }
    }

    /// Renew message locks through `management` while handlers run.
    pub fn with_management(mut self, management: Arc<dyn ManagementChannel>) -> Self {
        self.management = Some(management);
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

    /// Handler executions handed to worker tasks (always 0 with concurrency 1).
    pub fn worker_submissions(&self) -> u64 {
        self.workers.submitted()
    }

    fn dispatcher(&self) -> Dispatcher {
        let message_renewal = match &self.management {
            Some(management) if self.config.renewal_enabled() => Some(MessageLockRenewal {
                management: Arc::clone(management),
                max_duration: self.config.max_auto_lock_renew_duration(),
                timing: self.config.renewal_timing(),
            }),
            _ => None,
        };
        Dispatcher {
            handler: Arc::clone(&self.handler),
            serializer: Arc::clone(&self.serializer),
            auto_disposition: self.config.auto_disposition(),
            message_renewal,
            namespace: self.config.fully_qualified_namespace.clone(),
            entity_path: self.config.entity_path.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    async fn receive(&self) -> TerminationCause {
        let dispatcher = Arc::new(self.dispatcher());
        let link = match self.provider.create_link(None).await {
            Ok(link) => link,
            Err(err) => {
                dispatcher
                    .report(Arc::new(err.clone()), ErrorSource::Receive, None)
                    .await;
                return TerminationCause::LinkFailed(err);
            }
        };

        *self.link.lock() = Some(Arc::clone(&link));
        if self.lifecycle.is_terminated() {
            let raced = self.link.lock().take();
            if let Some(link) = raced {
                link.close().await;
            }
            return TerminationCause::Cancelled;
        }

        let mut stream = link.messages();
        let credits = initial_credits(self.config.prefetch_count, self.config.max_concurrent_calls);
        link.add_credits(credits);
        tracing::info!(
            pump_id = self.lifecycle.pump_id,
            link = %link.link_name(),
            credits,
            concurrency = self.workers.size(),
            "Message pump receiving"
        );

        let settler: Arc<dyn Settler> = Arc::new(LinkSettler {
            link: Arc::clone(&link),
        });

        loop {
            match stream.next().await {
                Some(Ok(message)) => {
                    link.add_credits(1);
                    if self.workers.size() == 1 {
                        dispatcher.dispatch(message, Arc::clone(&settler)).await;
                    } else {
                        let dispatcher = Arc::clone(&dispatcher);
                        let settler = Arc::clone(&settler);
                        self.workers
                            .submit(async move { dispatcher.dispatch(message, settler).await })
                            .await;
                    }
                }
                Some(Err(err)) => {
                    dispatcher
                        .report(Arc::new(err.clone()), ErrorSource::Receive, None)
                        .await;
                    return TerminationCause::LinkFailed(err);
                }
                None => {
                    return TerminationCause::LinkFailed(LinkError::Closed(
                        link.link_name().to_string(),
                    ));
                }
            }
        }
    }
}

impl Terminate for MessagePump {
    fn terminate(&self, cause: TerminationCause) {
        if !self.lifecycle.begin_termination(&cause) {
            return;
        }

        self.workers.shutdown();
        let link = self.link.lock().take();
        if let Some(link) = link {
            self.lifecycle.spawn_detached(async move { link.close().await });
        }
        self.lifecycle.finish_termination(&cause);
    }
}

impl Pump for MessagePump {
    fn pump_id(&self) -> u64 {
        self.lifecycle.pump_id
    }

    fn begin(self: Arc<Self>) -> Result<PumpHandle> {
        let runtime = self.lifecycle.start()?;
        let pump = Arc::clone(&self);

        let task = runtime.spawn(async move {
            let provider = Arc::clone(&pump.provider);
            let interval = pump.config.connection_poll_interval();
            let cancel = pump.lifecycle.cancel_token().clone();

            let cause = tokio::select! {
                _ = cancel.cancelled() => TerminationCause::Cancelled,
                cause = pump.receive() => cause,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_credits() {
        assert_eq!(initial_credits(0, 1), 1);
        assert_eq!(initial_credits(0, 8), 8);
        assert_eq!(initial_credits(50, 8), 50);
    }

    #[test]
    fn test_lifecycle_single_use() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        let _guard = runtime.enter();
        let lifecycle = Lifecycle::new(9, "ns", "queue");

        assert!(lifecycle.start().is_ok());
        assert!(matches!(
            lifecycle.start(),
            Err(PumpError::IllegalState(_))
        ));

        assert!(lifecycle.begin_termination(&TerminationCause::ConnectionClosed));
        assert!(!lifecycle.begin_termination(&TerminationCause::Cancelled));
        assert!(matches!(
            lifecycle.start(),
            Err(PumpError::IllegalState(_))
        ));

        let err = lifecycle.result().unwrap_err();
        assert_eq!(
            err.termination_cause(),
            Some(&TerminationCause::ConnectionClosed)
        );
    }

    #[test]
    fn test_lifecycle_requires_runtime() {
        let lifecycle = Lifecycle::new(10, "ns", "queue");
        assert!(matches!(
            lifecycle.start(),
            Err(PumpError::IllegalState(_))
        ));
    }

    #[test]
    fn test_on_terminate_fires_once() {
        let lifecycle = Lifecycle::new(11, "ns", "queue");
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        lifecycle.set_on_terminate(Arc::new(move |_cause| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        lifecycle.finish_termination(&TerminationCause::Cancelled);
        lifecycle.finish_termination(&TerminationCause::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(lifecycle.result().is_ok());
    }
}
