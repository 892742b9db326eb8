// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Processor: keeps a pump running.
//!
//! Pumps are single use. The processor begins a fresh pump, waits for it to
//! terminate, backs off for `restart_backoff`, and begins another, until
//! stopped.

use crate::config::ProcessorConfig;
use crate::error::{PumpError, Result};
use crate::handler::MessageHandler;
use crate::link::{LinkProvider, ManagementChannel};
use crate::pump::{MessagePump, Pump, PumpCanceller};
use crate::session::SessionsMessagePump;
use crate::stats::PumpStatsSnapshot;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Builds a fresh pump for each run.
pub type PumpFactory = Arc<dyn Fn() -> Arc<dyn Pump> + Send + Sync>;

struct Running {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

/// Owner of a restartable pump.
pub struct Processor {
    name: String,
    identifier: String,
    factory: PumpFactory,
    restart_backoff: Duration,
    running: Mutex<Option<Running>>,
    current: Arc<Mutex<Option<(Arc<dyn Pump>, PumpCanceller)>>>,
    pumps_started: Arc<AtomicU64>,
    active: Arc<AtomicBool>,
}

impl Processor {
    pub fn new(name: impl Into<String>, restart_backoff: Duration, factory: PumpFactory) -> Self {
        Self {
            name: name.into(),
            identifier: uuid::Uuid::new_v4().to_string(),
            factory,
            restart_backoff,
            running: Mutex::new(None),
            current: Arc::new(Mutex::new(None)),
            pumps_started: Arc::new(AtomicU64::new(0)),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Processor over a non-session queue or subscription.
    pub fn for_queue(
        config: ProcessorConfig,
        provider: Arc<dyn LinkProvider>,
        handler: Arc<dyn MessageHandler>,
        management: Option<Arc<dyn ManagementChannel>>,
    ) -> Result<Self> {
        config.validate()?;
        let name = config.entity_path.clone();
        let backoff = config.restart_backoff();
        let factory: PumpFactory = Arc::new(move || {
            let mut pump = MessagePump::new(config.clone(), Arc::clone(&provider), Arc::clone(&handler));
            if let Some(management) = &management {
                pump = pump.with_management(Arc::clone(management));
            }
            Arc::new(pump)
        });
        Ok(Self::new(name, backoff, factory))
    }

    /// Processor over a session-enabled queue or subscription.
    pub fn for_sessions(
        config: ProcessorConfig,
        provider: Arc<dyn LinkProvider>,
        handler: Arc<dyn MessageHandler>,
        management: Option<Arc<dyn ManagementChannel>>,
    ) -> Result<Self> {
        config.validate()?;
        let name = config.entity_path.clone();
        let backoff = config.restart_backoff();
        let factory: PumpFactory = Arc::new(move || {
            let mut pump =
                SessionsMessagePump::new(config.clone(), Arc::clone(&provider), Arc::clone(&handler));
            if let Some(management) = &management {
                pump = pump.with_management(Arc::clone(management));
            }
            Arc::new(pump)
        });
        Ok(Self::new(name, backoff, factory))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unique id of this processor instance, attached to its log lines.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Pumps begun since start.
    pub fn pumps_started(&self) -> u64 {
        self.pumps_started.load(Ordering::Relaxed)
    }

    /// True while a pump is begun and not yet terminated.
    pub fn has_active_pump(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stats of the current pump.
    pub fn stats(&self) -> Option<PumpStatsSnapshot> {
        self.current.lock().as_ref().map(|(pump, _)| pump.stats())
    }

    /// Start pumping on the current runtime.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            PumpError::IllegalState("processor must be started inside a Tokio runtime".into())
        })?;

        let mut running = self.running.lock();
        if running.is_some() {
            return Err(PumpError::IllegalState(format!(
                "processor '{}' is already running",
                self.name
            )));
        }

        let cancel = CancellationToken::new();
        let supervisor = runtime.spawn(supervise(
            self.name.clone(),
            Arc::clone(&self.factory),
            self.restart_backoff,
            cancel.clone(),
            Arc::clone(&self.current),
            Arc::clone(&self.pumps_started),
            Arc::clone(&self.active),
        ));
        *running = Some(Running { cancel, supervisor });
        tracing::info!(
            processor = %self.name,
            identifier = %self.identifier,
            backoff_secs = self.restart_backoff.as_secs_f64(),
            "Processor started"
        );
        Ok(())
    }

    /// Cancel the current pump and stop restarting. Idempotent.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        running.cancel.cancel();
        let current = self.current.lock().take();
        if let Some((_, canceller)) = current {
            canceller.cancel();
        }
        if let Err(err) = running.supervisor.await {
            tracing::warn!(processor = %self.name, "Processor supervisor failed: {}", err);
        }
        self.active.store(false, Ordering::Release);
        tracing::info!(processor = %self.name, "Processor stopped");
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("name", &self.name)
            .field("identifier", &self.identifier)
            .field("running", &self.is_running())
            .field("pumps_started", &self.pumps_started())
            .finish()
    }
}

async fn supervise(
    name: String,
    factory: PumpFactory,
    backoff: Duration,
    cancel: CancellationToken,
    current: Arc<Mutex<Option<(Arc<dyn Pump>, PumpCanceller)>>>,
    pumps_started: Arc<AtomicU64>,
    active: Arc<AtomicBool>,
) {
    while !cancel.is_cancelled() {
        let pump = factory();
        let pump_id = pump.pump_id();

        match Arc::clone(&pump).begin() {
            Ok(handle) => {
                pumps_started.fetch_add(1, Ordering::Relaxed);
                active.store(true, Ordering::Release);
                *current.lock() = Some((pump, handle.canceller()));
                let canceller = handle.canceller();

                let result = tokio::select! {
                    _ = cancel.cancelled() => {
                        canceller.cancel();
                        Ok(())
                    }
                    result = handle.join() => result,
                };
                active.store(false, Ordering::Release);

                match result {
                    Ok(()) => tracing::info!(processor = %name, pump_id, "Pump finished"),
                    Err(err) => tracing::warn!(
                        processor = %name,
                        pump_id,
                        backoff_secs = backoff.as_secs_f64(),
                        "Pump terminated, restarting after backoff: {}",
                        err
                    ),
                }
            }
            Err(err) => {
                tracing::error!(processor = %name, pump_id, "Pump failed to begin: {}", err);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}
