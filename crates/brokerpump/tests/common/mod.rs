// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(dead_code)]

//! Shared helpers for pump integration tests.

use async_trait::async_trait;
use brokerpump::{ErrorContext, ErrorSource, HandlerError, MessageContext, MessageHandler, WireMessage};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;
use std::time::Duration;

/// Install a log subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Locked message for `session_id`.
pub fn message(id: &str, session_id: Option<&str>) -> WireMessage {
    let mut message = WireMessage::new(id, format!("body-{}", id));
    message.session_id = session_id.map(str::to_string);
    message.lock_token = Some(format!("lock-{}", id));
    message
}

/// Poll `condition` every 10ms, for at most 5s.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Handler recording every call.
#[derive(Default)]
pub struct RecordingHandler {
    received: Mutex<Vec<(Option<String>, String)>>,
    threads: Mutex<Vec<ThreadId>>,
    errors: Mutex<Vec<(ErrorSource, Option<String>, String)>>,
    failing: Mutex<HashSet<String>>,
    dead_letter_manually: AtomicBool,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return an error for message `id`.
    pub fn fail_on(&self, id: &str) {
        self.failing.lock().insert(id.to_string());
    }

    /// Dead-letter every message from inside the handler.
    pub fn dead_letter_manually(&self) {
        self.dead_letter_manually.store(true, Ordering::SeqCst);
    }

    /// (session id, message id) in arrival order.
    pub fn received(&self) -> Vec<(Option<String>, String)> {
        self.received.lock().clone()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().len()
    }

    pub fn threads(&self) -> Vec<ThreadId> {
        self.threads.lock().clone()
    }

    /// (source, session id, message) per reported error.
    pub fn errors(&self) -> Vec<(ErrorSource, Option<String>, String)> {
        self.errors.lock().clone()
    }

    pub fn error_sources(&self) -> Vec<ErrorSource> {
        self.errors.lock().iter().map(|(source, _, _)| *source).collect()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn process_message(&self, context: &MessageContext) -> Result<(), HandlerError> {
        let message = context.message();
        self.received.lock().push((
            message.session_id().map(str::to_string),
            message.message_id().to_string(),
        ));
        self.threads.lock().push(std::thread::current().id());

        if self.failing.lock().contains(message.message_id()) {
            return Err(format!("rejected {}", message.message_id()).into());
        }
        if self.dead_letter_manually.load(Ordering::SeqCst) {
            context.dead_letter("poison", "rejected by handler").await?;
        }
        Ok(())
    }

    async fn process_error(&self, context: &ErrorContext) {
        self.errors.lock().push((
            context.source(),
            context.session_id().map(str::to_string),
            context.error().to_string(),
        ));
    }
}
