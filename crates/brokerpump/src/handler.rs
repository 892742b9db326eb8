// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! User handler surface.
//!
//! Handlers receive a [`MessageContext`] per message and an [`ErrorContext`]
//! per reported failure. Both callbacks run on pump workers; errors and panics
//! from either are caught at the invocation boundary and never reach the pump.
//!
//! ```ignore
//! struct Orders;
//!
//! #[async_trait]
//! impl MessageHandler for Orders {
//!     async fn process_message(&self, ctx: &MessageContext) -> Result<(), HandlerError> {
//!         let order: Order = decode(ctx.message().body())?;
//!         if order.is_poison() {
//!             ctx.dead_letter("poison", "failed validation").await?;
//!         }
//!         Ok(())
//!     }
//!
//!     async fn process_error(&self, ctx: &ErrorContext) {
//!         tracing::warn!("{:?} on {}: {}", ctx.source(), ctx.entity_path(), ctx.error());
//!     }
//! }
//! ```

use crate::error::{HandlerError, PumpError};
use crate::message::{DeliveryOutcome, ReceivedMessage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Message and error callbacks.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message. An `Err` is reported through `process_error` and,
    /// with auto-disposition, abandons the message.
    async fn process_message(&self, context: &MessageContext) -> Result<(), HandlerError>;

    /// Observe a failure.
    async fn process_error(&self, context: &ErrorContext);
}

/// Where a reported error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Receive,
    Complete,
    Abandon,
    DeadLetter,
    Defer,
    RenewLock,
    UserCallback,
    AcceptSession,
    CloseSession,
}

impl ErrorSource {
    pub(crate) fn for_outcome(outcome: &DeliveryOutcome) -> Self {
        match outcome {
            DeliveryOutcome::Complete => Self::Complete,
            DeliveryOutcome::Abandon { .. } => Self::Abandon,
            DeliveryOutcome::DeadLetter { .. } => Self::DeadLetter,
            DeliveryOutcome::Defer => Self::Defer,
        }
    }
}

/// Failure report handed to [`MessageHandler::process_error`].
#[derive(Debug, Clone)]
pub struct ErrorContext {
    error: Arc<dyn std::error::Error + Send + Sync>,
    source: ErrorSource,
    namespace: String,
    entity_path: String,
    session_id: Option<String>,
}

impl ErrorContext {
    pub(crate) fn new(
        error: Arc<dyn std::error::Error + Send + Sync>,
        source: ErrorSource,
        namespace: &str,
        entity_path: &str,
        session_id: Option<&str>,
    ) -> Self {
        Self {
            error,
            source,
            namespace: namespace.to_string(),
            entity_path: entity_path.to_string(),
            session_id: session_id.map(str::to_string),
        }
    }

    pub fn error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.error.as_ref()
    }

    pub fn source(&self) -> ErrorSource {
        self.source
    }

    pub fn fully_qualified_namespace(&self) -> &str {
        &self.namespace
    }

    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

/// Routes a settlement to the link that holds the message's lock.
#[async_trait]
pub(crate) trait Settler: Send + Sync {
    async fn settle(
        &self,
        message: &ReceivedMessage,
        outcome: DeliveryOutcome,
    ) -> Result<(), PumpError>;
}

/// One message plus its settlement primitives.
pub struct MessageContext {
    message: ReceivedMessage,
    settler: Arc<dyn Settler>,
    settled: AtomicBool,
}

impl MessageContext {
    pub(crate) fn new(message: ReceivedMessage, settler: Arc<dyn Settler>) -> Self {
        Self {
            message,
            settler,
            settled: AtomicBool::new(false),
        }
    }

    pub fn message(&self) -> &ReceivedMessage {
        &self.message
    }

    pub fn session_id(&self) -> Option<&str> {
        self.message.session_id()
    }

    /// True once a settlement succeeded.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    pub async fn complete(&self) -> Result<(), PumpError> {
        self.settle(DeliveryOutcome::Complete).await
    }

    pub async fn abandon(&self) -> Result<(), PumpError> {
        self.settle(DeliveryOutcome::abandon()).await
    }

    pub async fn abandon_with_properties(
        &self,
        properties_to_modify: HashMap<String, String>,
    ) -> Result<(), PumpError> {
        self.settle(DeliveryOutcome::Abandon {
            properties_to_modify,
        })
        .await
    }

    pub async fn dead_letter(
        &self,
        reason: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<(), PumpError> {
        self.settle(DeliveryOutcome::dead_letter(reason, description))
            .await
    }

    pub async fn defer(&self) -> Result<(), PumpError> {
        self.settle(DeliveryOutcome::Defer).await
    }

    pub(crate) async fn settle(&self, outcome: DeliveryOutcome) -> Result<(), PumpError> {
        if self.message.lock_token().is_none() {
            return Err(PumpError::ReceiveAndDelete);
        }
        if self.is_settled() {
            return Err(PumpError::AlreadySettled(
                self.message.message_id().to_string(),
            ));
        }

        self.settler.settle(&self.message, outcome).await?;
        self.settled.store(true, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageContext")
            .field("message_id", &self.message.message_id())
            .field("session_id", &self.message.session_id())
            .field("settled", &self.is_settled())
            .finish()
    }
}
