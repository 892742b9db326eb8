// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message model shared by links, pumps and handlers.
//!
//! Links yield [`WireMessage`]s. A [`MessageSerializer`] turns each one into
//! the [`ReceivedMessage`] handed to user code.

use crate::error::LinkError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

/// Opaque lock token issued by the broker for a peek-locked message.
pub type LockToken = String;

/// How messages are taken from the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveMode {
    /// Messages are locked and must be settled.
    #[default]
    PeekLock,
    /// Messages are removed on delivery; no lock token, no settlement.
    ReceiveAndDelete,
}

/// Settlement outcome sent back over the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Complete,
    Abandon {
        properties_to_modify: HashMap<String, String>,
    },
    DeadLetter {
        reason: Option<String>,
        description: Option<String>,
    },
    Defer,
}

impl DeliveryOutcome {
    /// Plain abandon without property changes.
    pub fn abandon() -> Self {
        Self::Abandon {
            properties_to_modify: HashMap::new(),
        }
    }

    /// Dead-letter with a reason and description.
    pub fn dead_letter(reason: impl Into<String>, description: impl Into<String>) -> Self {
        Self::DeadLetter {
            reason: Some(reason.into()),
            description: Some(description.into()),
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Abandon { .. } => "abandon",
            Self::DeadLetter { .. } => "dead-letter",
            Self::Defer => "defer",
        }
    }
}

/// Decoded message as produced by the link.
#[derive(Debug, Clone, Default)]
pub struct WireMessage {
    pub message_id: String,
    pub body: Vec<u8>,
    pub session_id: Option<String>,
    /// Absent in receive-and-delete mode.
    pub lock_token: Option<LockToken>,
    pub locked_until: Option<SystemTime>,
    pub delivery_count: u32,
    pub sequence_number: i64,
    pub enqueued_time: Option<SystemTime>,
    pub content_type: Option<String>,
    pub properties: HashMap<String, String>,
}

impl WireMessage {
    /// Minimal message with an id and body.
    pub fn new(message_id: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: message_id.into(),
            body: body.into(),
            ..Default::default()
        }
    }
}

/// Message handed to user handlers.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    message_id: String,
    body: Vec<u8>,
    session_id: Option<String>,
    lock_token: Option<LockToken>,
    locked_until: Option<SystemTime>,
    delivery_count: u32,
    sequence_number: i64,
    enqueued_time: Option<SystemTime>,
    content_type: Option<String>,
    properties: HashMap<String, String>,
}

impl ReceivedMessage {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body as UTF-8, if valid.
    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn lock_token(&self) -> Option<&str> {
        self.lock_token.as_deref()
    }

    pub fn locked_until(&self) -> Option<SystemTime> {
        self.locked_until
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }

    pub fn enqueued_time(&self) -> Option<SystemTime> {
        self.enqueued_time
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Converts wire messages into domain messages, once per arriving message.
pub trait MessageSerializer: Send + Sync {
    fn deserialize(&self, wire: WireMessage) -> Result<ReceivedMessage, LinkError>;
}

/// Field-by-field conversion; rejects messages without an id.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSerializer;

impl MessageSerializer for DefaultSerializer {
    fn deserialize(&self, wire: WireMessage) -> Result<ReceivedMessage, LinkError> {
        if wire.message_id.is_empty() {
            return Err(LinkError::Malformed(format!(
                "message with sequence number {} has no message id",
                wire.sequence_number
            )));
        }

        Ok(ReceivedMessage {
            message_id: wire.message_id,
            body: wire.body,
            session_id: wire.session_id,
            lock_token: wire.lock_token,
            locked_until: wire.locked_until,
            delivery_count: wire.delivery_count,
            sequence_number: wire.sequence_number,
            enqueued_time: wire.enqueued_time,
            content_type: wire.content_type,
            properties: wire.properties,
        })
    }
}
