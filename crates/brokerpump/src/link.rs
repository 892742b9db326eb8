// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Link Provider Abstraction
//!
//! Interfaces the pumps consume from the transport layer. The wire protocol,
//! connection lifecycle and lock management round-trips live behind these
//! traits; the pumps only see decoded messages and settlement primitives.
//!
//! # Integration
//!
//! ```ignore
//! #[async_trait]
//! impl LinkProvider for MyConnection {
//!     async fn accept_next_session(&self) -> Result<Arc<dyn ReceiveLink>, LinkError> {
//!         // Open a receive link with a null session filter...
//!     }
//!     // ...
//! }
//! ```
//!
//! See [`crate::mock`] for in-memory implementations.

use crate::error::LinkError;
use crate::message::{DeliveryOutcome, WireMessage};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::SystemTime;

/// Stream of decoded messages from one link.
pub type MessageStream = BoxStream<'static, Result<WireMessage, LinkError>>;

/// An attached receive link.
#[async_trait]
pub trait ReceiveLink: Send + Sync {
    /// Link name, for logs.
    fn link_name(&self) -> &str;

    /// Entity the link is attached to.
    fn entity_path(&self) -> &str;

    /// Message stream. Taken once; later calls return an empty stream.
    ///
    /// The stream ends when the link closes, and yields an error if the
    /// link fails.
    fn messages(&self) -> MessageStream;

    /// Session the link locked, `None` for non-session links.
    async fn session_id(&self) -> Result<Option<String>, LinkError>;

    /// Expiry of the session lock, `None` for non-session links.
    async fn session_locked_until(&self) -> Result<Option<SystemTime>, LinkError>;

    /// Grant the broker credit for `credits` more messages.
    fn add_credits(&self, credits: u32);

    /// Settle a message by lock token.
    async fn update_disposition(
        &self,
        lock_token: &str,
        outcome: DeliveryOutcome,
    ) -> Result<(), LinkError>;

    /// Detach the link. Ends the message stream.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Creates links on a shared connection.
#[async_trait]
pub trait LinkProvider: Send + Sync {
    fn fully_qualified_namespace(&self) -> &str;

    fn entity_path(&self) -> &str;

    /// Open a link; `Some(id)` locks that specific session.
    async fn create_link(
        &self,
        session_id: Option<&str>,
    ) -> Result<Arc<dyn ReceiveLink>, LinkError>;

    /// Open a link on the next available session.
    ///
    /// Returns [`LinkError::NoSessionAvailable`] or [`LinkError::Timeout`]
    /// when the broker has nothing to hand out yet.
    async fn accept_next_session(&self) -> Result<Arc<dyn ReceiveLink>, LinkError>;

    /// Health of the underlying connection.
    fn is_connection_closed(&self) -> bool;
}

/// Yields the next exclusively-held session link.
#[async_trait]
pub trait SessionAcquirer: Send + Sync {
    async fn acquire(&self) -> Result<Arc<dyn ReceiveLink>, LinkError>;
}

/// Lock renewal round-trips, served by the broker's management channel.
#[async_trait]
pub trait ManagementChannel: Send + Sync {
    /// Renew a message lock, returning the new expiry.
    async fn renew_message_lock(&self, lock_token: &str) -> Result<SystemTime, LinkError>;

    /// Renew a session lock, returning the new expiry.
    async fn renew_session_lock(&self, session_id: &str) -> Result<SystemTime, LinkError>;
}
