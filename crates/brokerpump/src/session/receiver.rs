// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One acquired session.

use crate::error::{LinkError, PumpError};
use crate::link::{ManagementChannel, MessageStream, ReceiveLink};
use crate::message::{DeliveryOutcome, LockToken, WireMessage};
use crate::renewal::{LockRenewalOperation, RenewalStatus, RenewalTiming};
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Settings shared by every session a pump opens.
#[derive(Clone)]
pub(crate) struct SessionReceiverOptions {
    pub idle_timeout: Option<Duration>,
    pub initial_credits: u32,
    pub max_renewal_duration: Duration,
    pub timing: RenewalTiming,
    pub management: Option<Arc<dyn ManagementChannel>>,
}

/// An exclusively-held session link plus its lock bookkeeping.
///
/// Held lock tokens are tracked as messages arrive and dropped once settled.
/// The session lock is renewed in the background for as long as the receiver
/// is open and the renewal budget lasts.
pub struct SessionReceiver {
    session_id: String,
    link: Arc<dyn ReceiveLink>,
    lock_tokens: DashMap<LockToken, Option<SystemTime>>,
    renewal: Mutex<Option<LockRenewalOperation>>,
    disposed: AtomicBool,
    renewal_reported: AtomicBool,
}

impl SessionReceiver {
    /// Resolve the session identity of `link` and start streaming from it.
    ///
    /// The link is closed if its session id cannot be resolved.
    pub(crate) async fn open(
        link: Arc<dyn ReceiveLink>,
        options: &SessionReceiverOptions,
    ) -> Result<(Arc<SessionReceiver>, SessionMessages), LinkError> {
        let session_id = match link.session_id().await {
            Ok(Some(id)) => id,
            Ok(None) => {
                link.close().await;
                return Err(LinkError::Malformed(format!(
                    "link '{}' is not bound to a session",
                    link.link_name()
                )));
            }
            Err(err) => {
                link.close().await;
                return Err(err);
            }
        };

        let receiver = Arc::new(SessionReceiver {
            session_id: session_id.clone(),
            link: Arc::clone(&link),
            lock_tokens: DashMap::new(),
            renewal: Mutex::new(None),
            disposed: AtomicBool::new(false),
            renewal_reported: AtomicBool::new(false),
        });
        receiver.start_renewal(options).await;

        let stream = link.messages();
        link.add_credits(options.initial_credits);
        tracing::debug!(
            session_id = %session_id,
            link = %link.link_name(),
            credits = options.initial_credits,
            "Session receiver opened"
        );

        let messages = SessionMessages {
            receiver: Arc::clone(&receiver),
            stream,
            idle_timeout: options.idle_timeout,
        };
        Ok((receiver, messages))
    }

    async fn start_renewal(&self, options: &SessionReceiverOptions) {
        let Some(management) = options.management.as_ref() else {
            return;
        };
        if options.max_renewal_duration.is_zero() {
            return;
        }

        match self.link.session_locked_until().await {
            Ok(Some(locked_until)) => {
                *self.renewal.lock() = Some(LockRenewalOperation::for_session(
                    Arc::clone(management),
                    self.session_id.clone(),
                    locked_until,
                    options.max_renewal_duration,
                    options.timing,
                ));
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    "Session lock expiry unavailable, not renewing: {}",
                    err
                );
            }
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn link(&self) -> &Arc<dyn ReceiveLink> {
        &self.link
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Lock tokens received and not yet settled.
    pub fn held_lock_tokens(&self) -> usize {
        self.lock_tokens.len()
    }

    pub fn holds_lock_token(&self, lock_token: &str) -> bool {
        self.lock_tokens.contains_key(lock_token)
    }

    /// Current session lock expiry, if renewal is running.
    pub fn session_locked_until(&self) -> Option<SystemTime> {
        self.renewal.lock().as_ref().map(LockRenewalOperation::locked_until)
    }

    /// Error of a failed session lock renewal, handed out once.
    pub(crate) fn take_renewal_error(&self) -> Option<LinkError> {
        let err = self
            .renewal
            .lock()
            .as_ref()
            .filter(|renewal| renewal.status() == RenewalStatus::Failed)
            .and_then(LockRenewalOperation::error)?;
        if self.renewal_reported.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(err)
    }

    /// Resolves once session lock renewal has failed. Never resolves when
    /// renewal is off or ends any other way.
    pub(crate) async fn renewal_failed(&self) {
        let status = self.renewal.lock().as_ref().map(LockRenewalOperation::subscribe);
        if let Some(mut status) = status {
            let failed = status
                .wait_for(|status| *status == RenewalStatus::Failed)
                .await
                .is_ok();
            if failed {
                return;
            }
        }
        std::future::pending::<()>().await;
    }

    fn track(&self, message: &WireMessage) {
        if let Some(token) = &message.lock_token {
            self.lock_tokens.insert(token.clone(), message.locked_until);
        }
    }

    /// Settle a message received on this session.
    pub async fn settle(&self, lock_token: &str, outcome: DeliveryOutcome) -> Result<(), PumpError> {
        if self.is_disposed() {
            return Err(LinkError::Closed(self.link.link_name().to_string()).into());
        }
        if !self.holds_lock_token(lock_token) {
            return Err(PumpError::LockTokenNotHeld(lock_token.to_string()));
        }

        let name = outcome.name();
        self.link.update_disposition(lock_token, outcome).await?;
        self.lock_tokens.remove(lock_token);
        tracing::debug!(session_id = %self.session_id, outcome = name, "Message settled");
        Ok(())
    }

    /// Stop renewal and detach the link. Only the first call does anything.
    pub async fn close(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(renewal) = self.renewal.lock().take() {
            renewal.close();
        }
        self.link.close().await;
        self.lock_tokens.clear();
        tracing::debug!(session_id = %self.session_id, "Session receiver closed");
    }
}

impl std::fmt::Debug for SessionReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionReceiver")
            .field("session_id", &self.session_id)
            .field("link", &self.link.link_name())
            .field("held_lock_tokens", &self.lock_tokens.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Message half of a session receiver.
pub(crate) struct SessionMessages {
    receiver: Arc<SessionReceiver>,
    stream: MessageStream,
    idle_timeout: Option<Duration>,
}

impl SessionMessages {
    /// Next message, or `None` once the link ends or the session idles out.
    pub(crate) async fn next(&mut self) -> Option<Result<WireMessage, LinkError>> {
        let mut next = match self.idle_timeout {
            Some(idle) => match tokio::time::timeout(idle, self.stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::info!(
                        session_id = %self.receiver.session_id,
                        idle_secs = idle.as_secs_f64(),
                        "Session idle, releasing"
                    );
                    return None;
                }
            },
            None => self.stream.next().await,
        };

        if let Some(Ok(message)) = &mut next {
            // The link owns the session; messages need not repeat it.
            if message.session_id.is_none() {
                message.session_id = Some(self.receiver.session_id.clone());
            }
            self.receiver.track(message);
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockLink, MockManagement};

    fn options(management: Option<Arc<dyn ManagementChannel>>) -> SessionReceiverOptions {
        SessionReceiverOptions {
            idle_timeout: None,
            initial_credits: 4,
            max_renewal_duration: Duration::from_secs(300),
            timing: RenewalTiming::default(),
            management,
        }
    }

    fn locked(id: &str, token: &str) -> WireMessage {
        let mut message = WireMessage::new(id, b"x".to_vec());
        message.lock_token = Some(token.to_string());
        message
    }

    #[tokio::test]
    async fn test_tracks_and_settles_lock_tokens() {
        let link = MockLink::session("s-1");
        link.push(locked("m-1", "lt-1"));
        link.push(WireMessage::new("m-2", b"y".to_vec()));

        let (receiver, mut messages) = SessionReceiver::open(link.clone(), &options(None))
            .await
            .expect("open");
        assert_eq!(receiver.session_id(), "s-1");
        assert_eq!(link.credits_granted(), 4);

        messages.next().await.expect("first").expect("ok");
        messages.next().await.expect("second").expect("ok");
        // Receive-and-delete style message carries no token.
        assert_eq!(receiver.held_lock_tokens(), 1);

        receiver
            .settle("lt-1", DeliveryOutcome::Complete)
            .await
            .expect("settle");
        assert!(!receiver.holds_lock_token("lt-1"));
        assert_eq!(link.dispositions(), vec![("lt-1".to_string(), "complete")]);

        let err = receiver
            .settle("lt-1", DeliveryOutcome::Complete)
            .await
            .unwrap_err();
        assert!(matches!(err, PumpError::LockTokenNotHeld(_)));
    }

    #[tokio::test]
    async fn test_untagged_messages_take_link_session() {
        let link = MockLink::session("s-5");
        link.push_untagged(locked("m-1", "lt-1"));
        let (_receiver, mut messages) = SessionReceiver::open(link.clone(), &options(None))
            .await
            .expect("open");

        let message = messages.next().await.expect("message").expect("ok");
        assert_eq!(message.session_id.as_deref(), Some("s-5"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let link = MockLink::session("s-2");
        let management = Arc::new(MockManagement::new(Duration::from_secs(30)));
        let (receiver, _messages) =
            SessionReceiver::open(link.clone(), &options(Some(management)))
                .await
                .expect("open");
        assert!(receiver.session_locked_until().is_some());

        receiver.close().await;
        receiver.close().await;

        assert!(receiver.is_disposed());
        assert_eq!(link.close_count(), 1);
        assert!(receiver.session_locked_until().is_none());
    }

    #[tokio::test]
    async fn test_settle_after_close_fails() {
        let link = MockLink::session("s-3");
        link.push(locked("m-1", "lt-1"));
        let (receiver, mut messages) = SessionReceiver::open(link.clone(), &options(None))
            .await
            .expect("open");
        messages.next().await.expect("message").expect("ok");

        receiver.close().await;
        let err = receiver
            .settle("lt-1", DeliveryOutcome::Complete)
            .await
            .unwrap_err();
        assert!(matches!(err, PumpError::Link(LinkError::Closed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_ends_stream() {
        let link = MockLink::session("s-4");
        let mut opts = options(None);
        opts.idle_timeout = Some(Duration::from_secs(5));

        let (_receiver, mut messages) = SessionReceiver::open(link.clone(), &opts)
            .await
            .expect("open");
        assert!(messages.next().await.is_none());
    }

    #[tokio::test]
    async fn test_open_rejects_link_without_session() {
        let link = MockLink::new("plain");
        let err = SessionReceiver::open(link.clone(), &options(None))
            .await
            .err()
            .expect("open must fail");
        assert!(matches!(err, LinkError::Malformed(_)));
        assert_eq!(link.close_count(), 1);
    }
}
