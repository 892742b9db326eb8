// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session id to active receiver map.

use super::receiver::SessionReceiver;
use crate::error::PumpError;
use crate::handler::Settler;
use crate::message::{DeliveryOutcome, ReceivedMessage};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// Active receivers by session id.
///
/// Writers are the rolling receivers; readers are workers settling messages.
/// Removal compares receiver identity, so a slot rotating away from a session
/// never evicts a newer receiver that re-acquired the same id.
#[derive(Debug, Default)]
pub struct SessionReceiversTracker {
    receivers: DashMap<String, Arc<SessionReceiver>>,
}

impl SessionReceiversTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `receiver` under its session id, replacing any older entry.
    pub fn track(&self, receiver: &Arc<SessionReceiver>) {
        self.receivers
            .insert(receiver.session_id().to_string(), Arc::clone(receiver));
    }

    /// Remove the entry for `receiver`'s session only if it is `receiver`.
    pub fn untrack(&self, receiver: &Arc<SessionReceiver>) -> bool {
        self.receivers
            .remove_if(receiver.session_id(), |_, current| {
                Arc::ptr_eq(current, receiver)
            })
            .is_some()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionReceiver>> {
        self.receivers
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.receivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }

    pub fn clear(&self) {
        self.receivers.clear();
    }
}

/// Settles session messages through whichever receiver holds the session.
pub(crate) struct TrackerSettler {
    tracker: Arc<SessionReceiversTracker>,
}

impl TrackerSettler {
    pub(crate) fn new(tracker: Arc<SessionReceiversTracker>) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl Settler for TrackerSettler {
    async fn settle(
        &self,
        message: &ReceivedMessage,
        outcome: DeliveryOutcome,
    ) -> Result<(), PumpError> {
        let lock_token = message.lock_token().ok_or(PumpError::ReceiveAndDelete)?;
        let session_id = message.session_id().unwrap_or_default();
        let receiver = self
            .tracker
            .get(session_id)
            .ok_or_else(|| PumpError::SessionNotFound(session_id.to_string()))?;
        receiver.settle(lock_token, outcome).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLink;
    use crate::renewal::RenewalTiming;
    use crate::session::receiver::SessionReceiverOptions;
    use std::time::Duration;

    async fn open(session_id: &str) -> Arc<SessionReceiver> {
        let options = SessionReceiverOptions {
            idle_timeout: None,
            initial_credits: 1,
            max_renewal_duration: Duration::ZERO,
            timing: RenewalTiming::default(),
            management: None,
        };
        let (receiver, _messages) = SessionReceiver::open(MockLink::session(session_id), &options)
            .await
            .expect("open");
        receiver
    }

    #[tokio::test]
    async fn test_untrack_requires_identity() {
        let tracker = SessionReceiversTracker::new();
        let old = open("s-1").await;
        let newer = open("s-1").await;

        tracker.track(&old);
        tracker.track(&newer);
        assert_eq!(tracker.len(), 1);

        // The superseded receiver must not evict its replacement.
        assert!(!tracker.untrack(&old));
        let current = tracker.get("s-1").expect("tracked");
        assert!(Arc::ptr_eq(&current, &newer));

        assert!(tracker.untrack(&newer));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_settle_unknown_session() {
        let tracker = Arc::new(SessionReceiversTracker::new());
        let settler = TrackerSettler::new(tracker);

        let mut wire = crate::message::WireMessage::new("m-1", b"x".to_vec());
        wire.session_id = Some("missing".into());
        wire.lock_token = Some("lt-1".into());
        let message = crate::message::MessageSerializer::deserialize(
            &crate::message::DefaultSerializer,
            wire,
        )
        .expect("deserialize");

        let err = settler
            .settle(&message, DeliveryOutcome::Complete)
            .await
            .unwrap_err();
        assert!(matches!(err, PumpError::SessionNotFound(id) if id == "missing"));
    }
}
