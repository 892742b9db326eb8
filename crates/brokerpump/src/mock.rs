// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory link provider for tests.
//!
//! [`MockLinkProvider`] hands out [`MockLink`]s that tests feed with messages,
//! and records credits, settlements and close calls for assertions.
//! [`MockManagement`] renews locks by a fixed validity.

use crate::error::LinkError;
use crate::link::{LinkProvider, ManagementChannel, MessageStream, ReceiveLink};
use crate::message::{DeliveryOutcome, WireMessage};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type LinkItem = Result<WireMessage, LinkError>;

/// Mock receive link.
pub struct MockLink {
    name: String,
    entity_path: String,
    session_id: Option<String>,
    locked_until: Mutex<Option<SystemTime>>,
    sender: mpsc::UnboundedSender<LinkItem>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<LinkItem>>>,
    closed: CancellationToken,
    close_count: AtomicUsize,
    credits: AtomicU64,
    dispositions: Mutex<Vec<(String, &'static str)>>,
    fail_dispositions: AtomicBool,
}

impl MockLink {
    fn build(name: String, session_id: Option<String>) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let locked_until = session_id
            .as_ref()
            .map(|_| SystemTime::now() + Duration::from_secs(30));
        Arc::new(Self {
            name,
            entity_path: "mock-entity".to_string(),
            session_id,
            locked_until: Mutex::new(locked_until),
            sender,
            receiver: Mutex::new(Some(receiver)),
            closed: CancellationToken::new(),
            close_count: AtomicUsize::new(0),
            credits: AtomicU64::new(0),
            dispositions: Mutex::new(Vec::new()),
            fail_dispositions: AtomicBool::new(false),
        })
    }

    /// Create a non-session link
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::build(name.into(), None)
    }

    /// Create a link bound to `session_id`, locked for 30s
    pub fn session(session_id: impl Into<String>) -> Arc<Self> {
        let session_id = session_id.into();
        Self::build(format!("session-{}", session_id), Some(session_id))
    }

    /// Queue a message. Session links stamp their session id on it.
    pub fn push(&self, mut message: WireMessage) {
        if message.session_id.is_none() {
            message.session_id = self.session_id.clone();
        }
        let _ = self.sender.send(Ok(message));
    }

    /// Queue a message as given, without stamping the session id.
    pub fn push_untagged(&self, message: WireMessage) {
        let _ = self.sender.send(Ok(message));
    }

    /// Queue a link failure
    pub fn fail(&self, error: LinkError) {
        let _ = self.sender.send(Err(error));
    }

    /// Make every later settlement fail
    pub fn fail_dispositions(&self, fail: bool) {
        self.fail_dispositions.store(fail, Ordering::SeqCst);
    }

    /// Total credits granted
    pub fn credits_granted(&self) -> u64 {
        self.credits.load(Ordering::SeqCst)
    }

    /// Settled (lock token, outcome) pairs in order
    pub fn dispositions(&self) -> Vec<(String, &'static str)> {
        self.dispositions.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReceiveLink for MockLink {
    fn link_name(&self) -> &str {
        &self.name
    }

    fn entity_path(&self) -> &str {
        &self.entity_path
    }

    fn messages(&self) -> MessageStream {
        let Some(receiver) = self.receiver.lock().take() else {
            return futures::stream::empty().boxed();
        };
        let closed = self.closed.clone();

        futures::stream::unfold((receiver, closed), |(mut receiver, closed)| async move {
            let next = tokio::select! {
                biased;
                _ = closed.cancelled() => None,
                next = receiver.recv() => next,
            };
            next.map(|item| (item, (receiver, closed)))
        })
        .boxed()
    }

    async fn session_id(&self) -> Result<Option<String>, LinkError> {
        Ok(self.session_id.clone())
    }

    async fn session_locked_until(&self) -> Result<Option<SystemTime>, LinkError> {
        Ok(*self.locked_until.lock())
    }

    fn add_credits(&self, credits: u32) {
        self.credits.fetch_add(u64::from(credits), Ordering::SeqCst);
    }

    async fn update_disposition(
        &self,
        lock_token: &str,
        outcome: DeliveryOutcome,
    ) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed(self.name.clone()));
        }
        if self.fail_dispositions.load(Ordering::SeqCst) {
            return Err(LinkError::MessageLockLost(lock_token.to_string()));
        }
        self.dispositions
            .lock()
            .push((lock_token.to_string(), outcome.name()));
        Ok(())
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

type SessionOffer = Result<Arc<MockLink>, LinkError>;

/// Mock link provider
pub struct MockLinkProvider {
    namespace: String,
    entity_path: String,
    offers: mpsc::UnboundedSender<SessionOffer>,
    pending: tokio::sync::Mutex<mpsc::UnboundedReceiver<SessionOffer>>,
    links: Mutex<Vec<Arc<MockLink>>>,
    handed_out: Mutex<Vec<Arc<MockLink>>>,
    connection_closed: AtomicBool,
    accept_calls: AtomicUsize,
}

impl MockLinkProvider {
    pub fn new(namespace: impl Into<String>, entity_path: impl Into<String>) -> Arc<Self> {
        let (offers, pending) = mpsc::unbounded_channel();
        Arc::new(Self {
            namespace: namespace.into(),
            entity_path: entity_path.into(),
            offers,
            pending: tokio::sync::Mutex::new(pending),
            links: Mutex::new(Vec::new()),
            handed_out: Mutex::new(Vec::new()),
            connection_closed: AtomicBool::new(false),
            accept_calls: AtomicUsize::new(0),
        })
    }

    /// Make a session available to the next `accept_next_session`
    pub fn offer_session(&self, link: Arc<MockLink>) {
        let _ = self.offers.send(Ok(link));
    }

    /// Fail the next `accept_next_session` with `error`
    pub fn fail_next_accept(&self, error: LinkError) {
        let _ = self.offers.send(Err(error));
    }

    /// Link returned by the next `create_link`
    pub fn queue_link(&self, link: Arc<MockLink>) {
        self.links.lock().push(link);
    }

    /// Report the connection as closed to health checks
    pub fn close_connection(&self) {
        self.connection_closed.store(true, Ordering::SeqCst);
    }

    /// Every link handed out so far
    pub fn links_handed_out(&self) -> Vec<Arc<MockLink>> {
        self.handed_out.lock().clone()
    }

    pub fn accept_calls(&self) -> usize {
        self.accept_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LinkProvider for MockLinkProvider {
    fn fully_qualified_namespace(&self) -> &str {
        &self.namespace
    }

    fn entity_path(&self) -> &str {
        &self.entity_path
    }

    async fn create_link(
        &self,
        session_id: Option<&str>,
    ) -> Result<Arc<dyn ReceiveLink>, LinkError> {
        if self.connection_closed.load(Ordering::SeqCst) {
            return Err(LinkError::ConnectionClosed);
        }
        let queued = {
            let mut links = self.links.lock();
            if links.is_empty() {
                None
            } else {
                Some(links.remove(0))
            }
        };
        let link = queued.unwrap_or_else(|| match session_id {
            Some(id) => MockLink::session(id),
            None => MockLink::new(format!("{}-link", self.entity_path)),
        });
        self.handed_out.lock().push(Arc::clone(&link));
        Ok(link)
    }

    async fn accept_next_session(&self) -> Result<Arc<dyn ReceiveLink>, LinkError> {
        self.accept_calls.fetch_add(1, Ordering::SeqCst);
        let offer = self.pending.lock().await.recv().await;
        match offer {
            Some(Ok(link)) => {
                self.handed_out.lock().push(Arc::clone(&link));
                Ok(link)
            }
            Some(Err(err)) => Err(err),
            None => Err(LinkError::ConnectionClosed),
        }
    }

    fn is_connection_closed(&self) -> bool {
        self.connection_closed.load(Ordering::SeqCst)
    }
}

/// Mock management channel
pub struct MockManagement {
    validity: Duration,
    message_renewals: AtomicUsize,
    session_renewals: AtomicUsize,
    fail: AtomicBool,
}

impl MockManagement {
    /// Renewals extend locks by `validity` from now
    pub fn new(validity: Duration) -> Self {
        Self {
            validity,
            message_renewals: AtomicUsize::new(0),
            session_renewals: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn message_renewals(&self) -> usize {
        self.message_renewals.load(Ordering::SeqCst)
    }

    pub fn session_renewals(&self) -> usize {
        self.session_renewals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManagementChannel for MockManagement {
    async fn renew_message_lock(&self, lock_token: &str) -> Result<SystemTime, LinkError> {
        self.message_renewals.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(LinkError::MessageLockLost(lock_token.to_string()));
        }
        Ok(SystemTime::now() + self.validity)
    }

    async fn renew_session_lock(&self, session_id: &str) -> Result<SystemTime, LinkError> {
        self.session_renewals.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(LinkError::SessionLockLost(session_id.to_string()));
        }
        Ok(SystemTime::now() + self.validity)
    }
}
