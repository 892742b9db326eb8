// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Blocking receive on top of a push stream.
//!
//! [`SynchronousMessageSubscriber`] serves a FIFO queue of "up to N messages
//! within D" requests from a continuous upstream, using credit-based flow
//! control. Only the head of the queue is active; it requests credit for what
//! it still needs, takes buffered messages until satisfied or timed out, then
//! hands over to the next request.
//!
//! # Credit
//!
//! ```text
//! start(work):   request max(0, work.remaining - outstanding)
//! on_next:       outstanding -= 1
//! retire(work):  outstanding -= work.remaining   (unused credit returned)
//! ```
//!
//! Outstanding credit is never reduced to make room for a smaller request.
//!
//! [`SynchronousReceiver`] wires a subscriber to a [`ReceiveLink`].

use crate::error::{LinkError, PumpError};
use crate::link::{MessageStream, ReceiveLink};
use crate::message::{DefaultSerializer, DeliveryOutcome, MessageSerializer, ReceivedMessage};
use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::queue::SegQueue;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Credit source feeding a subscriber.
pub trait Upstream: Send + Sync {
    /// Grant `credits` more items.
    fn request(&self, credits: u64);

    /// Stop producing.
    fn cancel(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    Pending,
    Active,
    Terminal,
}

/// One bounded, timed receive request.
pub struct SynchronousReceiveWork<T> {
    id: u64,
    requested: u64,
    timeout: Duration,
    state: Mutex<WorkState>,
    emitted: AtomicU64,
    error: Mutex<Option<LinkError>>,
    sender: Mutex<Option<Sender<T>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    credit_returned: AtomicBool,
}

impl<T> SynchronousReceiveWork<T> {
    fn new(id: u64, requested: u64, timeout: Duration) -> (Arc<Self>, ReceivedBatch<T>) {
        let (sender, receiver) = channel::unbounded();
        let work = Arc::new(Self {
            id,
            requested,
            timeout,
            state: Mutex::new(WorkState::Pending),
            emitted: AtomicU64::new(0),
            error: Mutex::new(None),
            sender: Mutex::new(Some(sender)),
            timer: Mutex::new(None),
            credit_returned: AtomicBool::new(false),
        });
        let batch = ReceivedBatch {
            receiver,
            work: Arc::clone(&work),
        };
        (work, batch)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn requested(&self) -> u64 {
        self.requested
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> WorkState {
        *self.state.lock()
    }

    pub fn is_terminal(&self) -> bool {
        self.state() == WorkState::Terminal
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> u64 {
        self.requested.saturating_sub(self.emitted())
    }

    /// Upstream error that ended the work.
    pub fn error(&self) -> Option<LinkError> {
        self.error.lock().clone()
    }

    fn start(&self) -> bool {
        let mut state = self.state.lock();
        if *state == WorkState::Pending {
            *state = WorkState::Active;
            true
        } else {
            false
        }
    }

    fn set_timer(&self, timer: JoinHandle<()>) {
        if self.is_terminal() {
            timer.abort();
        } else {
            *self.timer.lock() = Some(timer);
        }
    }

    /// Hand `item` to the caller, or give it back if this work can't take it.
    fn try_emit(&self, item: T) -> Result<(), T> {
        if self.is_terminal() || self.remaining() == 0 {
            return Err(item);
        }

        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(item).map_err(|err| err.into_inner()),
            None => Err(item),
        };
        match sent {
            Ok(()) => {
                let emitted = self.emitted.fetch_add(1, Ordering::AcqRel) + 1;
                if emitted >= self.requested {
                    self.finish(None);
                }
                Ok(())
            }
            Err(item) => {
                // Caller dropped the batch.
                self.finish(None);
                Err(item)
            }
        }
    }

    /// Move to Terminal and end the batch. Only the first call does anything.
    fn finish(&self, error: Option<LinkError>) -> bool {
        {
            let mut state = self.state.lock();
            if *state == WorkState::Terminal {
                return false;
            }
            *state = WorkState::Terminal;
        }
        if error.is_some() {
            *self.error.lock() = error;
        }
        self.sender.lock().take();
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
        true
    }

    /// Credit this work reserved but never used; reported once.
    fn take_unused_credit(&self) -> u64 {
        if self.credit_returned.swap(true, Ordering::AcqRel) {
            0
        } else {
            self.remaining()
        }
    }
}

impl<T> std::fmt::Debug for SynchronousReceiveWork<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynchronousReceiveWork")
            .field("id", &self.id)
            .field("requested", &self.requested)
            .field("emitted", &self.emitted())
            .field("state", &self.state())
            .finish()
    }
}

/// Blocking iterator over one work's messages.
///
/// Ends once the work is satisfied, times out, or the upstream ends. Do not
/// iterate on a runtime worker thread; use a plain thread or
/// `spawn_blocking`.
pub struct ReceivedBatch<T> {
    receiver: Receiver<T>,
    work: Arc<SynchronousReceiveWork<T>>,
}

impl<T> ReceivedBatch<T> {
    pub fn work_id(&self) -> u64 {
        self.work.id()
    }

    pub fn state(&self) -> WorkState {
        self.work.state()
    }

    /// Upstream error that ended the batch early.
    pub fn error(&self) -> Option<LinkError> {
        self.work.error()
    }
}

impl<T> Iterator for ReceivedBatch<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.receiver.recv().ok()
    }
}

/// Credit-based bridge from a push stream to timed pull requests.
pub struct SynchronousMessageSubscriber<T> {
    runtime: Handle,
    upstream: Mutex<Option<Arc<dyn Upstream>>>,
    work_queue: Mutex<VecDeque<Arc<SynchronousReceiveWork<T>>>>,
    current_work: Mutex<Option<Arc<SynchronousReceiveWork<T>>>>,
    buffer: SegQueue<T>,
    carried: Mutex<Option<T>>,
    requested: AtomicU64,
    wip: AtomicUsize,
    done: AtomicBool,
    error: Mutex<Option<LinkError>>,
    next_work_id: AtomicU64,
}

impl<T: Send + 'static> SynchronousMessageSubscriber<T> {
    /// Deadline timers run on `runtime`.
    pub fn new(runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            upstream: Mutex::new(None),
            work_queue: Mutex::new(VecDeque::new()),
            current_work: Mutex::new(None),
            buffer: SegQueue::new(),
            carried: Mutex::new(None),
            requested: AtomicU64::new(0),
            wip: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            error: Mutex::new(None),
            next_work_id: AtomicU64::new(1),
        })
    }

    /// Attach the credit source. Credit reserved before this is sent now.
    pub fn on_subscribe(&self, upstream: Arc<dyn Upstream>) {
        *self.upstream.lock() = Some(Arc::clone(&upstream));
        let outstanding = self.requested.load(Ordering::Acquire);
        if outstanding > 0 {
            upstream.request(outstanding);
        }
    }

    /// Credit requested upstream and not yet delivered.
    pub fn outstanding_credit(&self) -> u64 {
        self.requested.load(Ordering::Acquire)
    }

    /// Works queued, including the active one.
    pub fn pending_work(&self) -> usize {
        self.work_queue.lock().len()
    }

    /// Ask for up to `max_messages` within `timeout`.
    pub fn queue_work(self: &Arc<Self>, max_messages: usize, timeout: Duration) -> ReceivedBatch<T> {
        let id = self.next_work_id.fetch_add(1, Ordering::Relaxed);
        let requested = u64::try_from(max_messages).unwrap_or(u64::MAX);
        let (work, batch) = SynchronousReceiveWork::new(id, requested, timeout);
        if requested == 0 {
            work.finish(None);
            return batch;
        }

        let only = {
            let mut queue = self.work_queue.lock();
            queue.push_back(Arc::clone(&work));
            queue.len() == 1
        };
        if only {
            self.start_work(&work);
        }
        self.drain();
        batch
    }

    pub fn on_next(self: &Arc<Self>, item: T) {
        self.consume_credit();
        self.buffer.push(item);
        self.drain();
    }

    /// An upstream item was dropped before reaching the buffer.
    pub fn on_discarded(self: &Arc<Self>) {
        self.consume_credit();
        let current = self.current_work.lock().clone();
        if let Some(work) = current.filter(|work| !work.is_terminal()) {
            self.request_upstream(self.credit_needed(&work));
        }
        self.drain();
    }

    /// Upstream failed: queued works end with `error` once the buffer drains.
    pub fn on_error(self: &Arc<Self>, error: LinkError) {
        tracing::warn!("Synchronous receive upstream failed: {}", error);
        *self.error.lock() = Some(error);
        self.done.store(true, Ordering::Release);
        self.drain();
    }

    /// Upstream ended: queued works end once the buffer drains.
    pub fn on_complete(self: &Arc<Self>) {
        self.done.store(true, Ordering::Release);
        self.drain();
    }

    /// Cancel upstream and end every queued work.
    pub fn dispose(&self) {
        self.done.store(true, Ordering::Release);
        let upstream = self.upstream.lock().take();
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
        self.terminate_all(None);
    }

    fn consume_credit(&self) {
        let _ = self
            .requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |outstanding| {
                Some(outstanding.saturating_sub(1))
            });
    }

    fn return_credit(&self, unused: u64) {
        if unused == 0 {
            return;
        }
        let _ = self
            .requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |outstanding| {
                Some(outstanding.saturating_sub(unused))
            });
    }

    /// Top outstanding credit up to `wanted`; never lowers it.
    fn request_upstream(&self, wanted: u64) {
        let mut added = 0;
        let _ = self
            .requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |outstanding| {
                if wanted > outstanding {
                    added = wanted - outstanding;
                    Some(wanted)
                } else {
                    added = 0;
                    None
                }
            });

        if added > 0 {
            let upstream = self.upstream.lock().clone();
            if let Some(upstream) = upstream {
                tracing::trace!(credits = added, "Requesting upstream credit");
                upstream.request(added);
            }
        }
    }

    /// Credit `work` still needs beyond items already received and held.
    fn credit_needed(&self, work: &SynchronousReceiveWork<T>) -> u64 {
        let carried = u64::from(self.carried.lock().is_some());
        let held = u64::try_from(self.buffer.len()).unwrap_or(u64::MAX);
        work.remaining().saturating_sub(held.saturating_add(carried))
    }

    fn start_work(self: &Arc<Self>, work: &Arc<SynchronousReceiveWork<T>>) {
        if !work.start() {
            return;
        }
        *self.current_work.lock() = Some(Arc::clone(work));
        self.request_upstream(self.credit_needed(work));

        let subscriber = Arc::downgrade(self);
        let timed = Arc::clone(work);
        let timeout = work.timeout();
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(subscriber) = subscriber.upgrade() {
                subscriber.on_work_timeout(&timed);
            }
        });
        work.set_timer(timer);
    }

    fn on_work_timeout(self: &Arc<Self>, work: &Arc<SynchronousReceiveWork<T>>) {
        if !work.finish(None) {
            return;
        }
        tracing::debug!(
            work_id = work.id(),
            emitted = work.emitted(),
            requested = work.requested(),
            "Synchronous receive timed out"
        );
        self.drain();
    }

    /// Single-flight drain; concurrent callers leave a mark for the runner.
    fn drain(self: &Arc<Self>) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }

        let mut missed = 1;
        loop {
            self.drain_once();
            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                break;
            }
        }
    }

    fn drain_once(self: &Arc<Self>) {
        loop {
            let current = self.current_work.lock().clone();
            let work = match current {
                Some(work) if !work.is_terminal() => work,
                _ => {
                    if self.advance() {
                        continue;
                    }
                    break;
                }
            };

            let Some(item) = self.pop_buffered() else {
                break;
            };
            if let Err(item) = work.try_emit(item) {
                *self.carried.lock() = Some(item);
            }
        }

        if self.done.load(Ordering::Acquire) && self.buffer.is_empty() && self.carried.lock().is_none() {
            let error = self.error.lock().clone();
            self.terminate_all(error);
        }
    }

    /// Retire terminal works at the head and make the next one current.
    fn advance(self: &Arc<Self>) -> bool {
        let (retired, next) = {
            let mut queue = self.work_queue.lock();
            let mut retired = Vec::new();
            while queue.front().is_some_and(|work| work.is_terminal()) {
                retired.extend(queue.pop_front());
            }
            (retired, queue.front().cloned())
        };

        for work in retired {
            self.return_credit(work.take_unused_credit());
        }

        match next {
            Some(work) => {
                if work.state() == WorkState::Pending {
                    self.start_work(&work);
                } else {
                    *self.current_work.lock() = Some(work);
                }
                true
            }
            None => {
                *self.current_work.lock() = None;
                false
            }
        }
    }

    fn pop_buffered(&self) -> Option<T> {
        let carried = self.carried.lock().take();
        carried.or_else(|| self.buffer.pop())
    }

    fn terminate_all(&self, error: Option<LinkError>) {
        let works: Vec<_> = self.work_queue.lock().drain(..).collect();
        *self.current_work.lock() = None;
        for work in works {
            work.finish(error.clone());
        }
    }
}

/// Maps subscriber credit onto link credit.
struct LinkUpstream {
    link: Arc<dyn ReceiveLink>,
    cancel: CancellationToken,
}

impl Upstream for LinkUpstream {
    fn request(&self, credits: u64) {
        let credits = u32::try_from(credits).unwrap_or(u32::MAX);
        self.link.add_credits(credits);
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Blocking receiver over one link.
pub struct SynchronousReceiver {
    link: Arc<dyn ReceiveLink>,
    subscriber: Arc<SynchronousMessageSubscriber<ReceivedMessage>>,
    feed: JoinHandle<()>,
}

impl SynchronousReceiver {
    pub fn new(link: Arc<dyn ReceiveLink>, runtime: Handle) -> Self {
        Self::with_serializer(link, runtime, Arc::new(DefaultSerializer))
    }

    pub fn with_serializer(
        link: Arc<dyn ReceiveLink>,
        runtime: Handle,
        serializer: Arc<dyn MessageSerializer>,
    ) -> Self {
        let subscriber = SynchronousMessageSubscriber::new(runtime.clone());
        let cancel = CancellationToken::new();
        subscriber.on_subscribe(Arc::new(LinkUpstream {
            link: Arc::clone(&link),
            cancel: cancel.clone(),
        }));

        let feed = runtime.spawn(feed(
            link.messages(),
            serializer,
            Arc::downgrade(&subscriber),
            cancel,
        ));

        Self {
            link,
            subscriber,
            feed,
        }
    }

    /// Up to `max_messages` messages arriving within `timeout`.
    pub fn receive_messages(
        &self,
        max_messages: usize,
        timeout: Duration,
    ) -> ReceivedBatch<ReceivedMessage> {
        self.subscriber.queue_work(max_messages, timeout)
    }

    /// Settle a message received from this receiver.
    pub async fn settle(
        &self,
        message: &ReceivedMessage,
        outcome: DeliveryOutcome,
    ) -> Result<(), PumpError> {
        let lock_token = message.lock_token().ok_or(PumpError::ReceiveAndDelete)?;
        self.link.update_disposition(lock_token, outcome).await?;
        Ok(())
    }

    pub fn outstanding_credit(&self) -> u64 {
        self.subscriber.outstanding_credit()
    }

    /// End pending receives and detach the link.
    pub async fn close(&self) {
        self.subscriber.dispose();
        self.feed.abort();
        self.link.close().await;
    }
}

async fn feed(
    mut stream: MessageStream,
    serializer: Arc<dyn MessageSerializer>,
    subscriber: Weak<SynchronousMessageSubscriber<ReceivedMessage>>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = stream.next() => next,
        };
        let Some(subscriber) = subscriber.upgrade() else {
            return;
        };

        match next {
            Some(Ok(wire)) => match serializer.deserialize(wire) {
                Ok(message) => subscriber.on_next(message),
                Err(err) => {
                    tracing::warn!("Dropping undecodable message: {}", err);
                    subscriber.on_discarded();
                }
            },
            Some(Err(err)) => {
                subscriber.on_error(err);
                return;
            }
            None => {
                subscriber.on_complete();
                return;
            }
        }
    }
}
