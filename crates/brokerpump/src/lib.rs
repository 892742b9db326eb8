// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker Message Pumps
//!
//! Client-side consumption core for a message broker: pumps messages from
//! queues and subscriptions to user handlers, including session-ordered
//! entities where only one consumer may hold a session's lock at a time.
//!
//! # Features
//!
//! - **Session Rotation**: N rolling slots, each holding one session and
//!   moving to the next when it ends
//! - **Bounded Dispatch**: per-slot or per-pump handler concurrency
//! - **Lock Renewal**: message and session locks kept alive within a budget
//! - **Coordinated Shutdown**: single-use pumps, terminated as a unit
//! - **Blocking Receive**: credit-based batches with a deadline
//!
//! # Quick Start
//!
//! ```ignore
//! use brokerpump::{Processor, ProcessorConfig};
//!
//! let config = ProcessorConfig::builder()
//!     .namespace("orders.broker.example.net")
//!     .entity_path("orders")
//!     .max_concurrent_sessions(4)
//!     .build()?;
//!
//! let processor = Processor::for_sessions(config, provider, handler, Some(management))?;
//! processor.start()?;
//! // ...
//! processor.stop().await;
//! ```
//!
//! The transport is supplied through the traits in [`link`]; [`mock`] has
//! in-memory implementations.

pub mod config;
pub(crate) mod dispatch;
pub mod error;
pub mod handler;
pub mod link;
pub mod message;
pub mod mock;
pub mod processor;
pub mod pump;
pub mod renewal;
pub mod session;
pub mod stats;
pub mod sync_receiver;

pub use config::{ConfigError, ProcessorConfig, ProcessorConfigBuilder};
pub use error::{HandlerError, LinkError, PumpError, Result, TerminationCause};
pub use handler::{ErrorContext, ErrorSource, MessageContext, MessageHandler};
pub use link::{LinkProvider, ManagementChannel, MessageStream, ReceiveLink, SessionAcquirer};
pub use message::{
    DefaultSerializer, DeliveryOutcome, LockToken, MessageSerializer, ReceiveMode,
    ReceivedMessage, WireMessage,
};
pub use processor::{Processor, PumpFactory};
pub use pump::{MessagePump, OnTerminate, Pump, PumpCanceller, PumpHandle};
pub use renewal::{
    LockRenewalOperation, RenewFn, RenewalStatus, RenewalTiming, MIN_RENEWAL_RETRY_INTERVAL,
};
pub use session::{
    LinkSessionAcquirer, SessionReceiver, SessionReceiversTracker, SessionsMessagePump,
};
pub use stats::{PumpStats, PumpStatsSnapshot};
pub use sync_receiver::{
    ReceivedBatch, SynchronousMessageSubscriber, SynchronousReceiveWork, SynchronousReceiver,
    Upstream, WorkState,
};
