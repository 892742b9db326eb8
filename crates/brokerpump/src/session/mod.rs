// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session-ordered consumption.
//!
//! A [`SessionsMessagePump`] runs one rolling receiver per session slot. Each
//! slot holds at most one session at a time and rotates to the next session
//! when the current one ends (link closed, link error, idle timeout).

pub mod acquirer;
pub mod pump;
pub mod receiver;
pub(crate) mod rolling;
pub mod tracker;

pub use acquirer::LinkSessionAcquirer;
pub use pump::SessionsMessagePump;
pub use receiver::SessionReceiver;
pub use tracker::SessionReceiversTracker;
