// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Next-session acquisition on top of a link provider.

use crate::error::LinkError;
use crate::link::{LinkProvider, ReceiveLink, SessionAcquirer};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Default pause between polls when the broker has no session to hand out.
pub const DEFAULT_ACQUIRE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Accepts sessions from a [`LinkProvider`], polling while none is available.
///
/// Any error other than "no session" or a timeout is returned to the caller.
pub struct LinkSessionAcquirer {
    provider: Arc<dyn LinkProvider>,
    retry_delay: Duration,
}

impl LinkSessionAcquirer {
    pub fn new(provider: Arc<dyn LinkProvider>) -> Self {
        Self {
            provider,
            retry_delay: DEFAULT_ACQUIRE_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

#[async_trait]
impl SessionAcquirer for LinkSessionAcquirer {
    async fn acquire(&self) -> Result<Arc<dyn ReceiveLink>, LinkError> {
        loop {
            match self.provider.accept_next_session().await {
                Ok(link) => return Ok(link),
                Err(LinkError::NoSessionAvailable(_) | LinkError::Timeout) => {
                    tracing::trace!(
                        entity = %self.provider.entity_path(),
                        "No session available, polling again"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
