// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{Request, StreamEvent};

/// Stream of neutral events from one completion request.
///
/// Every stream terminates with exactly one `Done` or `Error` event.
/// Dropping the stream cancels the underlying HTTP transfer at the next
/// chunk boundary.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider id for status display and credential lookup.
    fn name(&self) -> &str;

    /// Send a completion request and return the streaming response.
    async fn complete(&self, req: Request) -> anyhow::Result<EventStream>;
}
