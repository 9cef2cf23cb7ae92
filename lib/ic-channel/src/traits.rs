/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ic-channel project authors.
 */

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::channel::InterceptedHttpChannel;
use crate::{ChannelError, ChannelStatus, LoadContext, RedirectFlags, RedirectSetup};

/// Downstream consumer of a response stream.
///
/// `on_stop` is delivered exactly once per opened channel and never before
/// `on_start`. `on_data` chunks describe a monotonically advancing,
/// non-overlapping byte range.
pub trait StreamConsumer: Send {
    fn on_start(&mut self);
    fn on_data(&mut self, chunk: Bytes, offset: u64);
    fn on_stop(&mut self, status: ChannelStatus);
}

/// Sink for coalesced transfer status and progress notifications.
pub trait ProgressSink: Send {
    fn on_status(&mut self, host: &str);
    fn on_progress(&mut self, progress: u64, total: Option<u64>);
}

/// The external controller that decides whether to intercept a request and
/// then drives the synthesis contract on the channel it was handed.
pub trait InterceptController: Send + Sync {
    fn channel_intercepted(&self, channel: &InterceptedHttpChannel) -> Result<(), ChannelError>;
}

/// Asked to approve every redirect before the replacement channel is
/// opened. An error vetoes the redirect and fails the original channel.
#[async_trait]
pub trait RedirectVerifier: Send + Sync {
    async fn verify_redirect(
        &self,
        old: &InterceptedHttpChannel,
        new: &dyn HttpChannel,
        flags: RedirectFlags,
    ) -> Result<(), ChannelError>;
}

/// Constructs replacement channels through the same path a fresh request
/// would take.
pub trait ChannelFactory: Send + Sync {
    fn new_channel(
        &self,
        uri: &Url,
        load: &LoadContext,
        flags: RedirectFlags,
    ) -> Result<Box<dyn HttpChannel>, ChannelError>;
}

/// A channel able to stand in as the replacement in a redirect chain.
///
/// `open` consumes the listener; when it fails the listener is considered
/// handed off, and the replacement owns the terminating notification.
pub trait HttpChannel: Send + Sync {
    fn uri(&self) -> &Url;
    fn supports_resume(&self) -> bool;
    fn resume_at(&mut self, start_pos: u64, entity_id: &str) -> Result<(), ChannelError>;
    fn set_original_uri(&mut self, uri: Url);
    fn apply_redirect_setup(&mut self, setup: &RedirectSetup) -> Result<(), ChannelError>;
    fn open(self: Box<Self>, listener: Box<dyn StreamConsumer>) -> Result<(), ChannelError>;
}

/// Request-group membership for a set of related in-flight requests.
pub trait RequestGroup: Send + Sync {
    fn add_request(&self, channel_id: u64);
    fn remove_request(&self, channel_id: u64, status: &ChannelStatus);
}

/// Owner of a diverted delivery path. While a diversion is active,
/// suspend and resume calls on the channel are forwarded here as well.
pub trait DeliveryOwner: Send {
    fn suspend_delivery(&mut self) -> Result<(), ChannelError>;
    fn resume_delivery(&mut self) -> Result<(), ChannelError>;
}
