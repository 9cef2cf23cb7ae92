/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ic-channel project authors.
 */

mod error;
pub use error::ChannelError;

mod status;
pub use status::ChannelStatus;

mod config;
pub use config::InterceptConfig;

mod types;
pub use types::{LoadContext, RedirectFlags, RedirectSetup, ResumeState};

mod context;
pub use context::ExecContext;

mod pipe;
pub use pipe::{new_body_pipe, BodyReader, BodyWriter};

mod traits;
pub use traits::{
    ChannelFactory, DeliveryOwner, HttpChannel, InterceptController, ProgressSink, RedirectVerifier,
    RequestGroup, StreamConsumer,
};

mod pump;

mod channel;
pub use channel::{ChannelBuilder, ChannelTimings, InterceptedHttpChannel};

mod progress;
mod redirect;
