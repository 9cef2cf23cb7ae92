/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ic-channel project authors.
 */

use thiserror::Error;

use ic_http::HttpHeadError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("resume not supported for synthesized content")]
    NotResumable,
    #[error("redirection limit reached")]
    RedirectLoop,
    #[error("corrupted content: {0}")]
    CorruptedContent(String),
    #[error("request aborted")]
    Aborted,
    #[error("no interception controller available")]
    InterceptionUnavailable,
    #[error("failed to construct replacement channel: {0}")]
    ConstructionFailed(String),
    #[error("redirect vetoed: {0}")]
    RedirectVetoed(String),
    #[error("synthesized response already finished")]
    ResponseAlreadyFinished,
    #[error("channel already opened")]
    AlreadyOpened,
    #[error("not available")]
    NotAvailable,
    #[error("invalid synthesized response: {0}")]
    InvalidResponse(#[from] HttpHeadError),
}
