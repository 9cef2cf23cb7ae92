/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ic-channel project authors.
 */

use crate::ChannelError;

/// Final disposition of a channel. `Redirected` marks a channel whose
/// request was handed off to a replacement channel. It is distinct from
/// both plain success and every failure.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChannelStatus {
    #[default]
    Ok,
    Redirected,
    Failed(ChannelError),
}

impl ChannelStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, ChannelStatus::Failed(_))
    }

    /// Record a failure. The first recorded failure is sticky: it is kept
    /// over any later code, and the redirect sentinel is never downgraded.
    pub(crate) fn set_failure(&mut self, e: ChannelError) -> bool {
        if matches!(self, ChannelStatus::Ok) {
            *self = ChannelStatus::Failed(e);
            true
        } else {
            false
        }
    }

    /// Mark the request as handed off to a replacement channel. Only
    /// upgrades plain success; a recorded failure always wins.
    pub(crate) fn set_redirected(&mut self) -> bool {
        if matches!(self, ChannelStatus::Ok) {
            *self = ChannelStatus::Redirected;
            true
        } else {
            false
        }
    }

    pub(crate) fn to_error(&self) -> ChannelError {
        match self {
            ChannelStatus::Failed(e) => e.clone(),
            _ => ChannelError::Aborted,
        }
    }
}
