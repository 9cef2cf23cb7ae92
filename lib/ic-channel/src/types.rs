/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ic-channel project authors.
 */

use http::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectFlags {
    Temporary,
    Permanent,
    /// Same-process redirect that is invisible to the external protocol.
    Internal,
}

/// Routing and security context a request was issued with. Cloned onto
/// every replacement channel in a redirect chain.
#[derive(Debug, Clone)]
pub struct LoadContext {
    pub redirection_limit: u32,
    pub dont_follow_redirects: bool,
    /// Background loads never emit status or progress notifications.
    pub background: bool,
    pub bypass_interception: bool,
    pub priority: i16,
    pub class_of_service: u32,
}

impl Default for LoadContext {
    fn default() -> Self {
        LoadContext {
            redirection_limit: 10,
            dont_follow_redirects: false,
            background: false,
            bypass_interception: false,
            priority: 0,
            class_of_service: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeState {
    pub start_pos: u64,
    pub entity_id: String,
}

/// Everything a replacement channel inherits from the channel it replaces.
#[derive(Debug, Clone)]
pub struct RedirectSetup {
    /// The original request method, present only when it is preserved
    /// across the hop. Absent means rewrite to GET.
    pub method: Option<Method>,
    pub load: LoadContext,
    pub flags: RedirectFlags,
}
