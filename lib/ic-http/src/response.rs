/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ic-channel project authors.
 */

use std::str::FromStr;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Version;
use thiserror::Error;

use crate::redirect::{is_permanent_redirect, is_redirect_status};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpHeadError {
    #[error("invalid status code {0}")]
    InvalidStatusCode(u16),
    #[error("invalid header name")]
    InvalidHeaderName,
    #[error("invalid header value")]
    InvalidHeaderValue,
}

/// A mutable status line / header accumulator for a response that is built
/// in process instead of being parsed off the wire.
#[derive(Debug, Clone)]
pub struct HttpResponseHead {
    pub version: Version,
    pub code: u16,
    pub reason: String,
    pub headers: HeaderMap,
}

impl Default for HttpResponseHead {
    fn default() -> Self {
        HttpResponseHead {
            version: Version::HTTP_11,
            code: 200,
            reason: "OK".to_string(),
            headers: HeaderMap::new(),
        }
    }
}

impl HttpResponseHead {
    pub fn new(code: u16, reason: &str) -> Result<Self, HttpHeadError> {
        let mut head = HttpResponseHead::default();
        head.set_status(code, reason)?;
        Ok(head)
    }

    pub fn set_status(&mut self, code: u16, reason: &str) -> Result<(), HttpHeadError> {
        if !(100..=599).contains(&code) {
            return Err(HttpHeadError::InvalidStatusCode(code));
        }
        self.code = code;
        self.reason = reason.to_string();
        Ok(())
    }

    /// Set a header field. Any existing value under the same name is
    /// replaced, not appended to.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), HttpHeadError> {
        let name = HeaderName::from_str(name).map_err(|_| HttpHeadError::InvalidHeaderName)?;
        let value = HeaderValue::from_str(value).map_err(|_| HttpHeadError::InvalidHeaderValue)?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn header_str(&self, name: HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header_str(http::header::CONTENT_LENGTH)
            .and_then(|v| u64::from_str(v.trim()).ok())
    }

    pub fn location(&self) -> Option<&str> {
        self.header_str(http::header::LOCATION)
    }

    pub fn will_redirect(&self) -> bool {
        is_redirect_status(self.code)
    }

    pub fn is_permanent_redirect(&self) -> bool {
        is_permanent_redirect(self.code)
    }
}
