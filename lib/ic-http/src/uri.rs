/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ic-channel project authors.
 */

use std::borrow::Cow;

use percent_encoding::{utf8_percent_encode, CONTROLS};

/// Percent-encode non-ASCII bytes in a Location header value before URI
/// resolution. ASCII printable characters pass through unchanged.
pub fn escape_location(location: &str) -> Cow<'_, str> {
    utf8_percent_encode(location, CONTROLS).into()
}
