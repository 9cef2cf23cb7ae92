/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ic-channel project authors.
 */

use http::Method;

pub fn is_redirect_status(code: u16) -> bool {
    matches!(code, 301 | 302 | 303 | 307 | 308)
}

pub fn is_permanent_redirect(code: u16) -> bool {
    matches!(code, 301 | 308)
}

/// Whether following a redirect with this status code requires the request
/// method to be rewritten to GET.
pub fn rewrite_redirect_to_get(code: u16, method: &Method) -> bool {
    match code {
        301 | 302 => *method == Method::POST,
        303 => !matches!(*method, Method::GET | Method::HEAD),
        _ => false,
    }
}
