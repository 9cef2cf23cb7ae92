/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ic-channel project authors.
 */

mod response;
pub use response::{HttpHeadError, HttpResponseHead};

mod redirect;
pub use redirect::{is_permanent_redirect, is_redirect_status, rewrite_redirect_to_get};

mod uri;
pub use uri::escape_location;
