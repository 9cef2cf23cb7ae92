/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ic-channel project authors.
 */

#[derive(Debug, Clone)]
pub struct InterceptConfig {
    /// Buffer capacity of the synthesized body pipe. Writes beyond this
    /// block until the pump starts draining the read end.
    pub body_pipe_capacity: usize,
    /// Upper bound for a single data notification.
    pub pump_chunk_size: usize,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        InterceptConfig {
            body_pipe_capacity: 1024 * 1024,
            pump_chunk_size: 16 * 1024,
        }
    }
}
