/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ic-channel project authors.
 */

use std::sync::atomic::{AtomicU64, Ordering};

use log::trace;
use tokio::sync::mpsc;

type ContextTask = Box<dyn FnOnce() + Send + 'static>;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT_CONTEXT: u64;
}

/// A serial execution context. Tasks submitted to it run in submission
/// order on a dedicated tokio task, which gives mutual exclusion by
/// construction for everything funneled through one context.
#[derive(Clone)]
pub struct ExecContext {
    id: u64,
    sender: mpsc::UnboundedSender<ContextTask>,
}

impl ExecContext {
    /// Create a context and spawn its runner on the current tokio runtime.
    /// The runner exits once every handle to the context is dropped.
    pub fn spawn(name: &str) -> ExecContext {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, mut receiver) = mpsc::unbounded_channel::<ContextTask>();
        let name = name.to_string();
        tokio::spawn(CURRENT_CONTEXT.scope(id, async move {
            while let Some(task) = receiver.recv().await {
                task();
            }
            trace!("exec context {name}({id}) drained");
        }));
        ExecContext { id, sender }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the calling code is already running on this context.
    pub fn is_current(&self) -> bool {
        CURRENT_CONTEXT.try_with(|id| *id == self.id).unwrap_or(false)
    }

    /// Submit a task. Returns false if the runner is gone.
    pub fn dispatch<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender.send(Box::new(task)).is_ok()
    }
}
