/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ic-channel project authors.
 */

use std::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::{oneshot, watch};

use crate::context::ExecContext;
use crate::pipe::BodyReader;
use crate::{ChannelError, ChannelStatus};

/// Receives pump notifications. Start and stop arrive on the coordination
/// context, data on the current delivery context.
pub(crate) trait PumpConsumer: Send + Sync + 'static {
    fn pump_start(&self);
    fn pump_data(&self, chunk: Bytes, offset: u64);
    fn pump_stop(&self, status: ChannelStatus);
}

#[derive(Clone)]
struct PumpCtl {
    suspend: i32,
    cancel: Option<ChannelError>,
    delivery: ExecContext,
}

/// Drives a body source and delivers it to a consumer in fixed-size
/// chunks. The driving loop lives on its own tokio task; this handle only
/// adjusts the control state it watches.
pub(crate) struct BodyPump {
    ctl: watch::Sender<PumpCtl>,
}

impl BodyPump {
    pub(crate) fn start<C: PumpConsumer>(
        source: BodyReader,
        consumer: Arc<C>,
        coordination: ExecContext,
        initial_suspend: i32,
        chunk_size: usize,
    ) -> BodyPump {
        let (ctl_tx, ctl_rx) = watch::channel(PumpCtl {
            suspend: initial_suspend.max(0),
            cancel: None,
            delivery: coordination.clone(),
        });
        tokio::spawn(run_pump(source, consumer, coordination, ctl_rx, chunk_size));
        BodyPump { ctl: ctl_tx }
    }

    pub(crate) fn suspend(&self) -> Result<(), ChannelError> {
        self.ctl.send_modify(|c| c.suspend += 1);
        Ok(())
    }

    pub(crate) fn resume(&self) -> Result<(), ChannelError> {
        self.ctl.send_modify(|c| c.suspend -= 1);
        Ok(())
    }

    pub(crate) fn cancel(&self, reason: ChannelError) {
        self.ctl.send_modify(|c| {
            if c.cancel.is_none() {
                c.cancel = Some(reason);
            }
        });
    }

    pub(crate) fn retarget(&self, target: ExecContext) -> Result<(), ChannelError> {
        self.ctl.send_modify(|c| c.delivery = target);
        Ok(())
    }
}

async fn run_pump<C: PumpConsumer>(
    mut source: BodyReader,
    consumer: Arc<C>,
    coordination: ExecContext,
    mut ctl: watch::Receiver<PumpCtl>,
    chunk_size: usize,
) {
    dispatch_and_wait(&coordination, {
        let consumer = Arc::clone(&consumer);
        move || consumer.pump_start()
    })
    .await;

    let mut offset = 0u64;
    let status = loop {
        let state = wait_runnable(&mut ctl).await;
        if let Some(e) = state.cancel {
            break ChannelStatus::Failed(e);
        }

        let mut buf = BytesMut::with_capacity(chunk_size);
        match source.read_buf(&mut buf).await {
            Ok(0) => break ChannelStatus::Ok,
            Ok(_) => {}
            Err(e) => break ChannelStatus::Failed(ChannelError::CorruptedContent(e.to_string())),
        }

        // cancellation gates every delivery attempt; a chunk read after
        // the cancel flag flipped is discarded, not delivered
        let state = ctl.borrow().clone();
        if let Some(e) = state.cancel {
            break ChannelStatus::Failed(e);
        }

        let chunk = buf.freeze();
        let len = chunk.len() as u64;
        dispatch_and_wait(&state.delivery, {
            let consumer = Arc::clone(&consumer);
            move || consumer.pump_data(chunk, offset)
        })
        .await;
        offset += len;
    };

    if status != ChannelStatus::Ok {
        // leave the source fully consumed: discard whatever is already
        // buffered without waiting for more
        drain_buffered(&mut source).await;
    }

    dispatch_and_wait(&coordination, move || consumer.pump_stop(status)).await;
}

async fn wait_runnable(ctl: &mut watch::Receiver<PumpCtl>) -> PumpCtl {
    loop {
        let cur = ctl.borrow_and_update().clone();
        if cur.cancel.is_some() || cur.suspend <= 0 {
            return cur;
        }
        if ctl.changed().await.is_err() {
            // the owning channel is gone
            let mut cur = cur;
            cur.cancel = Some(ChannelError::Aborted);
            return cur;
        }
    }
}

async fn dispatch_and_wait<F>(target: &ExecContext, task: F)
where
    F: FnOnce() + Send + 'static,
{
    if target.is_current() {
        task();
        return;
    }
    let (tx, rx) = oneshot::channel();
    let sent = target.dispatch(move || {
        task();
        let _ = tx.send(());
    });
    if sent {
        let _ = rx.await;
    }
}

async fn drain_buffered(source: &mut BodyReader) {
    let mut sink = [0u8; 4096];
    poll_fn(|cx| {
        loop {
            let mut buf = ReadBuf::new(&mut sink);
            match Pin::new(&mut *source).poll_read(cx, &mut buf) {
                Poll::Ready(Ok(())) => {
                    if buf.filled().is_empty() {
                        return Poll::Ready(());
                    }
                }
                Poll::Ready(Err(_)) => return Poll::Ready(()),
                Poll::Pending => return Poll::Ready(()),
            }
        }
    })
    .await;
}
