/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ic-channel project authors.
 */

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::Method;
use log::{debug, trace};
use url::Url;

use ic_http::HttpResponseHead;

use crate::config::InterceptConfig;
use crate::context::ExecContext;
use crate::pipe::{new_body_pipe, BodyReader, BodyWriter};
use crate::pump::{BodyPump, PumpConsumer};
use crate::traits::{
    ChannelFactory, DeliveryOwner, HttpChannel, InterceptController, ProgressSink,
    RedirectVerifier, RequestGroup, StreamConsumer,
};
use crate::types::{LoadContext, ResumeState};
use crate::{ChannelError, ChannelStatus};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    AwaitingInterception,
    Synthesizing,
    RedirectPending,
    Streaming,
    Completed,
}

/// How the interception attempt ended: with a synthesized response or by
/// resetting to a plain network load. Recorded for duration accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FinishDisposition {
    Unsettled,
    Synthesized,
    Reset,
}

#[derive(Clone, Default)]
pub(crate) struct Collaborators {
    pub(crate) controller: Option<Arc<dyn InterceptController>>,
    pub(crate) verifier: Option<Arc<dyn RedirectVerifier>>,
    pub(crate) factory: Option<Arc<dyn ChannelFactory>>,
    pub(crate) group: Option<Arc<dyn RequestGroup>>,
}

#[derive(Default)]
pub(crate) struct TimingMarks {
    pub(crate) dispatch_start: Option<Instant>,
    pub(crate) handle_start: Option<Instant>,
    pub(crate) finish_start: Option<Instant>,
    pub(crate) finish_end: Option<Instant>,
    pub(crate) response_start: Option<Instant>,
    pub(crate) response_end: Option<Instant>,
}

/// Post-hoc duration accounting for one interception attempt. Never used
/// for control decisions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelTimings {
    /// From handing the channel to the controller until synthesis began.
    pub dispatch: Option<Duration>,
    /// From the first synthesis call until the response was settled.
    pub finish: Option<Duration>,
    /// From first to last byte of the delivered response.
    pub response: Option<Duration>,
}

pub(crate) struct ChannelState {
    pub(crate) phase: Phase,
    pub(crate) method: Method,
    pub(crate) load: LoadContext,
    pub(crate) pending_head: Option<HttpResponseHead>,
    pub(crate) committed_head: Option<HttpResponseHead>,
    pub(crate) body_reader: Option<BodyReader>,
    pub(crate) body_writer: Option<BodyWriter>,
    pub(crate) status: ChannelStatus,
    pub(crate) listener: Option<Box<dyn StreamConsumer>>,
    pub(crate) progress_sink: Option<Box<dyn ProgressSink>>,
    pub(crate) delivery_owner: Option<Box<dyn DeliveryOwner>>,
    pub(crate) redirect_channel: Option<Box<dyn HttpChannel>>,
    pub(crate) resume: Option<ResumeState>,
    pub(crate) original_uri: Option<Url>,
    pub(crate) pump: Option<BodyPump>,
    pub(crate) is_pending: bool,
    pub(crate) on_start_fired: bool,
    pub(crate) released: bool,
    pub(crate) last_reported: u64,
    pub(crate) status_host: Option<String>,
    pub(crate) content_length: Option<u64>,
    pub(crate) marks: TimingMarks,
    pub(crate) disposition: FinishDisposition,
}

pub(crate) struct ChannelInner {
    pub(crate) id: u64,
    pub(crate) uri: Url,
    pub(crate) created: Instant,
    pub(crate) config: InterceptConfig,
    pub(crate) coordination: ExecContext,
    pub(crate) collaborators: Collaborators,
    pub(crate) canceled: AtomicBool,
    pub(crate) suspend_count: AtomicI32,
    pub(crate) progress: AtomicU64,
    pub(crate) reporting_in_flight: AtomicBool,
    pub(crate) state: Mutex<ChannelState>,
}

/// One attempt to fulfill a request by interception. Cloneable handle; all
/// clones share the same underlying channel.
#[derive(Clone)]
pub struct InterceptedHttpChannel {
    pub(crate) inner: Arc<ChannelInner>,
}

pub struct ChannelBuilder {
    uri: Url,
    method: Method,
    load: LoadContext,
    config: InterceptConfig,
    coordination: ExecContext,
    collaborators: Collaborators,
    progress_sink: Option<Box<dyn ProgressSink>>,
    created: Option<Instant>,
    presynthesized: Option<(HttpResponseHead, BodyReader)>,
}

impl ChannelBuilder {
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn load_context(mut self, load: LoadContext) -> Self {
        self.load = load;
        self
    }

    pub fn config(mut self, config: InterceptConfig) -> Self {
        self.config = config;
        self
    }

    pub fn controller(mut self, controller: Arc<dyn InterceptController>) -> Self {
        self.collaborators.controller = Some(controller);
        self
    }

    pub fn redirect_verifier(mut self, verifier: Arc<dyn RedirectVerifier>) -> Self {
        self.collaborators.verifier = Some(verifier);
        self
    }

    pub fn channel_factory(mut self, factory: Arc<dyn ChannelFactory>) -> Self {
        self.collaborators.factory = Some(factory);
        self
    }

    pub fn request_group(mut self, group: Arc<dyn RequestGroup>) -> Self {
        self.collaborators.group = Some(group);
        self
    }

    pub fn progress_sink(mut self, sink: Box<dyn ProgressSink>) -> Self {
        self.progress_sink = Some(sink);
        self
    }

    /// Inherit the creation time of the channel that triggered this
    /// interception so the extra internal hop does not mask time already
    /// spent on the request.
    pub fn inherit_timing(mut self, created: Instant) -> Self {
        self.created = Some(created);
        self
    }

    /// Seed the channel with an already-synthesized response. Opening such
    /// a channel replays the response instead of consulting the
    /// interception controller.
    pub fn presynthesized(mut self, head: HttpResponseHead, body: BodyReader) -> Self {
        self.presynthesized = Some((head, body));
        self
    }

    pub(crate) fn collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn build(self) -> InterceptedHttpChannel {
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let (committed_head, body_reader) = match self.presynthesized {
            Some((head, body)) => (Some(head), Some(body)),
            None => (None, None),
        };
        trace!("channel {id}: created for {}", self.uri);
        InterceptedHttpChannel {
            inner: Arc::new(ChannelInner {
                id,
                uri: self.uri,
                created: self.created.unwrap_or_else(Instant::now),
                config: self.config,
                coordination: self.coordination,
                collaborators: self.collaborators,
                canceled: AtomicBool::new(false),
                suspend_count: AtomicI32::new(0),
                progress: AtomicU64::new(0),
                reporting_in_flight: AtomicBool::new(false),
                state: Mutex::new(ChannelState {
                    phase: Phase::Idle,
                    method: self.method,
                    load: self.load,
                    pending_head: None,
                    committed_head,
                    body_reader,
                    body_writer: None,
                    status: ChannelStatus::Ok,
                    listener: None,
                    progress_sink: self.progress_sink,
                    delivery_owner: None,
                    redirect_channel: None,
                    resume: None,
                    original_uri: None,
                    pump: None,
                    is_pending: false,
                    on_start_fired: false,
                    released: false,
                    last_reported: 0,
                    status_host: None,
                    content_length: None,
                    marks: TimingMarks::default(),
                    disposition: FinishDisposition::Unsettled,
                }),
            }),
        }
    }
}

/// Pump-side handle. Holds a strong reference so a channel whose only
/// owner is its own pump (an internally redirected replacement after
/// open consumed the boxed handle) stays alive until the stream settles;
/// the pump task drops it right after the stop notification.
struct PumpAdapter {
    channel: InterceptedHttpChannel,
}

impl PumpConsumer for PumpAdapter {
    fn pump_start(&self) {
        self.channel.pump_started();
    }

    fn pump_data(&self, chunk: Bytes, offset: u64) {
        self.channel.pump_data(chunk, offset);
    }

    fn pump_stop(&self, status: ChannelStatus) {
        self.channel.pump_stopped(status);
    }
}

impl InterceptedHttpChannel {
    /// Start building a channel bound to the given coordination context.
    pub fn builder(uri: Url, coordination: ExecContext) -> ChannelBuilder {
        ChannelBuilder {
            uri,
            method: Method::GET,
            load: LoadContext::default(),
            config: InterceptConfig::default(),
            coordination,
            collaborators: Collaborators::default(),
            progress_sink: None,
            created: None,
            presynthesized: None,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn uri(&self) -> &Url {
        &self.inner.uri
    }

    pub fn method(&self) -> Method {
        self.lock().method.clone()
    }

    pub fn status(&self) -> ChannelStatus {
        self.lock().status.clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    pub fn is_pending(&self) -> bool {
        self.lock().is_pending
    }

    /// Whether a synthesized response head or body exists on this channel.
    pub fn response_synthesized(&self) -> bool {
        let st = self.lock();
        st.committed_head.is_some() || st.pending_head.is_some() || st.body_reader.is_some()
    }

    pub fn committed_response_head(&self) -> Option<HttpResponseHead> {
        self.lock().committed_head.clone()
    }

    pub fn load_context(&self) -> LoadContext {
        self.lock().load.clone()
    }

    pub fn timings(&self) -> ChannelTimings {
        let st = self.lock();
        let span = |a: Option<Instant>, b: Option<Instant>| match (a, b) {
            (Some(a), Some(b)) => Some(b.saturating_duration_since(a)),
            _ => None,
        };
        ChannelTimings {
            dispatch: span(st.marks.dispatch_start, st.marks.handle_start),
            finish: span(st.marks.finish_start, st.marks.finish_end),
            response: span(st.marks.response_start, st.marks.response_end),
        }
    }

    /// Open the channel and start fulfilling the request.
    ///
    /// This is the only lifecycle call that may notify the listener before
    /// returning: when no interception controller can take the request, the
    /// channel cancels itself and delivers the terminating notification
    /// synchronously.
    pub fn async_open(&self, listener: Box<dyn StreamConsumer>) -> Result<(), ChannelError> {
        if self.is_canceled() {
            return Err(self.lock().status.to_error());
        }

        let replay = {
            let mut st = self.lock();
            if st.phase != Phase::Idle {
                return Err(ChannelError::AlreadyOpened);
            }
            st.phase = Phase::AwaitingInterception;
            st.is_pending = true;
            st.listener = Some(listener);
            st.body_reader.is_some()
        };
        if let Some(group) = &self.inner.collaborators.group {
            group.add_request(self.inner.id);
        }
        trace!("channel {}: opened for {}", self.inner.id, self.inner.uri);

        if replay {
            // a pre-synthesized response either redirects or streams; the
            // interception controller is not consulted again
            let r = if self.should_redirect() {
                self.follow_synthetic_redirect()
            } else {
                self.start_pump()
            };
            if let Err(e) = r {
                let _ = self.cancel_interception(e.clone());
                return Err(e);
            }
            return Ok(());
        }

        let controller = match &self.inner.collaborators.controller {
            Some(c) => Arc::clone(c),
            None => {
                let e = ChannelError::InterceptionUnavailable;
                let _ = self.cancel_interception(e.clone());
                return Err(e);
            }
        };
        self.lock().marks.dispatch_start = Some(Instant::now());
        if let Err(e) = controller.channel_intercepted(self) {
            let _ = self.cancel_interception(e.clone());
            return Err(e);
        }
        Ok(())
    }

    /// Cancel the channel. Idempotent: the second and later calls succeed
    /// without changing the recorded status.
    pub fn cancel_interception(&self, reason: ChannelError) -> Result<(), ChannelError> {
        if self.inner.canceled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("channel {}: canceled: {reason}", self.inner.id);
        let has_pump = {
            let mut st = self.lock();
            st.status.set_failure(reason);
            if let Some(pump) = st.pump.as_ref() {
                pump.cancel(st.status.to_error());
                true
            } else {
                false
            }
        };
        if !has_pump {
            // no pump to drive the stop notification; abort directly
            self.deliver_stop_and_release();
        }
        Ok(())
    }

    pub fn cancel(&self, reason: ChannelError) -> Result<(), ChannelError> {
        self.cancel_interception(reason)
    }

    pub fn suspend(&self) -> Result<(), ChannelError> {
        self.inner.suspend_count.fetch_add(1, Ordering::AcqRel);
        self.forward_suspension(true)
    }

    pub fn resume(&self) -> Result<(), ChannelError> {
        self.inner.suspend_count.fetch_sub(1, Ordering::AcqRel);
        self.forward_suspension(false)
    }

    fn forward_suspension(&self, suspend: bool) -> Result<(), ChannelError> {
        let mut first_err = None;
        let owner = {
            let mut st = self.lock();
            if let Some(pump) = st.pump.as_ref() {
                let r = if suspend { pump.suspend() } else { pump.resume() };
                if let Err(e) = r {
                    first_err.get_or_insert(e);
                }
            }
            st.delivery_owner.take()
        };
        // the diversion owner is called without holding the state lock so
        // it may call back into the channel
        if let Some(mut owner) = owner {
            let r = if suspend {
                owner.suspend_delivery()
            } else {
                owner.resume_delivery()
            };
            if let Err(e) = r {
                first_err.get_or_insert(e);
            }
            let mut st = self.lock();
            if !st.released && st.delivery_owner.is_none() {
                st.delivery_owner = Some(owner);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Record a resume request. Synthesized content is never resumable;
    /// the parameters are kept so they can be propagated to a replacement
    /// channel that talks to a real transport.
    pub fn resume_at(&self, start_pos: u64, entity_id: &str) -> Result<(), ChannelError> {
        let mut st = self.lock();
        st.resume = Some(ResumeState {
            start_pos,
            entity_id: entity_id.to_string(),
        });
        Ok(())
    }

    /// Move chunk delivery to another execution context. Moving to the
    /// context the caller is already on is a no-op.
    pub fn retarget_delivery_to(&self, target: &ExecContext) -> Result<(), ChannelError> {
        if target.is_current() {
            return Ok(());
        }
        let st = self.lock();
        match st.pump.as_ref() {
            Some(pump) => pump.retarget(target.clone()),
            None => Err(ChannelError::NotAvailable),
        }
    }

    /// Attach a delivery-diversion owner. The suspend count recorded so
    /// far is replayed onto it.
    pub fn divert_delivery_to(
        &self,
        mut owner: Box<dyn DeliveryOwner>,
    ) -> Result<(), ChannelError> {
        let count = self.inner.suspend_count.load(Ordering::Acquire).max(0);
        for _ in 0..count {
            owner.suspend_delivery()?;
        }
        self.lock().delivery_owner = Some(owner);
        Ok(())
    }

    pub fn stop_delivery_diversion(&self) {
        self.lock().delivery_owner = None;
    }

    /// Append or overwrite the status line of the response being
    /// synthesized. Fails once the response is finished.
    pub fn synthesize_status(&self, code: u16, reason: &str) -> Result<(), ChannelError> {
        let mut st = self.begin_synthesis_call()?;
        st.pending_head
            .get_or_insert_with(HttpResponseHead::default)
            .set_status(code, reason)?;
        Ok(())
    }

    /// Set a header on the response being synthesized, overwriting any
    /// existing value of the same name. Fails once the response is
    /// finished.
    pub fn synthesize_header(&self, name: &str, value: &str) -> Result<(), ChannelError> {
        let mut st = self.begin_synthesis_call()?;
        st.pending_head
            .get_or_insert_with(HttpResponseHead::default)
            .set_header(name, value)?;
        Ok(())
    }

    /// Get the writable end of the synthesized body pipe, creating the
    /// pipe on first use. Idempotent.
    pub fn response_body_writer(&self) -> Result<BodyWriter, ChannelError> {
        let mut st = self.begin_synthesis_call()?;
        if let Some(writer) = &st.body_writer {
            return Ok(writer.clone());
        }
        let (reader, writer) = new_body_pipe(self.inner.config.body_pipe_capacity);
        st.body_reader = Some(reader);
        st.body_writer = Some(writer.clone());
        Ok(writer)
    }

    fn begin_synthesis_call(&self) -> Result<MutexGuard<'_, ChannelState>, ChannelError> {
        if self.is_canceled() {
            return Err(self.lock().status.to_error());
        }
        let mut st = self.lock();
        if st.committed_head.is_some() {
            return Err(ChannelError::ResponseAlreadyFinished);
        }
        if st.phase == Phase::AwaitingInterception {
            st.phase = Phase::Synthesizing;
        }
        st.marks.handle_start.get_or_insert_with(Instant::now);
        Ok(st)
    }

    /// Commit the synthesized response head and settle the response:
    /// follow a synthetic redirect, replay cross-origin through an
    /// internal redirect, or start streaming the body. No synthesis call
    /// is valid afterwards.
    pub fn finish_synthesized_response(&self, final_uri_spec: &str) -> Result<(), ChannelError> {
        if self.is_canceled() {
            return Err(self.lock().status.to_error());
        }
        {
            let mut st = self.lock();
            if st.committed_head.is_some() {
                return Err(ChannelError::ResponseAlreadyFinished);
            }
            if let Some(writer) = st.body_writer.take() {
                writer.close();
            }
            let head = st.pending_head.take().unwrap_or_default();
            st.committed_head = Some(head);
            st.marks.finish_start.get_or_insert_with(Instant::now);
            st.marks.finish_end = Some(Instant::now());
            st.disposition = FinishDisposition::Synthesized;
        }
        let r = self.settle_synthesized_response(final_uri_spec);
        if let Err(e) = &r {
            // the listener still sees exactly one terminating notification
            let _ = self.cancel_interception(e.clone());
        }
        r
    }

    fn settle_synthesized_response(&self, final_uri_spec: &str) -> Result<(), ChannelError> {
        if self.should_redirect() {
            return self.follow_synthetic_redirect();
        }
        {
            let mut st = self.lock();
            if st.body_reader.is_none() {
                // errors and redirects may not carry a body; substitute an
                // empty one so downstream code need not special-case it
                st.body_reader = Some(BodyReader::empty());
            }
        }
        if !final_uri_spec.is_empty() {
            let response_uri = Url::parse(final_uri_spec)
                .map_err(|e| ChannelError::CorruptedContent(format!("invalid final URL: {e}")))?;
            if response_uri != self.inner.uri {
                return self.redirect_for_opaque_response(response_uri);
            }
        }
        self.start_pump()
    }

    pub(crate) fn should_redirect(&self) -> bool {
        let st = self.lock();
        st.committed_head
            .as_ref()
            .map(|h| h.will_redirect())
            .unwrap_or(false)
            && !st.load.dont_follow_redirects
    }

    pub(crate) fn start_pump(&self) -> Result<(), ChannelError> {
        let mut st = self.lock();
        debug_assert!(st.pump.is_none());
        if st.resume.as_ref().is_some_and(|r| r.start_pos > 0) {
            // a synthesized response cannot promise the same bytes twice,
            // so a partial replay from an offset is refused outright
            return Err(ChannelError::NotResumable);
        }
        let source = st.body_reader.take().ok_or(ChannelError::NotAvailable)?;
        // the content length is only a best-effort progress denominator;
        // the stream itself arrives incrementally
        st.content_length = st.committed_head.as_ref().and_then(|h| h.content_length());
        st.phase = Phase::Streaming;
        let initial_suspend = self.inner.suspend_count.load(Ordering::Acquire);
        let pump = BodyPump::start(
            source,
            Arc::new(PumpAdapter {
                channel: self.clone(),
            }),
            self.inner.coordination.clone(),
            initial_suspend,
            self.inner.config.pump_chunk_size,
        );
        st.pump = Some(pump);
        Ok(())
    }

    fn take_listener(st: &mut ChannelState) -> Option<Box<dyn StreamConsumer>> {
        st.listener.take()
    }

    fn put_back_listener(&self, listener: Option<Box<dyn StreamConsumer>>) {
        if let Some(listener) = listener {
            let mut st = self.lock();
            if !st.released && st.listener.is_none() {
                st.listener = Some(listener);
            }
        }
    }

    pub(crate) fn pump_started(&self) {
        let mut listener = {
            let mut st = self.lock();
            if st.released || st.on_start_fired {
                return;
            }
            st.on_start_fired = true;
            st.marks.response_start.get_or_insert_with(Instant::now);
            Self::take_listener(&mut st)
        };
        if let Some(l) = listener.as_mut() {
            l.on_start();
        }
        self.put_back_listener(listener);
    }

    pub(crate) fn pump_data(&self, chunk: Bytes, offset: u64) {
        // cancellation gates delivery even for chunks already in flight
        if self.is_canceled() {
            return;
        }
        let background = self.lock().load.background;
        if !background {
            self.inner
                .progress
                .store(offset + chunk.len() as u64, Ordering::Release);
            self.maybe_report_status_and_progress();
        }
        let mut listener = {
            let mut st = self.lock();
            Self::take_listener(&mut st)
        };
        if let Some(l) = listener.as_mut() {
            l.on_data(chunk, offset);
        }
        self.put_back_listener(listener);
    }

    pub(crate) fn pump_stopped(&self, status: ChannelStatus) {
        {
            let mut st = self.lock();
            if st.released {
                return;
            }
            if let ChannelStatus::Failed(e) = status {
                st.status.set_failure(e);
            }
            st.marks.response_end = Some(Instant::now());
            st.phase = Phase::Completed;
            st.is_pending = false;
        }
        self.deliver_stop_and_release();
    }

    /// Deliver the single terminating notification and tear the channel
    /// down. Reachable from every terminal transition; only the first
    /// caller does anything.
    pub(crate) fn deliver_stop_and_release(&self) {
        let (mut listener, status, started) = {
            let mut st = self.lock();
            if st.released {
                return;
            }
            st.is_pending = false;
            st.phase = Phase::Completed;
            let started = st.on_start_fired;
            st.on_start_fired = true;
            (Self::take_listener(&mut st), st.status.clone(), started)
        };
        // flush any coalesced progress so the final numbers match the
        // bytes actually delivered
        self.maybe_report_status_and_progress();
        if let Some(l) = listener.as_mut() {
            if !started {
                l.on_start();
            }
            l.on_stop(status);
        }
        self.release_collaborators();
    }

    /// The single ownership teardown point. Drops every collaborator
    /// reference so no cycle between channel, pump and listener survives.
    pub(crate) fn release_collaborators(&self) {
        let (status, disposition) = {
            let mut st = self.lock();
            if st.released {
                return;
            }
            st.released = true;
            debug_assert!(!st.is_pending);
            st.listener = None;
            st.progress_sink = None;
            st.delivery_owner = None;
            st.pump = None;
            st.redirect_channel = None;
            st.body_reader = None;
            st.body_writer = None;
            st.pending_head = None;
            (st.status.clone(), st.disposition)
        };
        if let Some(group) = &self.inner.collaborators.group {
            group.remove_request(self.inner.id, &status);
        }
        let timings = self.timings();
        debug!(
            "channel {}: released, status {status:?}, disposition {disposition:?}, lived {:?}, timings {timings:?}",
            self.inner.id,
            self.inner.created.elapsed(),
        );
    }
}
