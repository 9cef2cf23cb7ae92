/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ic-channel project authors.
 */

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use tokio::sync::Notify;
use url::Url;

use async_trait::async_trait;
use ic_channel::{
    ChannelError, ChannelFactory, ChannelStatus, HttpChannel, InterceptController,
    InterceptedHttpChannel, LoadContext, ProgressSink, RedirectFlags, RedirectSetup,
    RedirectVerifier, RequestGroup, StreamConsumer,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start,
    Data(Vec<u8>, u64),
    Stop(ChannelStatus),
    Status(String),
    Progress(u64, Option<u64>),
    GroupAdd(u64),
    GroupRemove(u64, ChannelStatus),
    Verify(RedirectFlags, String),
    NetOpen(String),
}

/// Shared ordered record of everything the doubles observe.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<Event>>,
    notify: Notify,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(EventLog::default())
    }

    pub fn push(&self, e: Event) {
        self.events.lock().unwrap().push(e);
        self.notify.notify_waiters();
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Only the listener-facing stream events, in delivery order.
    pub fn stream_events(&self) -> Vec<Event> {
        self.snapshot()
            .into_iter()
            .filter(|e| matches!(e, Event::Start | Event::Data(..) | Event::Stop(_)))
            .collect()
    }

    /// Wait until the recorded events satisfy the predicate. Bounded, so
    /// a stream that never settles fails the test instead of hanging it.
    pub async fn wait_for<F>(&self, pred: F)
    where
        F: Fn(&[Event]) -> bool,
    {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if pred(&self.events.lock().unwrap()) {
                    return;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .is_err()
        {
            panic!("timed out waiting for events, log so far: {:?}", self.snapshot());
        }
    }

    pub async fn wait_stopped(&self) {
        self.wait_for(|evs| evs.iter().any(|e| matches!(e, Event::Stop(_))))
            .await;
    }
}

pub struct TestListener(pub Arc<EventLog>);

impl StreamConsumer for TestListener {
    fn on_start(&mut self) {
        self.0.push(Event::Start);
    }

    fn on_data(&mut self, chunk: Bytes, offset: u64) {
        self.0.push(Event::Data(chunk.to_vec(), offset));
    }

    fn on_stop(&mut self, status: ChannelStatus) {
        self.0.push(Event::Stop(status));
    }
}

pub struct TestSink(pub Arc<EventLog>);

impl ProgressSink for TestSink {
    fn on_status(&mut self, host: &str) {
        self.0.push(Event::Status(host.to_string()));
    }

    fn on_progress(&mut self, progress: u64, total: Option<u64>) {
        self.0.push(Event::Progress(progress, total));
    }
}

pub struct TestGroup(pub Arc<EventLog>);

impl RequestGroup for TestGroup {
    fn add_request(&self, channel_id: u64) {
        self.0.push(Event::GroupAdd(channel_id));
    }

    fn remove_request(&self, channel_id: u64, status: &ChannelStatus) {
        self.0.push(Event::GroupRemove(channel_id, status.clone()));
    }
}

/// Controller that stashes the dispatched channel so the test can drive
/// the synthesis contract itself.
#[derive(Default)]
pub struct CaptureController {
    slot: Mutex<Option<InterceptedHttpChannel>>,
}

impl CaptureController {
    pub fn new() -> Arc<Self> {
        Arc::new(CaptureController::default())
    }

    pub fn take(&self) -> InterceptedHttpChannel {
        self.slot
            .lock()
            .unwrap()
            .take()
            .expect("no channel was dispatched")
    }
}

impl InterceptController for CaptureController {
    fn channel_intercepted(&self, channel: &InterceptedHttpChannel) -> Result<(), ChannelError> {
        *self.slot.lock().unwrap() = Some(channel.clone());
        Ok(())
    }
}

pub struct FailController(pub ChannelError);

impl InterceptController for FailController {
    fn channel_intercepted(&self, _channel: &InterceptedHttpChannel) -> Result<(), ChannelError> {
        Err(self.0.clone())
    }
}

/// Verifier that records what it was asked about and optionally vetoes.
pub struct RecordingVerifier {
    log: Arc<EventLog>,
    deny: Option<String>,
}

impl RecordingVerifier {
    pub fn approving(log: Arc<EventLog>) -> Arc<Self> {
        Arc::new(RecordingVerifier { log, deny: None })
    }

    pub fn denying(log: Arc<EventLog>, reason: &str) -> Arc<Self> {
        Arc::new(RecordingVerifier {
            log,
            deny: Some(reason.to_string()),
        })
    }
}

#[async_trait]
impl RedirectVerifier for RecordingVerifier {
    async fn verify_redirect(
        &self,
        _old: &InterceptedHttpChannel,
        new: &dyn HttpChannel,
        flags: RedirectFlags,
    ) -> Result<(), ChannelError> {
        self.log.push(Event::Verify(flags, new.uri().to_string()));
        match &self.deny {
            Some(reason) => Err(ChannelError::RedirectVetoed(reason.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenedRequest {
    pub uri: String,
    pub method: Method,
    pub bypass: bool,
    pub redirection_limit: u32,
    pub original_uri: Option<String>,
    pub resume: Option<(u64, String)>,
}

/// Factory for stand-in network channels. Every channel it produces
/// records what it was configured with and completes immediately with an
/// empty successful response when opened.
pub struct TestFactory {
    log: Arc<EventLog>,
    opened: Arc<Mutex<Vec<OpenedRequest>>>,
    resumable: bool,
}

impl TestFactory {
    pub fn new(log: Arc<EventLog>) -> Arc<Self> {
        Arc::new(TestFactory {
            log,
            opened: Arc::new(Mutex::new(Vec::new())),
            resumable: true,
        })
    }

    pub fn non_resumable(log: Arc<EventLog>) -> Arc<Self> {
        Arc::new(TestFactory {
            log,
            opened: Arc::new(Mutex::new(Vec::new())),
            resumable: false,
        })
    }

    pub fn opened(&self) -> Vec<OpenedRequest> {
        self.opened.lock().unwrap().clone()
    }
}

impl ChannelFactory for TestFactory {
    fn new_channel(
        &self,
        uri: &Url,
        load: &LoadContext,
        _flags: RedirectFlags,
    ) -> Result<Box<dyn HttpChannel>, ChannelError> {
        Ok(Box::new(TestChannel {
            uri: uri.clone(),
            load: load.clone(),
            setup: None,
            original_uri: None,
            resume: None,
            resumable: self.resumable,
            log: Arc::clone(&self.log),
            opened: Arc::clone(&self.opened),
        }))
    }
}

pub struct TestChannel {
    uri: Url,
    load: LoadContext,
    setup: Option<RedirectSetup>,
    original_uri: Option<Url>,
    resume: Option<(u64, String)>,
    resumable: bool,
    log: Arc<EventLog>,
    opened: Arc<Mutex<Vec<OpenedRequest>>>,
}

impl HttpChannel for TestChannel {
    fn uri(&self) -> &Url {
        &self.uri
    }

    fn supports_resume(&self) -> bool {
        self.resumable
    }

    fn resume_at(&mut self, start_pos: u64, entity_id: &str) -> Result<(), ChannelError> {
        self.resume = Some((start_pos, entity_id.to_string()));
        Ok(())
    }

    fn set_original_uri(&mut self, uri: Url) {
        self.original_uri = Some(uri);
    }

    fn apply_redirect_setup(&mut self, setup: &RedirectSetup) -> Result<(), ChannelError> {
        self.setup = Some(setup.clone());
        Ok(())
    }

    fn open(self: Box<Self>, mut listener: Box<dyn StreamConsumer>) -> Result<(), ChannelError> {
        let (method, load) = match &self.setup {
            Some(setup) => (
                setup.method.clone().unwrap_or(Method::GET),
                setup.load.clone(),
            ),
            None => (Method::GET, self.load.clone()),
        };
        self.opened.lock().unwrap().push(OpenedRequest {
            uri: self.uri.to_string(),
            method,
            bypass: load.bypass_interception,
            redirection_limit: load.redirection_limit,
            original_uri: self.original_uri.as_ref().map(|u| u.to_string()),
            resume: self.resume.clone(),
        });
        self.log.push(Event::NetOpen(self.uri.to_string()));
        listener.on_start();
        listener.on_stop(ChannelStatus::Ok);
        Ok(())
    }
}
