/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ic-channel project authors.
 */

use std::sync::Arc;

use http::Method;
use log::{debug, trace};
use url::Url;

use ic_http::{escape_location, rewrite_redirect_to_get};

use crate::channel::{InterceptedHttpChannel, Phase};
use crate::traits::{ChannelFactory, HttpChannel, StreamConsumer};
use crate::types::{RedirectFlags, RedirectSetup};
use crate::ChannelError;

impl InterceptedHttpChannel {
    fn factory(&self) -> Result<Arc<dyn ChannelFactory>, ChannelError> {
        self.inner
            .collaborators
            .factory
            .clone()
            .ok_or_else(|| ChannelError::ConstructionFailed("no channel factory".to_string()))
    }

    /// Hand the request off to a replacement channel targeting the
    /// Location of the committed synthesized response.
    pub(crate) fn follow_synthetic_redirect(&self) -> Result<(), ChannelError> {
        let (location, code, method, load) = {
            let st = self.lock();
            let head = st.committed_head.as_ref().ok_or_else(|| {
                ChannelError::CorruptedContent("redirect without a response head".to_string())
            })?;
            let location = head
                .location()
                .ok_or_else(|| {
                    ChannelError::CorruptedContent("redirect without a Location header".to_string())
                })?
                .to_string();
            (location, head.code, st.method.clone(), st.load.clone())
        };
        if load.redirection_limit == 0 {
            return Err(ChannelError::RedirectLoop);
        }
        // the Location value may carry raw non-ASCII; escape before parsing
        let escaped = escape_location(&location);
        let target = self
            .inner
            .uri
            .join(&escaped)
            .map_err(|e| ChannelError::CorruptedContent(format!("invalid Location: {e}")))?;
        let flags = if ic_http::is_permanent_redirect(code) {
            RedirectFlags::Permanent
        } else {
            RedirectFlags::Temporary
        };
        let rewrite = rewrite_redirect_to_get(code, &method);
        debug!(
            "channel {}: synthetic {code} redirect to {target}{}",
            self.inner.id,
            if rewrite { " (rewritten to GET)" } else { "" },
        );
        let mut new = self.factory()?.new_channel(&target, &load, flags)?;
        self.setup_replacement_channel(new.as_mut(), !rewrite, flags, false)?;
        self.commence_redirect(new, flags);
        Ok(())
    }

    /// Replay a committed response whose final URL differs from the request
    /// URI through an internal redirect, so the consumer observes the
    /// response under the URL it was actually fetched from.
    pub(crate) fn redirect_for_opaque_response(
        &self,
        response_uri: Url,
    ) -> Result<(), ChannelError> {
        let (head, body, method, load) = {
            let mut st = self.lock();
            let head = st.committed_head.clone().ok_or_else(|| {
                ChannelError::CorruptedContent("opaque redirect without a response head".to_string())
            })?;
            let body = st.body_reader.take().ok_or(ChannelError::NotAvailable)?;
            (head, body, st.method.clone(), st.load.clone())
        };
        debug!(
            "channel {}: internal redirect to response URL {response_uri}",
            self.inner.id
        );
        let replacement = InterceptedHttpChannel::builder(response_uri, self.inner.coordination.clone())
            .method(method)
            .load_context(load)
            .config(self.inner.config.clone())
            .collaborators(self.inner.collaborators.clone())
            .inherit_timing(self.inner.created)
            .presynthesized(head, body)
            .build();
        let mut new: Box<dyn HttpChannel> = Box::new(replacement);
        self.setup_replacement_channel(new.as_mut(), true, RedirectFlags::Internal, false)?;
        self.commence_redirect(new, RedirectFlags::Internal);
        Ok(())
    }

    /// Abandon interception and reissue the request over the network,
    /// bypassing interception on the replacement.
    pub fn reset_interception(&self) -> Result<(), ChannelError> {
        if self.is_canceled() {
            return Err(self.lock().status.to_error());
        }
        let r = self.reset_to_network();
        if let Err(e) = &r {
            let _ = self.cancel_interception(e.clone());
        }
        r
    }

    fn reset_to_network(&self) -> Result<(), ChannelError> {
        use crate::channel::FinishDisposition;
        use std::time::Instant;

        let load = {
            let mut st = self.lock();
            st.disposition = FinishDisposition::Reset;
            st.marks.finish_start.get_or_insert_with(Instant::now);
            st.marks.finish_end = Some(Instant::now());
            // whatever was synthesized so far is discarded
            st.pending_head = None;
            st.committed_head = None;
            st.body_reader = None;
            if let Some(writer) = st.body_writer.take() {
                writer.close();
            }
            let mut load = st.load.clone();
            load.bypass_interception = true;
            load
        };
        debug!("channel {}: reset to network load", self.inner.id);
        let mut new = self
            .factory()?
            .new_channel(&self.inner.uri, &load, RedirectFlags::Internal)?;
        self.setup_replacement_channel(new.as_mut(), true, RedirectFlags::Internal, true)?;
        self.commence_redirect(new, RedirectFlags::Internal);
        Ok(())
    }

    /// Propagate request state onto a replacement channel before the
    /// redirect is verified.
    fn setup_replacement_channel(
        &self,
        new: &mut dyn HttpChannel,
        preserve_method: bool,
        flags: RedirectFlags,
        force_bypass: bool,
    ) -> Result<(), ChannelError> {
        let (method, mut load, resume) = {
            let st = self.lock();
            (st.method.clone(), st.load.clone(), st.resume.clone())
        };
        if flags != RedirectFlags::Internal {
            load.redirection_limit = load.redirection_limit.saturating_sub(1);
        }
        load.bypass_interception |= force_bypass;
        let setup = RedirectSetup {
            method: preserve_method.then_some(method),
            load,
            flags,
        };
        new.apply_redirect_setup(&setup)?;
        if let Some(resume) = resume {
            if resume.start_pos > 0 {
                if !new.supports_resume() {
                    return Err(ChannelError::NotResumable);
                }
                new.resume_at(resume.start_pos, &resume.entity_id)?;
            }
        }
        Ok(())
    }

    /// Park the replacement and start asynchronous verification. The
    /// outcome is delivered back on the coordination context.
    fn commence_redirect(&self, new: Box<dyn HttpChannel>, flags: RedirectFlags) {
        {
            let mut st = self.lock();
            st.phase = Phase::RedirectPending;
            st.redirect_channel = Some(new);
        }
        let ch = self.clone();
        tokio::spawn(async move {
            let result = ch.run_redirect_verify(flags).await;
            let ch2 = ch.clone();
            if !ch.inner.coordination.dispatch(move || ch2.on_redirect_verified(result)) {
                trace!("channel {}: coordination context gone", ch.inner.id);
            }
        });
    }

    async fn run_redirect_verify(&self, flags: RedirectFlags) -> Result<(), ChannelError> {
        let Some(verifier) = self.inner.collaborators.verifier.clone() else {
            return Ok(());
        };
        let new = {
            let mut st = self.lock();
            st.redirect_channel.take().ok_or(ChannelError::Aborted)?
        };
        let result = verifier.verify_redirect(self, new.as_ref(), flags).await;
        let mut st = self.lock();
        if !st.released && st.redirect_channel.is_none() {
            st.redirect_channel = Some(new);
        }
        result
    }

    pub(crate) fn on_redirect_verified(&self, result: Result<(), ChannelError>) {
        trace!(
            "channel {}: redirect verification finished: {result:?}",
            self.inner.id
        );
        match result.and_then(|_| self.open_redirect_channel()) {
            Ok(_) => {
                {
                    let mut st = self.lock();
                    st.is_pending = false;
                    st.phase = Phase::Completed;
                }
                self.release_collaborators();
            }
            Err(e) => {
                let _ = self.cancel_interception(e);
            }
        }
    }

    /// Open the verified replacement channel with this channel's listener.
    /// The listener is handed off even when open fails; the replacement
    /// owns the terminating notification from here on.
    fn open_redirect_channel(&self) -> Result<(), ChannelError> {
        let (mut new, listener, original) = {
            let mut st = self.lock();
            if st.status.is_failed() {
                return Err(st.status.to_error());
            }
            let new = st.redirect_channel.take().ok_or(ChannelError::Aborted)?;
            let listener = st.listener.take().ok_or(ChannelError::Aborted)?;
            let original = st
                .original_uri
                .clone()
                .unwrap_or_else(|| self.inner.uri.clone());
            (new, listener, original)
        };
        new.set_original_uri(original);
        let r = new.open(listener);
        if r.is_ok() {
            self.lock().status.set_redirected();
        }
        r
    }
}

impl HttpChannel for InterceptedHttpChannel {
    fn uri(&self) -> &Url {
        &self.inner.uri
    }

    fn supports_resume(&self) -> bool {
        true
    }

    fn resume_at(&mut self, start_pos: u64, entity_id: &str) -> Result<(), ChannelError> {
        InterceptedHttpChannel::resume_at(self, start_pos, entity_id)
    }

    fn set_original_uri(&mut self, uri: Url) {
        self.lock().original_uri = Some(uri);
    }

    fn apply_redirect_setup(&mut self, setup: &RedirectSetup) -> Result<(), ChannelError> {
        let mut st = self.lock();
        st.load = setup.load.clone();
        st.method = setup.method.clone().unwrap_or(Method::GET);
        Ok(())
    }

    fn open(self: Box<Self>, listener: Box<dyn StreamConsumer>) -> Result<(), ChannelError> {
        self.async_open(listener)
    }
}
