/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ic-channel project authors.
 */

use std::sync::atomic::Ordering;

use crate::channel::InterceptedHttpChannel;

impl InterceptedHttpChannel {
    /// Report transfer status and progress to the attached sink.
    ///
    /// Reports always run on the coordination context. A call from any
    /// other context schedules at most one pending hop over there, so a
    /// fast body stream coalesces into however many reports the context
    /// can actually drain. The byte counter is read after the in-flight
    /// flag is cleared; progress arriving between those two points gets
    /// picked up by the report that follows it.
    pub(crate) fn maybe_report_status_and_progress(&self) {
        let coordination = &self.inner.coordination;
        if !coordination.is_current() {
            if self.inner.reporting_in_flight.swap(true, Ordering::AcqRel) {
                return;
            }
            let ch = self.clone();
            if !coordination.dispatch(move || ch.maybe_report_status_and_progress()) {
                self.inner.reporting_in_flight.store(false, Ordering::Release);
            }
            return;
        }
        self.inner.reporting_in_flight.store(false, Ordering::Release);
        let progress = self.inner.progress.load(Ordering::Acquire);

        if self.is_canceled() {
            return;
        }
        let (sink, total, host) = {
            let mut st = self.lock();
            if st.released || st.load.background || st.progress_sink.is_none() {
                return;
            }
            if progress <= st.last_reported {
                return;
            }
            st.last_reported = progress;
            let host = match &st.status_host {
                Some(h) => h.clone(),
                None => {
                    // resolved once; the request URI never changes on this
                    // channel after open
                    let h = self.inner.uri.host_str().unwrap_or_default().to_string();
                    st.status_host = Some(h.clone());
                    h
                }
            };
            (st.progress_sink.take(), st.content_length, host)
        };
        let Some(mut sink) = sink else {
            return;
        };
        sink.on_status(&host);
        sink.on_progress(progress, total);
        let mut st = self.lock();
        if !st.released && st.progress_sink.is_none() {
            st.progress_sink = Some(sink);
        }
    }
}
