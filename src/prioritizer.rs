// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Selection of the stream that receives the next batch.

use crate::context::CallContext;
use crate::error::Error;
use crate::stream::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Availability bookkeeping driven by stream writers.
pub trait Prioritizer: Send + Sync {
    /// Marks the stream as ready for one batch. Must not block.
    fn set_ready(&self, stream: Arc<Stream>);

    /// Withdraws the stream. Once this returns, no caller can obtain the
    /// stream from the prioritizer.
    fn remove_ready(&self, stream: &Arc<Stream>);
}

/// Hands ready streams to callers in the order they became ready.
#[derive(Debug, Default)]
pub struct FifoPrioritizer {
    ready: Mutex<VecDeque<Arc<Stream>>>,
    notify: Notify,
    downgraded: CancellationToken,
}

impl FifoPrioritizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for a ready stream. Returns `Ok(None)` once the exporter has
    /// downgraded, or the caller's context error if it ends first.
    pub async fn next_stream(&self, cx: &CallContext) -> Result<Option<Arc<Stream>>, Error> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            _ = notified.as_mut().enable();

            if let Some(stream) = self.ready.lock().pop_front() {
                return Ok(Some(stream));
            }
            if self.downgraded.is_cancelled() {
                return Ok(None);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.downgraded.cancelled() => return Ok(None),
                err = cx.done() => return Err(err),
            }
        }
    }

    /// Stops handing out streams. Pending and future callers of
    /// [`FifoPrioritizer::next_stream`] receive `None`.
    pub fn downgrade(&self) {
        self.downgraded.cancel();
        self.ready.lock().clear();
    }

    pub fn is_downgraded(&self) -> bool {
        self.downgraded.is_cancelled()
    }

    /// Number of streams currently ready.
    pub fn ready_len(&self) -> usize {
        self.ready.lock().len()
    }
}

impl Prioritizer for FifoPrioritizer {
    fn set_ready(&self, stream: Arc<Stream>) {
        if self.downgraded.is_cancelled() {
            return;
        }
        {
            let mut ready = self.ready.lock();
            if ready.iter().any(|s| Arc::ptr_eq(s, &stream)) {
                return;
            }
            ready.push_back(stream);
        }
        self.notify.notify_one();
    }

    fn remove_ready(&self, stream: &Arc<Stream>) {
        self.ready.lock().retain(|s| !Arc::ptr_eq(s, stream));
    }
}
