// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Correlation of in-flight batch ids with the callers waiting for them.

use crate::error::Error;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Delivers the outcome of one batch to its caller.
pub(crate) type ResultSender = oneshot::Sender<Result<(), Error>>;

/// Map from batch id to the caller's result sender.
///
/// The lock is held only for the map operation; results are delivered
/// after the sender has been removed.
#[derive(Debug, Default)]
pub(crate) struct BatchWaiters {
    waiters: Mutex<HashMap<i64, ResultSender>>,
}

impl BatchWaiters {
    /// Registers the caller of `batch_id`. Returns the sender this one
    /// displaced, if the id was already in flight.
    pub(crate) fn register(&self, batch_id: i64, tx: ResultSender) -> Option<ResultSender> {
        self.waiters.lock().insert(batch_id, tx)
    }

    /// Removes and returns the caller of `batch_id`.
    pub(crate) fn resolve_and_remove(&self, batch_id: i64) -> Option<ResultSender> {
        self.waiters.lock().remove(&batch_id)
    }

    /// Removes and returns every registered caller.
    pub(crate) fn drain_all(&self) -> Vec<(i64, ResultSender)> {
        self.waiters.lock().drain().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.lock().len()
    }
}
