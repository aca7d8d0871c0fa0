// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! One OTel-Arrow stream: a writer task that encodes and sends batches,
//! a reader that demultiplexes acknowledgments, and the lifecycle that
//! releases every waiting caller when the stream ends.
//!
//! ```text
//!  send_and_wait ──▶ to_write (cap 1) ──▶ writer ──▶ BatchSink ──▶ receiver
//!        ▲                                  │
//!        │                           register(batch_id)
//!        │                                  ▼
//!        └──────── oneshot ◀──────── BatchWaiters ◀── reader ◀── StatusSource
//! ```

use crate::client::{BatchSink, EstablishedCall, PerRpcCredentials, StatusSource, StreamClient};
use crate::context::CallContext;
use crate::error::{EncodeError, Error};
use crate::headers::HeaderEncoder;
use crate::panic_guard::catch_codec_panic;
use crate::prioritizer::Prioritizer;
use crate::proto::{BatchArrowRecords, BatchStatus, StatusCode};
use crate::records::{Producer, Records};
use crate::telemetry::{SizesStruct, TelemetrySettings};
use crate::waiters::{BatchWaiters, ResultSender};
use opentelemetry::trace::{Status as SpanStatus, TraceContextExt, Tracer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use tracing::{debug, error, info, warn};

/// Name of the span around each batch send.
const SEND_SPAN_NAME: &str = "otel_arrow_stream_send";

/// Stream is 1:1 with a gRPC stream.
pub struct Stream {
    /// Graceful close before the server's max connection age; zero means
    /// unbounded.
    max_stream_lifetime: Duration,
    /// Exclusive to this stream.
    producer: Mutex<Box<dyn Producer>>,
    prioritizer: Arc<dyn Prioritizer>,
    per_rpc_credentials: Option<Arc<dyn PerRpcCredentials>>,
    telemetry: Arc<TelemetrySettings>,
    /// Set once the call is established; cleared if the endpoint does not
    /// implement the protocol. Unset at the end of `run` signals downgrade.
    established: AtomicBool,
    method: OnceLock<String>,
    to_write_tx: flume::Sender<WriteItem>,
    to_write_rx: flume::Receiver<WriteItem>,
    waiters: BatchWaiters,
    /// Canceled once `run` has released every waiter. Submissions that
    /// reach a finished stream are answered with `finish_cause`.
    finished: CancellationToken,
    finish_cause: OnceLock<Error>,
}

/// A batch passed from a caller to the writer, which is not bound by the
/// caller's context.
struct WriteItem {
    records: Records,
    /// Caller metadata, carried in the batch headers.
    md: Option<HashMap<String, String>>,
    result_tx: ResultSender,
    /// Computed in the caller's task; zero when not measured.
    uncomp_size: usize,
    /// Parent of the send span.
    parent: opentelemetry::Context,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("max_stream_lifetime", &self.max_stream_lifetime)
            .field("established", &self.is_established())
            .field("method", &self.method.get())
            .field("in_flight", &self.waiters.len())
            .finish_non_exhaustive()
    }
}

impl Stream {
    pub fn new(
        producer: Box<dyn Producer>,
        prioritizer: Arc<dyn Prioritizer>,
        telemetry: Arc<TelemetrySettings>,
        per_rpc_credentials: Option<Arc<dyn PerRpcCredentials>>,
    ) -> Self {
        let (to_write_tx, to_write_rx) = flume::bounded(1);
        Self {
            max_stream_lifetime: Duration::ZERO,
            producer: Mutex::new(producer),
            prioritizer,
            per_rpc_credentials,
            telemetry,
            established: AtomicBool::new(false),
            method: OnceLock::new(),
            to_write_tx,
            to_write_rx,
            waiters: BatchWaiters::default(),
            finished: CancellationToken::new(),
            finish_cause: OnceLock::new(),
        }
    }

    /// Closes the stream from the client side after `lifetime`.
    #[must_use]
    pub fn with_max_stream_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_stream_lifetime = lifetime;
        self
    }

    /// True while the endpoint is known to accept the protocol.
    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    /// The gRPC method, once established.
    pub fn method(&self) -> Option<&str> {
        self.method.get().map(String::as_str)
    }

    /// Number of batches sent and not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.waiters.len()
    }

    /// Runs the stream until both directions have finished. Errors are
    /// logged, and every caller still waiting receives
    /// [`Error::StreamRestarting`].
    pub async fn run(self: Arc<Self>, parent: CancellationToken, client: &dyn StreamClient) {
        let cancel = parent.child_token();
        let _cancel_on_exit = cancel.clone().drop_guard();

        let EstablishedCall {
            method,
            sink,
            mut source,
        } = match client.open(cancel.clone()).await {
            Ok(call) => call,
            Err(status) => {
                // Returning unestablished tells the controller this
                // endpoint has no arrow service. When every stream
                // returns this way the exporter downgrades.
                if status.code() == Code::Unimplemented {
                    info!(reason = status.message(), "arrow is not supported");
                } else {
                    error!(error = %status, "cannot start arrow stream");
                }
                self.finish(&parent);
                return;
            }
        };
        _ = self.method.set(method);
        self.established.store(true, Ordering::Release);

        let writer = {
            let stream = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = stream.write(&cancel, sink).await;
                if result.is_err() {
                    cancel.cancel();
                }
                result
            })
        };

        // The reader's result is handled after the writer has finished,
        // so a late Unimplemented can still clear `established`.
        let read_result = self.read(source.as_mut()).await;

        // Every batch the writer registers must be in the table before
        // the sweep below.
        cancel.cancel();
        let write_result = match writer.await {
            Ok(result) => result,
            Err(join_err) => Err(Error::Writer(join_err.to_string())),
        };

        match read_result {
            Ok(()) => debug!(which = "reader", reason = "EOF", "arrow stream shutdown"),
            Err(Error::Status(status)) if status.code() == Code::Unimplemented => {
                self.established.store(false, Ordering::Release);
                info!(reason = status.message(), "arrow is not supported");
            }
            Err(err) => log_stream_error("reader", &err),
        }
        if let Err(err) = write_result {
            log_stream_error("writer", &err);
        }

        // Both directions are finished; the upstream retry policy
        // resubmits whatever was in flight.
        for (batch_id, tx) in self.waiters.drain_all() {
            debug!(batch_id, "releasing waiter of restarting stream");
            _ = tx.send(Err(Error::StreamRestarting));
        }
        self.finish(&parent);
    }

    fn finish(&self, parent: &CancellationToken) {
        let cause = if parent.is_cancelled() {
            Error::Canceled
        } else {
            Error::StreamRestarting
        };
        _ = self.finish_cause.set(cause);
        self.finished.cancel();
    }

    fn finish_error(&self) -> Error {
        self.finish_cause
            .get()
            .cloned()
            .unwrap_or(Error::StreamRestarting)
    }

    /// Repeatedly offers this stream to the prioritizer and sends the
    /// batch it is handed. The send direction is closed on exit.
    async fn write(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        mut sink: Box<dyn BatchSink>,
    ) -> Result<(), Error> {
        let result = self.write_batches(cancel, sink.as_mut()).await;
        sink.close_send();
        result
    }

    async fn write_batches(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        sink: &mut dyn BatchSink,
    ) -> Result<(), Error> {
        let mut headers = HeaderEncoder::new();

        let lifetime = self.max_stream_lifetime;
        let expired = async move {
            if lifetime.is_zero() {
                std::future::pending::<()>().await;
            } else {
                tokio::time::sleep(lifetime).await;
            }
        };
        tokio::pin!(expired);

        loop {
            // Never blocks; the ready set is unbounded and this stream
            // appears in it at most once.
            self.prioritizer.set_ready(Arc::clone(self));

            let item = tokio::select! {
                _ = &mut expired => {
                    self.prioritizer.remove_ready(self);
                    debug!(lifetime = ?lifetime, "arrow stream reached max lifetime");
                    return Ok(());
                }
                item = self.to_write_rx.recv_async() => match item {
                    Ok(item) => item,
                    Err(_) => return Ok(()),
                },
                _ = cancel.cancelled() => {
                    // The stream is still in the ready set and a caller
                    // may be about to take it; remove it before leaving.
                    self.prioritizer.remove_ready(self);
                    return Err(Error::Canceled);
                }
            };

            // A dequeued stream is out of the ready set, so an error here
            // races with no sender.
            self.encode_and_send(item, &mut headers, sink).await?;
        }
    }

    async fn encode_and_send(
        &self,
        item: WriteItem,
        headers: &mut HeaderEncoder,
        sink: &mut dyn BatchSink,
    ) -> Result<(), Error> {
        let span = self
            .telemetry
            .tracer
            .start_with_context(SEND_SPAN_NAME, &item.parent);
        let cx = item.parent.clone().with_span(span);

        let result = self.encode_and_send_in(&cx, item, headers, sink).await;
        if let Err(err) = &result {
            cx.span().set_status(SpanStatus::error(err.to_string()));
        }
        cx.span().end();
        result
    }

    async fn encode_and_send_in(
        &self,
        cx: &opentelemetry::Context,
        item: WriteItem,
        headers: &mut HeaderEncoder,
        sink: &mut dyn BatchSink,
    ) -> Result<(), Error> {
        let WriteItem {
            records,
            mut md,
            result_tx,
            uncomp_size,
            parent: _,
        } = item;

        // A propagator without fields injects nothing; skip the
        // allocation.
        if let Some(propagator) = &self.telemetry.propagator {
            if propagator.fields().next().is_some() {
                propagator.inject_context(cx, md.get_or_insert_with(HashMap::new));
            }
        }

        let mut batch = match self.encode(&records) {
            Ok(batch) => batch,
            Err(err) => {
                // A local defect: restart the stream, and do not let the
                // caller retry the same data.
                let err = Error::Encode(err);
                _ = result_tx.send(Err(err.clone()));
                return Err(err);
            }
        };

        if let Some(md) = md.as_ref().filter(|md| !md.is_empty()) {
            match headers.encode(md) {
                Ok(block) => batch.headers = block,
                Err(err) => {
                    let err = Error::HeaderEncode(err.to_string());
                    _ = result_tx.send(Err(err.clone()));
                    return Err(err);
                }
            }
        }

        // Registered before the send so the acknowledgment always finds it.
        if let Some(displaced) = self.waiters.register(batch.batch_id, result_tx) {
            warn!(batch_id = batch.batch_id, "duplicate batch ID in flight");
            _ = displaced.send(Err(Error::StreamRestarting));
        }

        // Uncompressed size is unreliable for arrow at the transport
        // level, so the send direction is instrumented here.
        if uncomp_size != 0 {
            let sized = SizesStruct {
                method: self.method().unwrap_or_default().to_string(),
                length: i64::try_from(uncomp_size).unwrap_or(i64::MAX),
            };
            self.telemetry.net_reporter.count_send(&sized);
            self.telemetry
                .net_reporter
                .set_span_size_attributes(cx, &sized);
        }

        // The waiter is released by the lifecycle sweep if this fails.
        // Not wrapped: the status code must survive.
        sink.send(batch).await.map_err(Error::Status)
    }

    /// Encodes the records, recovering a codec panic.
    fn encode(&self, records: &Records) -> Result<BatchArrowRecords, EncodeError> {
        let mut producer = self.producer.lock();
        match catch_codec_panic(|| records.encode_with(producer.as_mut())) {
            Ok(result) => result,
            Err(detail) => {
                debug!(
                    recovered = %detail.message,
                    location = detail.location.as_deref().unwrap_or("unknown"),
                    stacktrace = %detail.backtrace,
                    "panic detail in otel-arrow-adapter"
                );
                Err(EncodeError::Panic {
                    message: detail.message,
                })
            }
        }
    }

    /// Reads acknowledgments and releases their callers until the call
    /// ends. `Ok(())` means the server ended the call.
    async fn read(&self, source: &mut dyn StatusSource) -> Result<(), Error> {
        // TODO: after close_send, stop reading once no batch is in flight
        // instead of waiting for the server or a transport timeout.
        while let Some(status) = source.recv().await? {
            self.process_batch_status(status)?;
        }
        Ok(())
    }

    /// Releases the caller of one batch. Returns an error when the status
    /// breaks the stream.
    fn process_batch_status(&self, ss: BatchStatus) -> Result<(), Error> {
        let Some(tx) = self.waiters.resolve_and_remove(ss.batch_id) else {
            return Err(Error::UnrecognizedBatchId(ss.batch_id));
        };

        let id = ss.batch_id;
        let msg = ss.status_message;
        let status = match StatusCode::try_from(ss.status_code) {
            Ok(StatusCode::Ok) => {
                _ = tx.send(Ok(()));
                return Ok(());
            }
            Ok(StatusCode::Unavailable) => {
                Status::unavailable(format!("destination unavailable: {id}: {msg}"))
            }
            Ok(StatusCode::InvalidArgument) => {
                Status::invalid_argument(format!("invalid argument: {id}: {msg}"))
            }
            Ok(StatusCode::ResourceExhausted) => {
                Status::resource_exhausted(format!("resource exhausted: {id}: {msg}"))
            }
            // Receivers once answered Canceled after close_send; that and
            // every other code is a protocol error.
            _ => {
                let status = Status::internal(format!("unexpected stream response: {id}: {msg}"));
                _ = tx.send(Err(Error::Status(status.clone())));
                return Err(Error::UnexpectedStatus(status));
            }
        };
        _ = tx.send(Err(Error::Status(status)));
        Ok(())
    }

    /// Submits records to be encoded and sent, then waits for the
    /// acknowledgment or for the caller's context to end.
    pub async fn send_and_wait(&self, cx: &CallContext, records: Records) -> Result<(), Error> {
        let md = request_metadata(self.per_rpc_credentials.as_deref(), cx).await?;
        let (item, result_rx) = self.write_item(cx, records, md);

        tokio::select! {
            biased;
            err = cx.done() => return Err(err),
            _ = self.finished.cancelled() => return Err(self.finish_error()),
            sent = self.to_write_tx.send_async(item) => {
                if sent.is_err() {
                    return Err(Error::StreamRestarting);
                }
            }
        }
        self.wait_for_result(cx, result_rx).await
    }

    /// Submits records on a stream the caller took from the ready set.
    ///
    /// The item is enqueued whatever the state of the caller's context:
    /// the writer is waiting for exactly one item and is not ready again
    /// until it gets one.
    pub(crate) async fn send_claimed(
        &self,
        cx: &CallContext,
        records: Records,
        md: Option<HashMap<String, String>>,
    ) -> Result<(), Error> {
        let (item, result_rx) = self.write_item(cx, records, md);

        tokio::select! {
            biased;
            _ = self.finished.cancelled() => return Err(self.finish_error()),
            sent = self.to_write_tx.send_async(item) => {
                if sent.is_err() {
                    return Err(Error::StreamRestarting);
                }
            }
        }
        self.wait_for_result(cx, result_rx).await
    }

    fn write_item(
        &self,
        cx: &CallContext,
        records: Records,
        md: Option<HashMap<String, String>>,
    ) -> (WriteItem, oneshot::Receiver<Result<(), Error>>) {
        let uncomp_size = if self.telemetry.detailed_metrics {
            records.uncompressed_size()
        } else {
            0
        };
        let (result_tx, result_rx) = oneshot::channel();
        let item = WriteItem {
            records,
            md,
            result_tx,
            uncomp_size,
            parent: cx.parent().clone(),
        };
        (item, result_rx)
    }

    async fn wait_for_result(
        &self,
        cx: &CallContext,
        result_rx: oneshot::Receiver<Result<(), Error>>,
    ) -> Result<(), Error> {
        tokio::select! {
            biased;
            // A dropped sender means the stream went away without an
            // answer; that is a restart like any other.
            result = result_rx => result.unwrap_or(Err(Error::StreamRestarting)),
            err = cx.done() => Err(err),
            // The item is still queued on a stream that will never read it.
            _ = self.finished.cancelled() => Err(self.finish_error()),
        }
    }
}

/// Fetches per-request metadata. Static headers only reach the
/// stream-establishment request; whatever a unary call would carry rides
/// in the batch headers.
pub(crate) async fn request_metadata(
    credentials: Option<&dyn PerRpcCredentials>,
    cx: &CallContext,
) -> Result<Option<HashMap<String, String>>, Error> {
    let Some(credentials) = credentials else {
        return Ok(None);
    };
    credentials
        .request_metadata(cx)
        .await
        .map(Some)
        .map_err(|e| Error::Credentials(e.to_string()))
}

/// Logs a terminal error of one direction. `which` is "reader" or "writer".
fn log_stream_error(which: &str, err: &Error) {
    // Canceled means intentional shutdown, for normal reasons (max
    // lifetime) or because the other direction failed.
    let (code, message) = match err {
        Error::Status(status) => (status.code(), status.message().to_string()),
        Error::Canceled => (Code::Cancelled, err.to_string()),
        _ => (Code::Internal, err.to_string()),
    };
    if code == Code::Cancelled {
        debug!(which, reason = %message, "arrow stream shutdown");
    } else {
        error!(which, reason = %message, code = code as i32, "arrow stream error");
    }
}
