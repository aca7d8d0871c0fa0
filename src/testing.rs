// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Fakes shared by the unit tests: a producer, an in-process endpoint
//! standing in for the gRPC transport, and OTLP fixtures.

use crate::client::{BatchSink, EstablishedCall, PerRpcCredentials, StatusSource, StreamClient};
use crate::context::CallContext;
use crate::error::EncodeError;
use crate::prioritizer::FifoPrioritizer;
use crate::proto::{ArrowPayload, ArrowPayloadType, BatchArrowRecords, BatchStatus};
use crate::records::{Producer, SignalType};
use crate::stream::Stream;
use crate::telemetry::{NetReporter, SizesStruct, TelemetrySettings};
use async_trait::async_trait;
use bytes::Bytes;
use opentelemetry::propagation::text_map_propagator::FieldIter;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue};
use opentelemetry_proto::tonic::logs::v1::{LogRecord, ResourceLogs, ScopeLogs};
use opentelemetry_proto::tonic::metrics::v1::{
    metric, number_data_point, Gauge, Metric, NumberDataPoint, ResourceMetrics, ScopeMetrics,
};
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};
use parking_lot::Mutex;
use prost::Message;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;

/// Method reported by calls of the fake endpoint.
pub(crate) const FAKE_METHOD: &str = "/fake.ArrowService/ArrowStream";

enum Failure {
    Error(String),
    Panic(String),
}

/// Producer that wraps the OTLP bytes in a single payload.
#[derive(Default)]
pub(crate) struct FakeProducer {
    ids: VecDeque<i64>,
    next_id: i64,
    failure: Option<Failure>,
    signals: Vec<SignalType>,
}

impl FakeProducer {
    /// Assigns `ids` in order, then continues after the largest one.
    pub(crate) fn with_ids(ids: impl IntoIterator<Item = i64>) -> Self {
        let ids: VecDeque<i64> = ids.into_iter().collect();
        let next_id = ids.iter().copied().max().unwrap_or(0);
        Self {
            ids,
            next_id,
            ..Self::default()
        }
    }

    pub(crate) fn fail_with(mut self, message: &str) -> Self {
        self.failure = Some(Failure::Error(message.to_string()));
        self
    }

    pub(crate) fn panic_with(mut self, message: &str) -> Self {
        self.failure = Some(Failure::Panic(message.to_string()));
        self
    }

    pub(crate) fn encoded_signals(&self) -> Vec<SignalType> {
        self.signals.clone()
    }

    fn produce(
        &mut self,
        signal: SignalType,
        payload_type: ArrowPayloadType,
        record: Vec<u8>,
    ) -> Result<BatchArrowRecords, EncodeError> {
        self.signals.push(signal);
        match &self.failure {
            Some(Failure::Error(message)) => return Err(EncodeError::Codec(message.clone())),
            Some(Failure::Panic(message)) => panic!("{message}"),
            None => {}
        }
        let batch_id = self.ids.pop_front().unwrap_or_else(|| {
            self.next_id += 1;
            self.next_id
        });
        Ok(BatchArrowRecords {
            batch_id,
            arrow_payloads: vec![ArrowPayload {
                schema_id: format!("{signal:?}"),
                r#type: payload_type as i32,
                record: Bytes::from(record),
            }],
            headers: Bytes::new(),
        })
    }
}

impl Producer for FakeProducer {
    fn batch_arrow_records_from_traces(
        &mut self,
        traces: &ExportTraceServiceRequest,
    ) -> Result<BatchArrowRecords, EncodeError> {
        self.produce(
            SignalType::Traces,
            ArrowPayloadType::Spans,
            traces.encode_to_vec(),
        )
    }

    fn batch_arrow_records_from_logs(
        &mut self,
        logs: &ExportLogsServiceRequest,
    ) -> Result<BatchArrowRecords, EncodeError> {
        self.produce(SignalType::Logs, ArrowPayloadType::Logs, logs.encode_to_vec())
    }

    fn batch_arrow_records_from_metrics(
        &mut self,
        metrics: &ExportMetricsServiceRequest,
    ) -> Result<BatchArrowRecords, EncodeError> {
        self.produce(
            SignalType::Metrics,
            ArrowPayloadType::UnivariateMetrics,
            metrics.encode_to_vec(),
        )
    }
}

/// Endpoint whose calls are served by the test through [`FakeServer`].
pub(crate) struct FakeClient {
    accepted: mpsc::UnboundedSender<FakeServer>,
}

/// Receives the server side of every call opened on a [`FakeClient`].
pub(crate) struct FakeAcceptor {
    accepted: mpsc::UnboundedReceiver<FakeServer>,
}

pub(crate) fn fake_endpoint() -> (FakeClient, FakeAcceptor) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FakeClient { accepted: tx }, FakeAcceptor { accepted: rx })
}

impl FakeAcceptor {
    /// Waits for the next call.
    pub(crate) async fn accept(&mut self) -> FakeServer {
        self.accepted
            .recv()
            .await
            .expect("fake client dropped before a call was opened")
    }
}

#[async_trait]
impl StreamClient for FakeClient {
    async fn open(&self, cancel: CancellationToken) -> Result<EstablishedCall, Status> {
        if cancel.is_cancelled() {
            return Err(Status::cancelled("context canceled"));
        }
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        self.accepted
            .send(FakeServer {
                batches: batch_rx,
                statuses: Some(status_tx),
            })
            .map_err(|_| Status::unavailable("fake endpoint is gone"))?;
        Ok(EstablishedCall {
            method: FAKE_METHOD.to_string(),
            sink: Box::new(FakeSink {
                tx: Some(batch_tx),
                cancel: cancel.clone(),
            }),
            source: Box::new(FakeSource {
                rx: status_rx,
                cancel,
            }),
        })
    }
}

/// Server side of one fake call.
pub(crate) struct FakeServer {
    batches: mpsc::UnboundedReceiver<BatchArrowRecords>,
    statuses: Option<mpsc::UnboundedSender<Result<BatchStatus, Status>>>,
}

impl FakeServer {
    /// Next batch sent by the client, or `None` once it closed its side.
    pub(crate) async fn next_batch(&mut self) -> Option<BatchArrowRecords> {
        self.batches.recv().await
    }

    pub(crate) fn reply(&self, status: BatchStatus) {
        if let Some(tx) = &self.statuses {
            _ = tx.send(Ok(status));
        }
    }

    /// Ends the call with an error.
    pub(crate) fn fail(&mut self, status: Status) {
        if let Some(tx) = self.statuses.take() {
            _ = tx.send(Err(status));
        }
    }

    /// Ends the call cleanly.
    pub(crate) fn close(&mut self) {
        self.statuses = None;
    }
}

struct FakeSink {
    tx: Option<mpsc::UnboundedSender<BatchArrowRecords>>,
    cancel: CancellationToken,
}

#[async_trait]
impl BatchSink for FakeSink {
    async fn send(&mut self, batch: BatchArrowRecords) -> Result<(), Status> {
        if self.cancel.is_cancelled() {
            return Err(Status::cancelled("context canceled"));
        }
        let Some(tx) = &self.tx else {
            return Err(Status::failed_precondition("send after close"));
        };
        tx.send(batch)
            .map_err(|_| Status::unavailable("fake server is gone"))
    }

    fn close_send(&mut self) {
        self.tx = None;
    }
}

struct FakeSource {
    rx: mpsc::UnboundedReceiver<Result<BatchStatus, Status>>,
    cancel: CancellationToken,
}

#[async_trait]
impl StatusSource for FakeSource {
    async fn recv(&mut self) -> Result<Option<BatchStatus>, Status> {
        tokio::select! {
            biased;
            msg = self.rx.recv() => msg.transpose(),
            _ = self.cancel.cancelled() => Err(Status::cancelled("context canceled")),
        }
    }
}

/// Endpoint that refuses every call.
pub(crate) struct FailingClient {
    status: Status,
    opens: AtomicUsize,
}

impl FailingClient {
    pub(crate) fn new(status: Status) -> Self {
        Self {
            status,
            opens: AtomicUsize::new(0),
        }
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StreamClient for FailingClient {
    async fn open(&self, _cancel: CancellationToken) -> Result<EstablishedCall, Status> {
        _ = self.opens.fetch_add(1, Ordering::Relaxed);
        Err(self.status.clone())
    }
}

/// Endpoint whose calls never complete establishment.
pub(crate) struct StalledClient;

#[async_trait]
impl StreamClient for StalledClient {
    async fn open(&self, cancel: CancellationToken) -> Result<EstablishedCall, Status> {
        cancel.cancelled().await;
        Err(Status::cancelled("context canceled"))
    }
}

/// Records every reported send.
#[derive(Default)]
pub(crate) struct RecordingNetReporter {
    sent: Mutex<Vec<SizesStruct>>,
}

impl RecordingNetReporter {
    pub(crate) fn sent(&self) -> Vec<SizesStruct> {
        self.sent.lock().clone()
    }
}

impl NetReporter for RecordingNetReporter {
    fn count_send(&self, sized: &SizesStruct) {
        self.sent.lock().push(sized.clone());
    }
}

/// Credentials returning fixed metadata, or a fixed failure.
pub(crate) struct StaticCredentials {
    result: Result<HashMap<String, String>, String>,
}

impl StaticCredentials {
    pub(crate) fn new<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            result: Ok(pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()),
        }
    }

    pub(crate) fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
        }
    }
}

#[async_trait]
impl PerRpcCredentials for StaticCredentials {
    async fn request_metadata(
        &self,
        _cx: &CallContext,
    ) -> Result<HashMap<String, String>, Box<dyn std::error::Error + Send + Sync>> {
        self.result.clone().map_err(Into::into)
    }
}

/// Credentials that forward the caller's client metadata.
pub(crate) struct ForwardingCredentials;

#[async_trait]
impl PerRpcCredentials for ForwardingCredentials {
    async fn request_metadata(
        &self,
        cx: &CallContext,
    ) -> Result<HashMap<String, String>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(cx.metadata().clone())
    }
}

/// Propagator writing one fixed value under each of its fields.
#[derive(Debug)]
pub(crate) struct FieldsPropagator {
    fields: Vec<String>,
    value: String,
}

impl FieldsPropagator {
    pub(crate) fn new(field: &str, value: &str) -> Self {
        Self {
            fields: vec![field.to_string()],
            value: value.to_string(),
        }
    }

    /// A propagator that declares no fields.
    pub(crate) fn empty() -> Self {
        Self {
            fields: Vec::new(),
            value: String::new(),
        }
    }
}

impl TextMapPropagator for FieldsPropagator {
    fn inject_context(&self, _cx: &opentelemetry::Context, injector: &mut dyn Injector) {
        for field in &self.fields {
            injector.set(field, self.value.clone());
        }
    }

    fn extract_with_context(
        &self,
        cx: &opentelemetry::Context,
        _extractor: &dyn Extractor,
    ) -> opentelemetry::Context {
        cx.clone()
    }

    fn fields(&self) -> FieldIter<'_> {
        FieldIter::new(&self.fields)
    }
}

/// A stream that is never run.
pub(crate) fn test_stream(prioritizer: Arc<FifoPrioritizer>) -> Arc<Stream> {
    Arc::new(Stream::new(
        Box::new(FakeProducer::default()),
        prioritizer,
        Arc::new(TelemetrySettings::default()),
        None,
    ))
}

pub(crate) fn test_traces(spans: usize) -> ExportTraceServiceRequest {
    let spans = (0..spans)
        .map(|i| Span {
            trace_id: vec![1; 16],
            span_id: (i as u64 + 1).to_be_bytes().to_vec(),
            name: format!("span-{i}"),
            start_time_unix_nano: 1_700_000_000_000_000_000,
            end_time_unix_nano: 1_700_000_000_000_001_000,
            ..Default::default()
        })
        .collect();
    ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            scope_spans: vec![ScopeSpans {
                spans,
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

pub(crate) fn test_logs(records: usize) -> ExportLogsServiceRequest {
    let log_records = (0..records)
        .map(|i| LogRecord {
            time_unix_nano: 1_700_000_000_000_000_000,
            severity_text: "INFO".into(),
            body: Some(AnyValue {
                value: Some(any_value::Value::StringValue(format!("record {i}"))),
            }),
            ..Default::default()
        })
        .collect();
    ExportLogsServiceRequest {
        resource_logs: vec![ResourceLogs {
            scope_logs: vec![ScopeLogs {
                log_records,
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

pub(crate) fn test_metrics(points: usize) -> ExportMetricsServiceRequest {
    let data_points = (0..points)
        .map(|i| NumberDataPoint {
            time_unix_nano: 1_700_000_000_000_000_000,
            value: Some(number_data_point::Value::AsInt(i as i64)),
            ..Default::default()
        })
        .collect();
    ExportMetricsServiceRequest {
        resource_metrics: vec![ResourceMetrics {
            scope_metrics: vec![ScopeMetrics {
                metrics: vec![Metric {
                    name: "queue_size".into(),
                    data: Some(metric::Data::Gauge(Gauge { data_points })),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}
