// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The bidirectional call underneath a stream.
//!
//! An established call is split into its two directions so the writer
//! task and the reader can own one each. Both halves are bound to the
//! token passed to [`StreamClient::open`], the way a gRPC call is bound
//! to its context: canceling the token unblocks a pending send or
//! receive.

use crate::context::CallContext;
use crate::proto::{BatchArrowRecords, BatchStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::{MetadataKey, MetadataValue};
use tonic::transport::Channel;
use tonic::{Status, Streaming};

/// Opens bidirectional arrow calls.
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Establishes a call bound to `cancel`.
    async fn open(&self, cancel: CancellationToken) -> Result<EstablishedCall, Status>;
}

/// The two directions of an established call.
pub struct EstablishedCall {
    /// Full gRPC method name.
    pub method: String,
    pub sink: Box<dyn BatchSink>,
    pub source: Box<dyn StatusSource>,
}

/// Send direction of a call.
#[async_trait]
pub trait BatchSink: Send {
    async fn send(&mut self, batch: BatchArrowRecords) -> Result<(), Status>;

    /// Half-closes the call. Sending after this fails.
    fn close_send(&mut self);
}

/// Receive direction of a call.
#[async_trait]
pub trait StatusSource: Send {
    /// Returns the next acknowledgment, or `None` once the server has
    /// ended the call.
    async fn recv(&mut self) -> Result<Option<BatchStatus>, Status>;
}

/// Credentials that contribute metadata to every request.
///
/// Static call credentials only reach the stream-establishment request,
/// so per-request credentials travel in the batch headers instead.
#[async_trait]
pub trait PerRpcCredentials: Send + Sync {
    async fn request_metadata(
        &self,
        cx: &CallContext,
    ) -> Result<HashMap<String, String>, Box<dyn std::error::Error + Send + Sync>>;
}

/// The OTel-Arrow services a stream can be opened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMethod {
    /// One stream carrying every signal.
    #[default]
    Mixed,
    Traces,
    Logs,
    Metrics,
}

impl StreamMethod {
    pub fn path(self) -> &'static str {
        match self {
            StreamMethod::Mixed => {
                "/opentelemetry.proto.experimental.arrow.v1.ArrowStreamService/ArrowStream"
            }
            StreamMethod::Traces => {
                "/opentelemetry.proto.experimental.arrow.v1.ArrowTracesService/ArrowTraces"
            }
            StreamMethod::Logs => {
                "/opentelemetry.proto.experimental.arrow.v1.ArrowLogsService/ArrowLogs"
            }
            StreamMethod::Metrics => {
                "/opentelemetry.proto.experimental.arrow.v1.ArrowMetricsService/ArrowMetrics"
            }
        }
    }
}

/// Depth of the queue between the stream writer and the HTTP/2 body.
const OUTBOUND_BUFFER: usize = 1;

/// [`StreamClient`] over a tonic channel.
#[derive(Debug, Clone)]
pub struct GrpcStreamClient {
    channel: Channel,
    method: StreamMethod,
    headers: HashMap<String, String>,
}

impl GrpcStreamClient {
    pub fn new(channel: Channel, method: StreamMethod) -> Self {
        Self {
            channel,
            method,
            headers: HashMap::new(),
        }
    }

    /// Static headers sent when each stream is established.
    #[must_use]
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    fn request(
        &self,
        outbound: mpsc::Receiver<BatchArrowRecords>,
    ) -> Result<tonic::Request<ReceiverStream<BatchArrowRecords>>, Status> {
        let mut request = tonic::Request::new(ReceiverStream::new(outbound));
        for (key, value) in &self.headers {
            let key = MetadataKey::from_str(key)
                .map_err(|e| Status::invalid_argument(format!("header {key}: {e}")))?;
            let value = MetadataValue::try_from(value.as_str())
                .map_err(|e| Status::invalid_argument(format!("header value: {e}")))?;
            _ = request.metadata_mut().insert(key, value);
        }
        Ok(request)
    }
}

#[async_trait]
impl StreamClient for GrpcStreamClient {
    async fn open(&self, cancel: CancellationToken) -> Result<EstablishedCall, Status> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("service was not ready: {e}")))?;

        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let request = self.request(rx)?;
        let codec = tonic::codec::ProstCodec::<BatchArrowRecords, BatchStatus>::default();
        let path = PathAndQuery::from_static(self.method.path());

        let inbound = tokio::select! {
            _ = cancel.cancelled() => return Err(Status::cancelled("context canceled")),
            response = grpc.streaming(request, path, codec) => response?.into_inner(),
        };

        Ok(EstablishedCall {
            method: self.method.path().to_string(),
            sink: Box::new(GrpcSink {
                tx: Some(tx),
                cancel: cancel.clone(),
            }),
            source: Box::new(GrpcSource { inbound, cancel }),
        })
    }
}

struct GrpcSink {
    tx: Option<mpsc::Sender<BatchArrowRecords>>,
    cancel: CancellationToken,
}

#[async_trait]
impl BatchSink for GrpcSink {
    async fn send(&mut self, batch: BatchArrowRecords) -> Result<(), Status> {
        let Some(tx) = &self.tx else {
            return Err(Status::failed_precondition("send after close"));
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Status::cancelled("context canceled")),
            sent = tx.send(batch) => sent.map_err(|_| Status::unavailable("arrow stream closed by transport")),
        }
    }

    fn close_send(&mut self) {
        // Dropping the sender ends the request body.
        self.tx = None;
    }
}

struct GrpcSource {
    inbound: Streaming<BatchStatus>,
    cancel: CancellationToken,
}

#[async_trait]
impl StatusSource for GrpcSource {
    async fn recv(&mut self) -> Result<Option<BatchStatus>, Status> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Status::cancelled("context canceled")),
            msg = self.inbound.message() => msg,
        }
    }
}
