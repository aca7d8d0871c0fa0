// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Telemetry payloads accepted by the stream and the producer that turns
//! them into Arrow batches.

use crate::error::EncodeError;
use crate::proto::BatchArrowRecords;
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use prost::Message;
use serde::{Deserialize, Serialize};

/// The telemetry signal carried by a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Traces,
    Logs,
    Metrics,
}

/// A batch of OTLP records submitted by a pipeline consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum Records {
    Traces(ExportTraceServiceRequest),
    Logs(ExportLogsServiceRequest),
    Metrics(ExportMetricsServiceRequest),
}

impl Records {
    pub fn signal(&self) -> SignalType {
        match self {
            Records::Traces(_) => SignalType::Traces,
            Records::Logs(_) => SignalType::Logs,
            Records::Metrics(_) => SignalType::Metrics,
        }
    }

    /// Size of the records in the OTLP protobuf encoding.
    ///
    /// The receiver measures a different value because the Arrow
    /// conversion optimizes the data.
    pub fn uncompressed_size(&self) -> usize {
        match self {
            Records::Traces(req) => req.encoded_len(),
            Records::Logs(req) => req.encoded_len(),
            Records::Metrics(req) => req.encoded_len(),
        }
    }

    /// Encodes the records with the producer entry point for their signal.
    pub fn encode_with(&self, producer: &mut dyn Producer) -> Result<BatchArrowRecords, EncodeError> {
        match self {
            Records::Traces(req) => producer.batch_arrow_records_from_traces(req),
            Records::Logs(req) => producer.batch_arrow_records_from_logs(req),
            Records::Metrics(req) => producer.batch_arrow_records_from_metrics(req),
        }
    }
}

impl From<ExportTraceServiceRequest> for Records {
    fn from(req: ExportTraceServiceRequest) -> Self {
        Records::Traces(req)
    }
}

impl From<ExportLogsServiceRequest> for Records {
    fn from(req: ExportLogsServiceRequest) -> Self {
        Records::Logs(req)
    }
}

impl From<ExportMetricsServiceRequest> for Records {
    fn from(req: ExportMetricsServiceRequest) -> Self {
        Records::Metrics(req)
    }
}

/// The Arrow codec.
///
/// A producer is stateful (it keeps the schemas and dictionaries already
/// sent on its stream) and is owned by exactly one stream. Batch ids are
/// assigned by the producer and must be unique among the batches in
/// flight on that stream.
pub trait Producer: Send {
    fn batch_arrow_records_from_traces(
        &mut self,
        traces: &ExportTraceServiceRequest,
    ) -> Result<BatchArrowRecords, EncodeError>;

    fn batch_arrow_records_from_logs(
        &mut self,
        logs: &ExportLogsServiceRequest,
    ) -> Result<BatchArrowRecords, EncodeError>;

    fn batch_arrow_records_from_metrics(
        &mut self,
        metrics: &ExportMetricsServiceRequest,
    ) -> Result<BatchArrowRecords, EncodeError>;
}
