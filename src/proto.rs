// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Envelope messages of the OTel-Arrow streaming protocol.
//!
//! Only the envelope is described here: the Arrow IPC bytes inside each
//! [`ArrowPayload`] are produced and consumed by the codec and are opaque
//! to the stream.

use bytes::Bytes;

/// A batch of Arrow records sent from the exporter to the receiver.
#[derive(Clone, PartialEq, prost::Message)]
pub struct BatchArrowRecords {
    /// Identifier assigned by the producer, unique among the batches in
    /// flight on one stream.
    #[prost(int64, tag = "1")]
    pub batch_id: i64,
    /// Encoded Arrow record batches, one per payload type.
    #[prost(message, repeated, tag = "2")]
    pub arrow_payloads: Vec<ArrowPayload>,
    /// HPACK-encoded per-batch headers.
    #[prost(bytes = "bytes", tag = "3")]
    pub headers: Bytes,
}

/// One Arrow IPC stream fragment.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ArrowPayload {
    #[prost(string, tag = "1")]
    pub schema_id: String,
    #[prost(enumeration = "ArrowPayloadType", tag = "2")]
    pub r#type: i32,
    #[prost(bytes = "bytes", tag = "3")]
    pub record: Bytes,
}

/// Table kind carried by an [`ArrowPayload`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ArrowPayloadType {
    Unknown = 0,
    ResourceAttrs = 1,
    ScopeAttrs = 2,
    UnivariateMetrics = 10,
    Logs = 30,
    LogAttrs = 31,
    Spans = 40,
    SpanAttrs = 41,
}

/// Per-batch acknowledgment sent by the receiver.
#[derive(Clone, PartialEq, prost::Message)]
pub struct BatchStatus {
    #[prost(int64, tag = "1")]
    pub batch_id: i64,
    /// Raw [`StatusCode`] value. Unknown values are kept as-is so they can
    /// be reported as protocol errors instead of silently defaulting.
    #[prost(enumeration = "StatusCode", tag = "2")]
    pub status_code: i32,
    #[prost(string, tag = "3")]
    pub status_message: String,
}

impl BatchStatus {
    /// Builds a status for `batch_id` with the given code and message.
    pub fn new(batch_id: i64, code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            batch_id,
            status_code: code as i32,
            status_message: message.into(),
        }
    }
}

/// Acknowledgment status codes. The values match the gRPC codes of the
/// same name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    Canceled = 1,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    Aborted = 10,
    Internal = 13,
    Unavailable = 14,
    Unauthenticated = 16,
}
