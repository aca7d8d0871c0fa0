// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the arrow stream.

use tonic::Code;

/// Errors delivered to callers of the stream and returned by the stream loops.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// The producer could not encode the records. Permanent.
    #[error("encode: {0}")]
    Encode(#[source] EncodeError),

    /// The per-batch headers could not be HPACK-encoded. Permanent.
    #[error("hpack: {0}")]
    HeaderEncode(String),

    /// A structured gRPC status, either received on the stream or built
    /// from a batch acknowledgment.
    #[error(transparent)]
    Status(#[from] tonic::Status),

    /// The stream ended while the batch was in flight. Safe to retry on
    /// another stream.
    #[error("arrow stream is restarting")]
    StreamRestarting,

    /// The receiver acknowledged a batch this stream is not waiting for.
    #[error("process: unrecognized batch ID: {0}")]
    UnrecognizedBatchId(i64),

    /// The receiver sent a status code outside the recognized set.
    #[error("process: {}", .0.message())]
    UnexpectedStatus(tonic::Status),

    /// The per-RPC credentials could not produce request metadata.
    #[error("per-RPC credentials: {0}")]
    Credentials(String),

    /// The context was canceled.
    #[error("context canceled")]
    Canceled,

    /// The context deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The writer task ended abnormally.
    #[error("arrow stream writer failed: {0}")]
    Writer(String),

    /// The exporter configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors from the producer (the Arrow codec).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// The codec returned an error.
    #[error("{0}")]
    Codec(String),

    /// The codec panicked. The panic was recovered and its detail logged.
    #[error("panic in otel-arrow-adapter: {message}")]
    Panic {
        /// The panic payload, when it was a string.
        message: String,
    },
}

/// What an upstream retry policy should do with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryGuidance {
    /// The same data may be sent again.
    Retryable,
    /// Sending the same data again cannot succeed.
    NotRetryable,
    /// Retry is a matter of upstream configuration (resource exhaustion).
    PolicyDependent,
}

impl Error {
    /// Returns true for errors that indicate a local defect: the retry
    /// policy must drop the data rather than retry it.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::Encode(_) | Error::HeaderEncode(_))
    }

    /// Returns the gRPC code carried by this error, if any.
    pub fn code(&self) -> Option<Code> {
        match self {
            Error::Status(status) | Error::UnexpectedStatus(status) => Some(status.code()),
            _ => None,
        }
    }

    /// Classifies the error for the upstream retry policy.
    pub fn retry_guidance(&self) -> RetryGuidance {
        match self {
            Error::Encode(_) | Error::HeaderEncode(_) | Error::InvalidConfig(_) => {
                RetryGuidance::NotRetryable
            }
            Error::StreamRestarting
            | Error::UnrecognizedBatchId(_)
            | Error::Canceled
            | Error::DeadlineExceeded
            | Error::Writer(_) => RetryGuidance::Retryable,
            Error::Credentials(_) => RetryGuidance::NotRetryable,
            Error::Status(status) | Error::UnexpectedStatus(status) => {
                retry_guidance_for_code(status.code())
            }
        }
    }
}

/// Retry classification of gRPC codes.
pub fn retry_guidance_for_code(code: Code) -> RetryGuidance {
    match code {
        Code::Cancelled
        | Code::DeadlineExceeded
        | Code::Aborted
        | Code::OutOfRange
        | Code::Unavailable
        | Code::DataLoss => RetryGuidance::Retryable,
        Code::ResourceExhausted => RetryGuidance::PolicyDependent,
        _ => RetryGuidance::NotRetryable,
    }
}
