// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Client side of the OTel-Arrow streaming protocol.
//!
//! Callers submit OTLP records and wait for the receiver's per-batch
//! acknowledgment. Each [`Stream`] owns one bidirectional gRPC call: a
//! writer task encodes records into Arrow batches and sends them, and a
//! reader matches acknowledgments to the callers waiting on them by batch
//! id. When a call ends for any reason, every caller still waiting is
//! released with [`Error::StreamRestarting`] so the retry policy can
//! resubmit on a fresh stream.
//!
//! [`Exporter`] runs a pool of streams against one endpoint and
//! downgrades to the non-streaming transport when the endpoint does not
//! implement the protocol.

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod exporter;
pub mod headers;
pub mod prioritizer;
pub mod proto;
pub mod records;
pub mod stream;
pub mod telemetry;

mod panic_guard;
mod waiters;

#[cfg(test)]
mod testing;

pub use client::{
    BatchSink, EstablishedCall, GrpcStreamClient, PerRpcCredentials, StatusSource, StreamClient,
    StreamMethod,
};
pub use config::Config;
pub use context::CallContext;
pub use error::{EncodeError, Error, RetryGuidance};
pub use exporter::{Exporter, ProducerFactory};
pub use headers::{decode_headers, HeaderEncoder};
pub use prioritizer::{FifoPrioritizer, Prioritizer};
pub use records::{Producer, Records, SignalType};
pub use stream::Stream;
pub use telemetry::{NetReporter, NoopNetReporter, SizesStruct, TelemetrySettings};
