// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Telemetry handed to each stream at construction.

use opentelemetry::global::BoxedTracer;
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::noop::NoopTracer;
use opentelemetry::trace::TraceContextExt;
use opentelemetry::KeyValue;
use std::fmt;
use std::sync::Arc;

/// Name of the instrumentation scope used for stream spans.
pub const TRACER_NAME: &str = "otel-arrow-exporter";

/// Span attribute carrying the uncompressed request size.
pub const UNCOMPRESSED_SIZE_ATTRIBUTE: &str = "stream_client_uncompressed_request_size";

/// Sizes reported for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SizesStruct {
    /// gRPC method of the stream.
    pub method: String,
    /// Uncompressed length in bytes.
    pub length: i64,
}

/// Network-level metrics for the send direction.
pub trait NetReporter: Send + Sync {
    fn count_send(&self, sized: &SizesStruct);

    fn set_span_size_attributes(&self, cx: &opentelemetry::Context, sized: &SizesStruct) {
        cx.span()
            .set_attribute(KeyValue::new(UNCOMPRESSED_SIZE_ATTRIBUTE, sized.length));
    }
}

/// Reporter that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNetReporter;

impl NetReporter for NoopNetReporter {
    fn count_send(&self, _sized: &SizesStruct) {}
}

/// Explicit telemetry dependencies of the exporter.
pub struct TelemetrySettings {
    pub tracer: BoxedTracer,
    /// Injects trace context into batch headers when set.
    pub propagator: Option<Arc<dyn TextMapPropagator + Send + Sync>>,
    pub net_reporter: Arc<dyn NetReporter>,
    /// Measure uncompressed sizes in the caller. Costs one protobuf size
    /// computation per batch.
    pub detailed_metrics: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            tracer: BoxedTracer::new(Box::new(NoopTracer::new())),
            propagator: None,
            net_reporter: Arc::new(NoopNetReporter),
            detailed_metrics: false,
        }
    }
}

impl fmt::Debug for TelemetrySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetrySettings")
            .field("propagator", &self.propagator.is_some())
            .field("detailed_metrics", &self.detailed_metrics)
            .finish_non_exhaustive()
    }
}

impl TelemetrySettings {
    /// Settings whose tracer comes from the global tracer provider.
    pub fn from_global() -> Self {
        Self::default().with_tracer(opentelemetry::global::tracer(TRACER_NAME))
    }

    #[must_use]
    pub fn with_tracer(mut self, tracer: BoxedTracer) -> Self {
        self.tracer = tracer;
        self
    }

    #[must_use]
    pub fn with_propagator(mut self, propagator: Arc<dyn TextMapPropagator + Send + Sync>) -> Self {
        self.propagator = Some(propagator);
        self
    }

    #[must_use]
    pub fn with_net_reporter(mut self, net_reporter: Arc<dyn NetReporter>) -> Self {
        self.net_reporter = net_reporter;
        self
    }

    #[must_use]
    pub fn with_detailed_metrics(mut self, detailed_metrics: bool) -> Self {
        self.detailed_metrics = detailed_metrics;
        self
    }
}
