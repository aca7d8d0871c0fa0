// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! A pool of arrow streams sharing one endpoint.
//!
//! Each stream controller runs one stream at a time and replaces it when
//! it ends. A controller whose stream could not be established stops;
//! once every controller has stopped this way the exporter downgrades
//! and callers are told to use the non-streaming transport instead.

use crate::client::{PerRpcCredentials, StreamClient};
use crate::config::Config;
use crate::context::CallContext;
use crate::error::Error;
use crate::prioritizer::FifoPrioritizer;
use crate::records::{Producer, Records};
use crate::stream::{request_metadata, Stream};
use crate::telemetry::TelemetrySettings;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Creates the producer of each new stream.
pub type ProducerFactory = Arc<dyn Fn() -> Box<dyn Producer> + Send + Sync>;

/// Streams are closed up to this fraction of the configured lifetime
/// early, so a pool started at once does not restart at once.
const LIFETIME_JITTER: f64 = 0.05;

/// Shared by the controllers.
struct Shared {
    config: Config,
    client: Arc<dyn StreamClient>,
    new_producer: ProducerFactory,
    telemetry: Arc<TelemetrySettings>,
    per_rpc_credentials: Option<Arc<dyn PerRpcCredentials>>,
    prioritizer: Arc<FifoPrioritizer>,
    cancel: CancellationToken,
    /// Controllers that have not given up on the endpoint.
    active: AtomicUsize,
}

/// Exports records over a pool of arrow streams.
pub struct Exporter {
    shared: Arc<Shared>,
    controllers: Mutex<Vec<JoinHandle<()>>>,
}

impl Exporter {
    /// Validates `config` and starts `config.num_streams` stream
    /// controllers. Must be called within a tokio runtime.
    pub fn start(
        config: Config,
        client: Arc<dyn StreamClient>,
        new_producer: ProducerFactory,
        telemetry: Arc<TelemetrySettings>,
        per_rpc_credentials: Option<Arc<dyn PerRpcCredentials>>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let num_streams = config.num_streams;
        let shared = Arc::new(Shared {
            config,
            client,
            new_producer,
            telemetry,
            per_rpc_credentials,
            prioritizer: Arc::new(FifoPrioritizer::new()),
            cancel: CancellationToken::new(),
            active: AtomicUsize::new(num_streams),
        });

        let controllers = (0..num_streams)
            .map(|_| tokio::spawn(run_controller(Arc::clone(&shared))))
            .collect();

        Ok(Self {
            shared,
            controllers: Mutex::new(controllers),
        })
    }

    /// Sends `records` on the next ready stream and waits for the
    /// acknowledgment.
    ///
    /// Returns `Ok(false)` without sending when the exporter has
    /// downgraded, and [`Error::StreamRestarting`] once it is shut down.
    pub async fn send_and_wait(&self, cx: &CallContext, records: Records) -> Result<bool, Error> {
        // Everything that can fail without sending happens before a
        // stream is taken out of the ready set.
        if let Some(err) = cx.err() {
            return Err(err);
        }
        let md = request_metadata(self.shared.per_rpc_credentials.as_deref(), cx).await?;

        let next = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => return Err(Error::StreamRestarting),
            next = self.shared.prioritizer.next_stream(cx) => next?,
        };
        let Some(stream) = next else {
            return Ok(false);
        };
        stream.send_claimed(cx, records, md).await?;
        Ok(true)
    }

    /// True once every stream controller has given up on the endpoint.
    pub fn is_downgraded(&self) -> bool {
        self.shared.prioritizer.is_downgraded()
    }

    /// Stops every stream and waits for the controllers to exit. Callers
    /// still waiting, and callers arriving afterwards, receive
    /// [`Error::StreamRestarting`] (or [`Error::Canceled`] for a batch
    /// that was queued but never sent).
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let controllers = std::mem::take(&mut *self.controllers.lock());
        for result in futures::future::join_all(controllers).await {
            if let Err(err) = result {
                debug!(error = %err, "stream controller ended abnormally");
            }
        }
    }
}

impl Drop for Exporter {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

async fn run_controller(shared: Arc<Shared>) {
    while !shared.cancel.is_cancelled() {
        let stream = Arc::new(
            Stream::new(
                (shared.new_producer)(),
                shared.prioritizer.clone(),
                shared.telemetry.clone(),
                shared.per_rpc_credentials.clone(),
            )
            .with_max_stream_lifetime(jittered(shared.config.max_stream_lifetime)),
        );
        Arc::clone(&stream)
            .run(shared.cancel.clone(), shared.client.as_ref())
            .await;

        if stream.is_established() {
            continue;
        }
        if shared.cancel.is_cancelled() {
            break;
        }
        if shared.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            info!("arrow streams unavailable, downgrading to standard OTLP");
            shared.prioritizer.downgrade();
        }
        break;
    }
}

/// Shortens `lifetime` by a random amount up to [`LIFETIME_JITTER`] of it.
fn jittered(lifetime: Duration) -> Duration {
    if lifetime.is_zero() {
        return lifetime;
    }
    let max_jitter = lifetime.mul_f64(LIFETIME_JITTER);
    let jitter = rand::thread_rng().gen_range(Duration::ZERO..=max_jitter);
    lifetime - jitter
}
