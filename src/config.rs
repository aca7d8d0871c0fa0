// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Configuration for the arrow exporter.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default stream lifetime, kept below common server max connection ages.
const DEFAULT_MAX_STREAM_LIFETIME: Duration = Duration::from_secs(30);

/// Configuration for the arrow exporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Number of concurrent streams. Defaults to half the available
    /// parallelism, at least one.
    #[serde(default = "default_num_streams")]
    pub num_streams: usize,

    /// Each stream is closed from the client side after this long. Zero
    /// disables the limit.
    #[serde(default = "default_max_stream_lifetime", with = "humantime_serde")]
    pub max_stream_lifetime: Duration,

    /// Measure the uncompressed size of every batch.
    #[serde(default)]
    pub detailed_metrics: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_streams: default_num_streams(),
            max_stream_lifetime: DEFAULT_MAX_STREAM_LIFETIME,
            detailed_metrics: false,
        }
    }
}

impl Config {
    /// Checks the values deserialization cannot reject.
    pub fn validate(&self) -> Result<(), Error> {
        if self.num_streams == 0 {
            return Err(Error::InvalidConfig(
                "num_streams must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_num_streams() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}

fn default_max_stream_lifetime() -> Duration {
    DEFAULT_MAX_STREAM_LIFETIME
}
