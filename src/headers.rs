// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-batch headers.
//!
//! gRPC headers are fixed when the stream is established, so caller
//! metadata and trace context travel inside each batch as an HPACK
//! header block.

use bytes::Bytes;
use std::collections::HashMap;
use std::io;

/// HPACK encoder and output buffer, reused across the batches of one
/// stream.
pub struct HeaderEncoder {
    encoder: hpack::Encoder<'static>,
    buf: Vec<u8>,
}

impl Default for HeaderEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderEncoder {
    pub fn new() -> Self {
        Self {
            encoder: hpack::Encoder::new(),
            buf: Vec::with_capacity(256),
        }
    }

    /// Encodes `metadata` as one header block. Fields are written in key
    /// order.
    pub fn encode(&mut self, metadata: &HashMap<String, String>) -> io::Result<Bytes> {
        self.buf.clear();
        let mut fields: Vec<(&String, &String)> = metadata.iter().collect();
        fields.sort_unstable();
        self.encoder.encode_into(
            fields
                .into_iter()
                .map(|(key, value)| (key.as_bytes(), value.as_bytes())),
            &mut self.buf,
        )?;
        Ok(Bytes::copy_from_slice(&self.buf))
    }
}

/// Decodes a header block written by [`HeaderEncoder`].
///
/// `decoder` must be the one decoder used for every header block of the
/// same stream. Repeated keys keep the last value.
pub fn decode_headers(
    decoder: &mut hpack::Decoder<'_>,
    block: &[u8],
) -> io::Result<HashMap<String, String>> {
    let fields = decoder
        .decode(block)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("hpack: {e:?}")))?;
    fields
        .into_iter()
        .map(|(key, value)| {
            let key = String::from_utf8(key)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let value = String::from_utf8(value)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            Ok((key, value))
        })
        .collect()
}
