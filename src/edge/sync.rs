// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Sketch sync from the edge to the backend.
//!
//! The contract: deliver a batch of endpoint sketches tagged with the
//! switch id, a wall-clock timestamp, and a monotonically increasing
//! sequence number. Two envelope flavors exist:
//!
//! - **Structured**: JSON summaries, enough for aggregation and identity
//!   joining on the backend.
//! - **Binary**: length-prefixed framing (4-byte LE sketch count, then
//!   per sketch a 4-byte LE length prefix and its serialized bytes),
//!   optionally gzip-compressed as a whole, so the backend can merge full
//!   register state.
//!
//! Oversized batches are split; each batch is retried up to `max_retries`
//! times with a fixed delay and, on final failure, retained for the next
//! sync cycle. Nothing is silently dropped, and no transport failure ever
//! reaches the ingestion path. An HTTP implementation of
//! [`SyncTransport`] lives outside the core; the headers it should map
//! the binary envelope onto are `Content-Type: application/octet-stream`,
//! `X-Switch-ID`, `X-Sketch-Count`, and `Content-Encoding: gzip`.

use std::{
    io::{Read, Write},
    time::Duration,
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::{config::SyncConfig, enums::TransportKind},
    sketches::{
        SketchError,
        endpoint::{EndpointSketch, SketchSummary},
    },
};

/// Errors of the sync channel. Retried internally; the agent only ever
/// observes them through metrics and retained batches.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("transport deadline exceeded")]
    TransportTimeout,
    #[error("sync cancelled")]
    Cancelled,
    #[error("malformed sync payload: {0}")]
    Payload(#[from] SketchError),
}

/// Structured sync envelope.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SyncEnvelope {
    pub switch_id: String,
    /// Seconds since epoch at send time.
    pub timestamp: i64,
    /// Monotonically increasing per switch; the backend accepts batches
    /// out of order.
    pub sequence: u64,
    pub sketch_count: usize,
    pub sketches: Vec<SketchSummary>,
}

/// One batch handed to a transport.
#[derive(Debug, Clone)]
pub struct SyncBatch {
    pub switch_id: String,
    pub timestamp: i64,
    pub sequence: u64,
    pub kind: TransportKind,
    pub compress: bool,
    pub sketches: Vec<EndpointSketch>,
}

impl SyncBatch {
    pub fn envelope(&self) -> SyncEnvelope {
        SyncEnvelope {
            switch_id: self.switch_id.clone(),
            timestamp: self.timestamp,
            sequence: self.sequence,
            sketch_count: self.sketches.len(),
            sketches: self.sketches.iter().map(EndpointSketch::summary).collect(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Binary framing

/// Encodes sketches into the binary frame: LE count, then per sketch an
/// LE length prefix and its serialized bytes.
pub fn encode_binary_batch(sketches: &[EndpointSketch]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32_le(sketches.len() as u32);
    for sketch in sketches {
        let body = sketch.serialize();
        buf.put_u32_le(body.len() as u32);
        buf.put_slice(&body);
    }
    buf.freeze()
}

pub fn decode_binary_batch(mut data: &[u8]) -> Result<Vec<EndpointSketch>, SketchError> {
    if data.remaining() < 4 {
        return Err(SketchError::InvalidFormat("batch header truncated".into()));
    }
    let count = data.get_u32_le() as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        if data.remaining() < 4 {
            return Err(SketchError::InvalidFormat("frame header truncated".into()));
        }
        let len = data.get_u32_le() as usize;
        if data.remaining() < len {
            return Err(SketchError::InvalidFormat(format!(
                "frame body truncated: need {len}, have {}",
                data.remaining()
            )));
        }
        let (body, rest) = data.split_at(len);
        out.push(EndpointSketch::deserialize(body)?);
        data = rest;
    }
    if data.has_remaining() {
        return Err(SketchError::InvalidFormat(format!(
            "{} trailing bytes after last frame",
            data.remaining()
        )));
    }
    Ok(out)
}

pub fn gzip_payload(data: &[u8]) -> Result<Bytes, SyncError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder
        .write_all(data)
        .and_then(|()| encoder.finish())
        .map(Bytes::from)
        .map_err(|e| SyncError::TransportUnavailable(format!("gzip failed: {e}")))
}

pub fn gunzip_payload(data: &[u8]) -> Result<Bytes, SketchError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| SketchError::InvalidFormat(format!("gzip decode failed: {e}")))?;
    Ok(Bytes::from(out))
}

// ─────────────────────────────────────────────────────────────────────────
// Transport

/// One delivery attempt for a batch. Implementations must respect the
/// deadline they are constructed with; retry and batching policy live in
/// [`SyncClient`], not here.
pub trait SyncTransport: Send {
    fn send(
        &mut self,
        batch: &SyncBatch,
    ) -> impl Future<Output = Result<(), SyncError>> + Send;
}

/// TCP transport speaking the core frame:
///
/// ```text
/// u8  kind (0 = structured JSON, 1 = binary)
/// u16 LE switch-id length, switch-id bytes
/// u64 LE sequence
/// u32 LE sketch count
/// u8  compressed flag
/// u32 LE payload length, payload bytes
/// ```
///
/// The backend acknowledges with a single zero byte; anything else is a
/// failure subject to retry.
#[derive(Debug)]
pub struct TcpTransport {
    addr: String,
    deadline: Duration,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>, deadline: Duration) -> Self {
        Self {
            addr: addr.into(),
            deadline,
        }
    }

    fn frame(batch: &SyncBatch) -> Result<Bytes, SyncError> {
        let (kind, payload) = match batch.kind {
            TransportKind::Structured => {
                let body = serde_json::to_vec(&batch.envelope()).map_err(|e| {
                    SyncError::TransportUnavailable(format!("envelope encode: {e}"))
                })?;
                (0u8, Bytes::from(body))
            },
            TransportKind::Binary => (1u8, encode_binary_batch(&batch.sketches)),
        };

        let payload = if batch.compress {
            gzip_payload(&payload)?
        } else {
            payload
        };

        let mut buf = BytesMut::with_capacity(payload.len() + batch.switch_id.len() + 32);
        buf.put_u8(kind);
        buf.put_u16_le(batch.switch_id.len() as u16);
        buf.put_slice(batch.switch_id.as_bytes());
        buf.put_u64_le(batch.sequence);
        buf.put_u32_le(batch.sketches.len() as u32);
        buf.put_u8(u8::from(batch.compress));
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }
}

impl SyncTransport for TcpTransport {
    async fn send(&mut self, batch: &SyncBatch) -> Result<(), SyncError> {
        let frame = Self::frame(batch)?;

        let mut stream = io_with_deadline(
            "connect",
            TcpStream::connect(&self.addr),
            self.deadline,
        )
        .await?;

        io_with_deadline("write frame", stream.write_all(&frame), self.deadline).await?;

        let mut ack = [0u8; 1];
        io_with_deadline("read ack", stream.read_exact(&mut ack), self.deadline).await?;
        if ack[0] != 0 {
            return Err(SyncError::TransportUnavailable(format!(
                "backend rejected batch (status {})",
                ack[0]
            )));
        }
        Ok(())
    }
}

async fn io_with_deadline<F, T, E>(
    label: &'static str,
    fut: F,
    io_timeout: Duration,
) -> Result<T, SyncError>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    match timeout(io_timeout, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(SyncError::TransportUnavailable(format!("{label}: {e}"))),
        Err(_) => {
            debug!("{label} exceeded deadline");
            Err(SyncError::TransportTimeout)
        },
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Client: batching, retry, retention

/// Outcome of one sync cycle, reported per batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub batches_sent: u64,
    pub batches_retained: u64,
    pub sketches_sent: u64,
    pub errors: u64,
    pub cancelled: bool,
}

impl SyncReport {
    pub fn all_sent(&self) -> bool {
        self.batches_retained == 0 && !self.cancelled
    }
}

/// Retrying sync client. Owns the per-switch sequence counter and the
/// retained batches awaiting the next cycle.
pub struct SyncClient<T: SyncTransport> {
    cfg: SyncConfig,
    switch_id: String,
    transport: T,
    sequence: u64,
    retained: Vec<Vec<EndpointSketch>>,
}

impl<T: SyncTransport> SyncClient<T> {
    pub fn new(cfg: SyncConfig, switch_id: impl Into<String>, transport: T) -> Self {
        Self {
            cfg,
            switch_id: switch_id.into(),
            transport,
            sequence: 0,
            retained: Vec::new(),
        }
    }

    /// Batches retained from failed cycles, awaiting redelivery.
    pub fn retained_batches(&self) -> usize {
        self.retained.len()
    }

    /// Ships sketches to the backend: retained batches first, then the
    /// fresh snapshot split into `batch_size` chunks. Batches are
    /// independent; partial success is reported, failed batches are kept
    /// for the next cycle. Cancellation is honored between batches.
    pub async fn sync(
        &mut self,
        sketches: Vec<EndpointSketch>,
        now: i64,
        cancel: &CancellationToken,
    ) -> SyncReport {
        let mut pending = std::mem::take(&mut self.retained);
        for chunk in sketches.chunks(self.cfg.batch_size) {
            if !chunk.is_empty() {
                pending.push(chunk.to_vec());
            }
        }

        let mut report = SyncReport::default();

        for batch_sketches in pending {
            if cancel.is_cancelled() {
                report.cancelled = true;
                self.retained.push(batch_sketches);
                continue;
            }

            let batch = SyncBatch {
                switch_id: self.switch_id.clone(),
                timestamp: now,
                sequence: self.next_sequence(),
                kind: self.cfg.transport,
                compress: self.cfg.compress && self.cfg.transport == TransportKind::Binary,
                sketches: batch_sketches,
            };

            match self.send_with_retries(&batch, cancel).await {
                Ok(()) => {
                    report.batches_sent += 1;
                    report.sketches_sent += batch.sketches.len() as u64;
                },
                Err(SyncError::Cancelled) => {
                    report.cancelled = true;
                    self.retained.push(batch.sketches);
                },
                Err(e) => {
                    warn!(sequence = batch.sequence, "batch retained after retries: {e}");
                    report.errors += 1;
                    report.batches_retained += 1;
                    self.retained.push(batch.sketches);
                },
            }
        }

        report
    }

    async fn send_with_retries(
        &mut self,
        batch: &SyncBatch,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let mut last_err = SyncError::TransportUnavailable("no attempt made".into());

        for attempt in 1..=self.cfg.max_retries {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            match self.transport.send(batch).await {
                Ok(()) => {
                    debug!(
                        sequence = batch.sequence,
                        sketches = batch.sketches.len(),
                        "batch delivered"
                    );
                    return Ok(());
                },
                Err(e) => {
                    debug!(
                        attempt,
                        max = self.cfg.max_retries,
                        "batch send failed: {e}"
                    );
                    last_err = e;
                },
            }

            if attempt < self.cfg.max_retries {
                tokio::select! {
                    () = cancel.cancelled() => return Err(SyncError::Cancelled),
                    () = sleep(self.cfg.retry_delay) => {},
                }
            }
        }

        Err(last_err)
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}
