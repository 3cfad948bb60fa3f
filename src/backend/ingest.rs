// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Backend ingestion of edge sync envelopes.
//!
//! Accepts both envelope flavors, rebuilds sketches from the binary form,
//! and merges them per endpoint. HLL and CMS merges are commutative and
//! associative, so batches arriving out of sequence order still converge
//! to the same state; the highest sequence per switch is tracked only for
//! observability. Structured summaries go to storage for aggregation and
//! identity joining.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use bytes::Buf;
use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Semaphore,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    edge::sync::{SyncEnvelope, decode_binary_batch, gunzip_payload},
    sketches::{SketchError, endpoint::EndpointSketch},
    storage::Storage,
};

/// Concurrent connections the ingest server processes at once.
const INGEST_WORKERS: usize = 8;
/// Upper bound on a single frame payload; larger frames are rejected.
const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Frame status bytes acknowledged to the edge.
const ACK_OK: u8 = 0;
const ACK_MALFORMED: u8 = 1;

/// One decoded sync frame.
#[derive(Debug)]
pub struct SyncFrame {
    pub switch_id: String,
    pub sequence: u64,
    pub sketch_count: usize,
    pub compressed: bool,
    /// 0 = structured JSON, 1 = binary.
    pub kind: u8,
    pub payload: Vec<u8>,
}

/// Backend-side sketch state: one merged sketch per endpoint across all
/// switches and batches.
#[derive(Default)]
pub struct BackendIngest {
    sketches: DashMap<String, EndpointSketch>,
    /// Highest sequence seen per switch. Batches may arrive out of order;
    /// this is telemetry, not a gate.
    switch_sequences: DashMap<String, u64>,
    pub batches_accepted: AtomicU64,
    pub batches_rejected: AtomicU64,
    pub sketches_merged: AtomicU64,
}

impl BackendIngest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint_count(&self) -> usize {
        self.sketches.len()
    }

    /// The merged sketch set, for the analysis pipeline.
    pub fn snapshot(&self) -> Vec<EndpointSketch> {
        let mut out: Vec<EndpointSketch> =
            self.sketches.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));
        out
    }

    pub fn get(&self, endpoint_id: &str) -> Option<EndpointSketch> {
        self.sketches.get(endpoint_id).map(|e| e.value().clone())
    }

    /// Merges a rebuilt sketch batch into the per-endpoint state.
    pub fn merge_sketches(&self, sketches: Vec<EndpointSketch>) -> Result<(), SketchError> {
        for sketch in sketches {
            match self.sketches.get_mut(&sketch.endpoint_id) {
                Some(mut existing) => existing.merge(&sketch)?,
                None => {
                    self.sketches.insert(sketch.endpoint_id.clone(), sketch);
                },
            }
            self.sketches_merged.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Applies a structured envelope: summaries are upserted to storage.
    pub fn accept_envelope<S: Storage>(&self, envelope: SyncEnvelope, storage: &S) {
        self.note_sequence(&envelope.switch_id, envelope.sequence);
        for summary in envelope.sketches {
            storage.upsert_sketch_summary(&envelope.switch_id, summary);
        }
        self.batches_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Decodes and applies one sync frame of either flavor.
    pub fn accept_frame<S: Storage>(
        &self,
        frame: SyncFrame,
        storage: &S,
    ) -> Result<(), SketchError> {
        let payload = if frame.compressed {
            gunzip_payload(&frame.payload)?
        } else {
            bytes::Bytes::from(frame.payload)
        };

        match frame.kind {
            0 => {
                let envelope: SyncEnvelope =
                    serde_json::from_slice(&payload).map_err(|e| {
                        SketchError::InvalidFormat(format!("bad envelope JSON: {e}"))
                    })?;
                self.accept_envelope(envelope, storage);
            },
            1 => {
                let sketches = decode_binary_batch(&payload)?;
                if sketches.len() != frame.sketch_count {
                    return Err(SketchError::InvalidFormat(format!(
                        "frame declares {} sketches, payload has {}",
                        frame.sketch_count,
                        sketches.len()
                    )));
                }
                self.note_sequence(&frame.switch_id, frame.sequence);
                // Summaries are persisted alongside the merge so the
                // structured view stays queryable either way.
                for sketch in &sketches {
                    storage.upsert_sketch_summary(&frame.switch_id, sketch.summary());
                }
                self.merge_sketches(sketches)?;
                self.batches_accepted.fetch_add(1, Ordering::Relaxed);
            },
            other => {
                return Err(SketchError::InvalidFormat(format!(
                    "unknown frame kind {other}"
                )));
            },
        }
        Ok(())
    }

    fn note_sequence(&self, switch_id: &str, sequence: u64) {
        let mut entry = self
            .switch_sequences
            .entry(switch_id.to_string())
            .or_insert(0);
        if sequence < *entry {
            debug!(switch_id, sequence, latest = *entry, "out-of-order batch");
        } else {
            *entry = sequence;
        }
    }

    /// Serves the core TCP sync protocol until cancelled. Connections are
    /// processed by a bounded worker pool.
    pub async fn serve<S: Storage + 'static>(
        self: Arc<Self>,
        listener: TcpListener,
        storage: Arc<S>,
        cancel: CancellationToken,
    ) {
        let permits = Arc::new(Semaphore::new(INGEST_WORKERS));
        info!(workers = INGEST_WORKERS, "sketch ingest listening");

        loop {
            let accepted = tokio::select! {
                () = cancel.cancelled() => break,
                a = listener.accept() => a,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                },
            };

            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let ingest = Arc::clone(&self);
            let storage = Arc::clone(&storage);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = ingest.handle_connection(stream, &*storage, cancel).await
                {
                    debug!(%peer, "ingest connection closed: {e}");
                }
            });
        }

        info!("sketch ingest stopped");
    }

    async fn handle_connection<S: Storage>(
        &self,
        mut stream: TcpStream,
        storage: &S,
        cancel: CancellationToken,
    ) -> Result<(), SketchError> {
        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                f = read_frame(&mut stream) => match f {
                    Ok(Some(frame)) => frame,
                    Ok(None) => return Ok(()),
                    Err(e) => return Err(e),
                },
            };

            let status = match self.accept_frame(frame, storage) {
                Ok(()) => ACK_OK,
                Err(e) => {
                    self.batches_rejected.fetch_add(1, Ordering::Relaxed);
                    warn!("rejected sync frame: {e}");
                    ACK_MALFORMED
                },
            };

            if stream.write_all(&[status]).await.is_err() {
                return Ok(());
            }
        }
    }
}

/// Reads one frame off the socket; `Ok(None)` on clean EOF before the
/// first byte.
async fn read_frame(stream: &mut TcpStream) -> Result<Option<SyncFrame>, SketchError> {
    let mut kind = [0u8; 1];
    match stream.read_exact(&mut kind).await {
        Ok(_) => {},
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(io_invalid(e)),
    }

    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.map_err(io_invalid)?;
    let switch_len = usize::from(u16::from_le_bytes(header));
    let mut switch_buf = vec![0u8; switch_len];
    stream.read_exact(&mut switch_buf).await.map_err(io_invalid)?;
    let switch_id = String::from_utf8(switch_buf)
        .map_err(|_| SketchError::InvalidFormat("non-UTF8 switch id".into()))?;

    let mut fixed = [0u8; 8 + 4 + 1 + 4];
    stream.read_exact(&mut fixed).await.map_err(io_invalid)?;
    let mut cursor = &fixed[..];
    let sequence = cursor.get_u64_le();
    let sketch_count = cursor.get_u32_le() as usize;
    let compressed = cursor.get_u8() != 0;
    let payload_len = cursor.get_u32_le() as usize;

    if payload_len > MAX_PAYLOAD {
        return Err(SketchError::InvalidFormat(format!(
            "payload of {payload_len} bytes exceeds the frame limit"
        )));
    }

    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload).await.map_err(io_invalid)?;

    Ok(Some(SyncFrame {
        switch_id,
        sequence,
        sketch_count,
        compressed,
        kind: kind[0],
        payload,
    }))
}

fn io_invalid(e: std::io::Error) -> SketchError {
    SketchError::InvalidFormat(format!("frame read failed: {e}"))
}
