// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Probabilistic sketches and the per-endpoint behavioral fingerprint.

/// Count-Min frequency sketch.
pub mod countmin;
/// Per-endpoint behavioral fingerprint.
pub mod endpoint;
/// Deterministic hash family shared by the sketches.
pub mod hash;
/// HyperLogLog cardinality sketch.
pub mod hyperloglog;
/// Bounded endpoint → sketch store with eviction.
pub mod store;

use thiserror::Error;

/// Errors raised by sketch operations.
///
/// Parameter mismatches are programmer errors and surface to the caller;
/// every other sketch operation is total.
#[derive(Debug, Error)]
pub enum SketchError {
    /// Merge attempted between sketches built with different structural
    /// parameters (HLL precision or CMS dimensions).
    #[error("incompatible sketch parameters: {0}")]
    IncompatibleSketch(String),
    /// Merge attempted between sketches of two different endpoints.
    #[error("endpoint mismatch: {ours} vs {theirs}")]
    EndpointMismatch { ours: String, theirs: String },
    /// Serialized bytes do not describe a sketch with the expected layout.
    #[error("invalid serialized sketch: {0}")]
    InvalidFormat(String),
}
