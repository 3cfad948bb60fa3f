// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! On-switch runtime: flow ingestion, local clustering, and the sync
//! channel to the backend.

/// Edge agent task loop.
pub mod agent;
/// Memory-frugal k-means for local clustering.
pub mod kmeans;
/// Batched, framed, retrying sketch sync.
pub mod sync;
