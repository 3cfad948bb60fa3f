// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Backend clustering: feature extraction, batch and incremental
//! clustering, semantic labeling, and confidence scoring.

/// Density-based batch clustering.
pub mod batch;
/// Confidence scoring shared by clustering and SGT assignment.
pub mod confidence;
/// Feature extraction with a fit-once frozen scaler.
pub mod features;
/// Centroid-based incremental assignment.
pub mod incremental;
/// Semantic cluster labels and explanations.
pub mod labeling;
