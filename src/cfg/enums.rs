// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Sync envelope flavor used between the edge and the backend.
///
/// Structured sends JSON-compatible sketch summaries sufficient for
/// aggregation and identity joining; Binary sends full serialized
/// sketches in a length-prefixed frame so the backend can merge register
/// state exactly.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    #[serde(rename = "structured", alias = "Structured", alias = "json")]
    Structured,
    #[serde(rename = "binary", alias = "Binary")]
    Binary,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Structured => "structured",
            TransportKind::Binary => "binary",
        })
    }
}

/// Distance metric for the batch clusterer.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Metric {
    #[default]
    #[serde(rename = "euclidean", alias = "Euclidean")]
    Euclidean,
    #[serde(rename = "manhattan", alias = "Manhattan")]
    Manhattan,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Metric::Euclidean => "euclidean",
            Metric::Manhattan => "manhattan",
        })
    }
}
