// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! SGT taxonomy synthesis and lifecycle management.

/// SGT registry, membership, and assignment history.
pub mod lifecycle;
/// Cluster → SGT allocation.
pub mod mapper;

use core::fmt;

use serde::{Deserialize, Serialize};

/// SGT category, deciding which value range an allocation draws from.
#[derive(
    Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum SgtCategory {
    Users,
    Servers,
    Devices,
    Special,
}

impl SgtCategory {
    /// Inclusive value range for this category. Overflow allocations fall
    /// into the special range.
    pub fn range(self) -> (u16, u16) {
        match self {
            SgtCategory::Users => (2, 9),
            SgtCategory::Servers => (10, 19),
            SgtCategory::Devices => (20, 29),
            SgtCategory::Special => (30, 39),
        }
    }

    pub fn contains(self, value: u16) -> bool {
        let (lo, hi) = self.range();
        (lo..=hi).contains(&value)
    }
}

impl fmt::Display for SgtCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SgtCategory::Users => "users",
            SgtCategory::Servers => "servers",
            SgtCategory::Devices => "devices",
            SgtCategory::Special => "special",
        })
    }
}

/// Who or what created an SGT assignment.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentSource {
    Clustering,
    Incremental,
    Manual,
    Ise,
}

impl fmt::Display for AssignmentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AssignmentSource::Clustering => "clustering",
            AssignmentSource::Incremental => "incremental",
            AssignmentSource::Manual => "manual",
            AssignmentSource::Ise => "ise",
        })
    }
}
