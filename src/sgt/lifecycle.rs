// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! SGT lifecycle: stable registry, dynamic membership, append-only
//! history.
//!
//! Three tables with three rules: registry entries are stable across
//! analysis runs and only ever soft-deleted; each endpoint has exactly
//! one active membership row, closed before a replacement is inserted;
//! every membership change appends to history, which is never mutated.
//! Replaying history reproduces the membership table exactly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    clustering::confidence,
    sgt::{AssignmentSource, SgtCategory},
    storage::Storage,
};

#[derive(Debug, Error)]
pub enum SgtError {
    #[error("SGT {0} already exists and is active")]
    DuplicateSgt(u16),
    #[error("SGT {0} not found")]
    UnknownSgt(u16),
    #[error("SGT {0} is not active")]
    InactiveSgt(u16),
}

/// Stable registry definition of one SGT.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SgtEntry {
    /// 0–65535; unique among active entries.
    pub sgt_value: u16,
    pub sgt_name: String,
    pub category: Option<SgtCategory>,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Current assignment of one endpoint. One active row per endpoint.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SgtMembership {
    pub endpoint_id: String,
    pub sgt_value: u16,
    pub assigned_at: DateTime<Utc>,
    pub assigned_by: AssignmentSource,
    pub confidence: f64,
    pub originating_cluster_id: Option<i64>,
}

/// One row of the append-only assignment history.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SgtHistoryRow {
    pub endpoint_id: String,
    pub sgt_value: u16,
    pub assigned_at: DateTime<Utc>,
    pub unassigned_at: Option<DateTime<Utc>>,
    pub assigned_by: AssignmentSource,
}

/// Aggregate view of one SGT for operators.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SgtSummary {
    pub entry: SgtEntry,
    pub member_count: usize,
    pub average_confidence: Option<f64>,
    /// Member counts keyed by assignment source.
    pub by_source: Vec<(AssignmentSource, usize)>,
}

pub struct SgtLifecycle<'a, S: Storage> {
    storage: &'a S,
}

impl<'a, S: Storage> SgtLifecycle<'a, S> {
    pub fn new(storage: &'a S) -> Self {
        Self { storage }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Registry

    /// Creates a registry entry. Fails on an active duplicate value; an
    /// inactive entry with the same value is replaced.
    pub fn create_sgt(
        &self,
        sgt_value: u16,
        sgt_name: impl Into<String>,
        category: Option<SgtCategory>,
        description: Option<String>,
    ) -> Result<SgtEntry, SgtError> {
        if let Some(existing) = self.storage.get_sgt(sgt_value)
            && existing.is_active
        {
            return Err(SgtError::DuplicateSgt(sgt_value));
        }

        let now = Utc::now();
        let entry = SgtEntry {
            sgt_value,
            sgt_name: sgt_name.into(),
            category,
            description,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.storage.put_sgt(entry.clone());
        info!(sgt = sgt_value, name = %entry.sgt_name, "SGT created");
        Ok(entry)
    }

    pub fn get_sgt(&self, sgt_value: u16) -> Option<SgtEntry> {
        self.storage.get_sgt(sgt_value)
    }

    pub fn list_sgts(&self, active_only: bool) -> Vec<SgtEntry> {
        let mut entries = self.storage.list_sgts();
        if active_only {
            entries.retain(|e| e.is_active);
        }
        entries.sort_by_key(|e| e.sgt_value);
        entries
    }

    /// Soft delete: membership rows survive, future assignments fail.
    pub fn deactivate_sgt(&self, sgt_value: u16) -> Result<(), SgtError> {
        let mut entry = self
            .storage
            .get_sgt(sgt_value)
            .ok_or(SgtError::UnknownSgt(sgt_value))?;
        entry.is_active = false;
        entry.updated_at = Utc::now();
        self.storage.put_sgt(entry);
        info!(sgt = sgt_value, "SGT deactivated");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Membership

    /// Assigns an endpoint to an SGT. An existing active membership is
    /// closed into history first. Manual assignments force confidence
    /// 1.0; automated assignments without an explicit confidence get the
    /// scored value (cluster confidence plus stability bonus).
    pub fn assign_endpoint(
        &self,
        endpoint_id: &str,
        sgt_value: u16,
        assigned_by: AssignmentSource,
        confidence: Option<f64>,
        cluster_id: Option<i64>,
    ) -> Result<SgtMembership, SgtError> {
        let entry = self
            .storage
            .get_sgt(sgt_value)
            .ok_or(SgtError::UnknownSgt(sgt_value))?;
        if !entry.is_active {
            return Err(SgtError::InactiveSgt(sgt_value));
        }

        let now = Utc::now();

        let confidence = if assigned_by == AssignmentSource::Manual {
            1.0
        } else {
            confidence.unwrap_or_else(|| {
                let history_count = self.storage.history_of(endpoint_id).len();
                confidence::for_sgt_assignment(0.7, None, history_count)
            })
        };

        // Close the previous assignment before inserting the new one.
        if let Some(previous) = self.storage.close_membership(endpoint_id, now) {
            debug!(
                endpoint = endpoint_id,
                from = previous.sgt_value,
                to = sgt_value,
                "membership replaced"
            );
        }

        let membership = SgtMembership {
            endpoint_id: endpoint_id.to_string(),
            sgt_value,
            assigned_at: now,
            assigned_by,
            confidence,
            originating_cluster_id: cluster_id,
        };
        self.storage.put_membership(membership.clone());
        self.storage.append_history(SgtHistoryRow {
            endpoint_id: endpoint_id.to_string(),
            sgt_value,
            assigned_at: now,
            unassigned_at: None,
            assigned_by,
        });

        info!(
            endpoint = endpoint_id,
            sgt = sgt_value,
            source = %assigned_by,
            confidence,
            "endpoint assigned"
        );
        Ok(membership)
    }

    /// Removes the active membership, closing its history row.
    pub fn unassign_endpoint(&self, endpoint_id: &str) {
        let now = Utc::now();
        if let Some(membership) = self.storage.remove_membership(endpoint_id, now) {
            info!(
                endpoint = endpoint_id,
                sgt = membership.sgt_value,
                "endpoint unassigned"
            );
        }
    }

    pub fn get_endpoint_sgt(&self, endpoint_id: &str) -> Option<SgtMembership> {
        self.storage.get_membership(endpoint_id)
    }

    pub fn members_of(&self, sgt_value: u16) -> Vec<SgtMembership> {
        let mut members = self.storage.members_of(sgt_value);
        members.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));
        members
    }

    /// Assignment history, strictly ordered by (endpoint, assigned_at).
    pub fn history_of(&self, endpoint_id: &str) -> Vec<SgtHistoryRow> {
        let mut rows = self.storage.history_of(endpoint_id);
        rows.sort_by(|a, b| {
            a.endpoint_id
                .cmp(&b.endpoint_id)
                .then_with(|| a.assigned_at.cmp(&b.assigned_at))
        });
        rows
    }

    pub fn summary_of(&self, sgt_value: u16) -> Option<SgtSummary> {
        let entry = self.storage.get_sgt(sgt_value)?;
        let members = self.members_of(sgt_value);

        let average_confidence = if members.is_empty() {
            None
        } else {
            Some(members.iter().map(|m| m.confidence).sum::<f64>() / members.len() as f64)
        };

        let mut by_source: Vec<(AssignmentSource, usize)> = Vec::new();
        for m in &members {
            match by_source.iter_mut().find(|(s, _)| *s == m.assigned_by) {
                Some((_, n)) => *n += 1,
                None => by_source.push((m.assigned_by, 1)),
            }
        }

        Some(SgtSummary {
            entry,
            member_count: members.len(),
            average_confidence,
            by_source,
        })
    }
}
