// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The persistence boundary.
//!
//! The core talks to storage only through [`Storage`]; the concrete store
//! is replaceable. [`InMemoryStorage`] is the in-process implementation
//! used by the backend and the tests; a database-backed implementation
//! lives outside the core.
//!
//! Membership close/remove semantics are the primitive halves of the
//! lifecycle rules in [`crate::sgt::lifecycle`]: closing stamps the open
//! history row's `unassigned_at` and returns the row that was active.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::{
    clustering::{features::StandardScaler, incremental::ClusterCentroid, labeling::ClusterLabel},
    policy::{matrix::MatrixCell, sgacl::SgaclPolicy},
    sgt::lifecycle::{SgtEntry, SgtHistoryRow, SgtMembership},
    sketches::endpoint::SketchSummary,
};

/// Identity record persisted per endpoint after enrichment.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub endpoint_id: String,
    pub username: Option<String>,
    pub ad_groups: Vec<String>,
    pub ise_profile: Option<String>,
    pub device_type: Option<String>,
    pub confidence: f64,
    pub resolved_at: DateTime<Utc>,
}

/// Storage capabilities the core depends on.
pub trait Storage: Send + Sync {
    // Sketch summaries, keyed by (switch, endpoint).
    fn upsert_sketch_summary(&self, switch_id: &str, summary: SketchSummary);
    fn list_sketch_summaries(&self, switch_id: &str) -> Vec<SketchSummary>;
    fn get_sketch_summary(&self, switch_id: &str, endpoint_id: &str)
    -> Option<SketchSummary>;

    // Identity records.
    fn upsert_identity(&self, record: IdentityRecord);
    fn get_identity(&self, endpoint_id: &str) -> Option<IdentityRecord>;

    // SGT registry.
    fn put_sgt(&self, entry: SgtEntry);
    fn get_sgt(&self, sgt_value: u16) -> Option<SgtEntry>;
    fn list_sgts(&self) -> Vec<SgtEntry>;

    // SGT membership. `close_membership` stamps the open history row and
    // returns the previously active membership, leaving the row in place
    // for the successor; `remove_membership` does the same and deletes it.
    fn put_membership(&self, membership: SgtMembership);
    fn get_membership(&self, endpoint_id: &str) -> Option<SgtMembership>;
    fn members_of(&self, sgt_value: u16) -> Vec<SgtMembership>;
    fn close_membership(
        &self,
        endpoint_id: &str,
        at: DateTime<Utc>,
    ) -> Option<SgtMembership>;
    fn remove_membership(
        &self,
        endpoint_id: &str,
        at: DateTime<Utc>,
    ) -> Option<SgtMembership>;

    // Append-only SGT history.
    fn append_history(&self, row: SgtHistoryRow);
    fn history_of(&self, endpoint_id: &str) -> Vec<SgtHistoryRow>;

    // Cluster centroids and the frozen scaler, the incremental model
    // artifact.
    fn store_centroid(&self, centroid: ClusterCentroid);
    fn get_centroid(&self, cluster_id: i64) -> Option<ClusterCentroid>;
    fn list_centroids(&self) -> Vec<ClusterCentroid>;
    fn store_scaler(&self, scaler: StandardScaler);
    fn get_scaler(&self) -> Option<StandardScaler>;

    // Cluster labels with operator-facing explanations.
    fn store_cluster_label(&self, label: ClusterLabel, explanation: String);
    fn get_cluster_label(&self, cluster_id: i64) -> Option<(ClusterLabel, String)>;

    // Policy artifacts, rebuilt per run.
    fn store_matrix_cell(&self, cell: MatrixCell);
    fn list_matrix_cells(&self) -> Vec<MatrixCell>;
    fn store_policy(&self, policy: SgaclPolicy);
    fn list_policies(&self) -> Vec<SgaclPolicy>;
}

/// In-process store over concurrent maps.
#[derive(Default)]
pub struct InMemoryStorage {
    summaries: DashMap<(String, String), SketchSummary>,
    identities: DashMap<String, IdentityRecord>,
    sgts: DashMap<u16, SgtEntry>,
    memberships: DashMap<String, SgtMembership>,
    history: DashMap<String, Vec<SgtHistoryRow>>,
    centroids: DashMap<i64, ClusterCentroid>,
    scaler: DashMap<(), StandardScaler>,
    labels: DashMap<i64, (ClusterLabel, String)>,
    matrix_cells: DashMap<(u16, u16), MatrixCell>,
    policies: DashMap<(u16, u16), SgaclPolicy>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn upsert_sketch_summary(&self, switch_id: &str, summary: SketchSummary) {
        self.summaries
            .insert((switch_id.to_string(), summary.endpoint_id.clone()), summary);
    }

    fn list_sketch_summaries(&self, switch_id: &str) -> Vec<SketchSummary> {
        let mut out: Vec<SketchSummary> = self
            .summaries
            .iter()
            .filter(|e| e.key().0 == switch_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));
        out
    }

    fn get_sketch_summary(
        &self,
        switch_id: &str,
        endpoint_id: &str,
    ) -> Option<SketchSummary> {
        self.summaries
            .get(&(switch_id.to_string(), endpoint_id.to_string()))
            .map(|e| e.value().clone())
    }

    fn upsert_identity(&self, record: IdentityRecord) {
        self.identities.insert(record.endpoint_id.clone(), record);
    }

    fn get_identity(&self, endpoint_id: &str) -> Option<IdentityRecord> {
        self.identities.get(endpoint_id).map(|e| e.value().clone())
    }

    fn put_sgt(&self, entry: SgtEntry) {
        self.sgts.insert(entry.sgt_value, entry);
    }

    fn get_sgt(&self, sgt_value: u16) -> Option<SgtEntry> {
        self.sgts.get(&sgt_value).map(|e| e.value().clone())
    }

    fn list_sgts(&self) -> Vec<SgtEntry> {
        self.sgts.iter().map(|e| e.value().clone()).collect()
    }

    fn put_membership(&self, membership: SgtMembership) {
        self.memberships
            .insert(membership.endpoint_id.clone(), membership);
    }

    fn get_membership(&self, endpoint_id: &str) -> Option<SgtMembership> {
        self.memberships.get(endpoint_id).map(|e| e.value().clone())
    }

    fn members_of(&self, sgt_value: u16) -> Vec<SgtMembership> {
        self.memberships
            .iter()
            .filter(|e| e.value().sgt_value == sgt_value)
            .map(|e| e.value().clone())
            .collect()
    }

    fn close_membership(
        &self,
        endpoint_id: &str,
        at: DateTime<Utc>,
    ) -> Option<SgtMembership> {
        let previous = self
            .memberships
            .get(endpoint_id)
            .map(|e| e.value().clone())?;
        self.stamp_open_history(endpoint_id, at);
        Some(previous)
    }

    fn remove_membership(
        &self,
        endpoint_id: &str,
        at: DateTime<Utc>,
    ) -> Option<SgtMembership> {
        let (_, previous) = self.memberships.remove(endpoint_id)?;
        self.stamp_open_history(endpoint_id, at);
        Some(previous)
    }

    fn append_history(&self, row: SgtHistoryRow) {
        self.history
            .entry(row.endpoint_id.clone())
            .or_default()
            .push(row);
    }

    fn history_of(&self, endpoint_id: &str) -> Vec<SgtHistoryRow> {
        self.history
            .get(endpoint_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    fn store_centroid(&self, centroid: ClusterCentroid) {
        self.centroids.insert(centroid.cluster_id, centroid);
    }

    fn get_centroid(&self, cluster_id: i64) -> Option<ClusterCentroid> {
        self.centroids.get(&cluster_id).map(|e| e.value().clone())
    }

    fn list_centroids(&self) -> Vec<ClusterCentroid> {
        let mut out: Vec<ClusterCentroid> =
            self.centroids.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|c| c.cluster_id);
        out
    }

    fn store_scaler(&self, scaler: StandardScaler) {
        self.scaler.insert((), scaler);
    }

    fn get_scaler(&self) -> Option<StandardScaler> {
        self.scaler.get(&()).map(|e| e.value().clone())
    }

    fn store_cluster_label(&self, label: ClusterLabel, explanation: String) {
        self.labels.insert(label.cluster_id, (label, explanation));
    }

    fn get_cluster_label(&self, cluster_id: i64) -> Option<(ClusterLabel, String)> {
        self.labels.get(&cluster_id).map(|e| e.value().clone())
    }

    fn store_matrix_cell(&self, cell: MatrixCell) {
        self.matrix_cells.insert((cell.src_sgt, cell.dst_sgt), cell);
    }

    fn list_matrix_cells(&self) -> Vec<MatrixCell> {
        let mut out: Vec<MatrixCell> =
            self.matrix_cells.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|c| (c.src_sgt, c.dst_sgt));
        out
    }

    fn store_policy(&self, policy: SgaclPolicy) {
        self.policies.insert((policy.src_sgt, policy.dst_sgt), policy);
    }

    fn list_policies(&self) -> Vec<SgaclPolicy> {
        let mut out: Vec<SgaclPolicy> =
            self.policies.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|p| (p.src_sgt, p.dst_sgt));
        out
    }
}

impl InMemoryStorage {
    /// Stamps `unassigned_at` on the endpoint's newest open history row.
    fn stamp_open_history(&self, endpoint_id: &str, at: DateTime<Utc>) {
        if let Some(mut rows) = self.history.get_mut(endpoint_id)
            && let Some(open) = rows
                .iter_mut()
                .rev()
                .find(|r| r.unassigned_at.is_none())
        {
            open.unassigned_at = Some(at);
        }
    }
}
