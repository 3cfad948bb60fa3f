// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! SGT × SGT traffic matrix.
//!
//! Aggregates observed flows into cells keyed by (source SGT, destination
//! SGT): which ports, how many flows and bytes, how many distinct
//! endpoints on each side, over what time span. The matrix is rebuilt on
//! every policy-generation run; cells are the sole input to SGACL
//! generation and impact analysis.
//!
//! Destination resolution order: a known endpoint's cluster SGT, else the
//! server SGT for a known service IP, else SGT 0 "Unknown".

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::flow::FlowRecord;

/// SGT reserved for destinations nothing resolves.
pub const UNKNOWN_SGT: u16 = 0;
/// Category SGT applied to known services without an endpoint record.
pub const SERVICE_SGT: u16 = 10;

/// One cell of the matrix: observed traffic from `src_sgt` to `dst_sgt`.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct MatrixCell {
    pub src_sgt: u16,
    pub src_sgt_name: String,
    pub dst_sgt: u16,
    pub dst_sgt_name: String,

    /// `"proto/port"` → flow count.
    pub observed_ports: BTreeMap<String, u64>,
    pub total_bytes: u64,
    pub total_flows: u64,
    pub unique_src_endpoints: usize,
    pub unique_dst_endpoints: usize,

    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,

    /// Service names resolved for destinations in this cell.
    pub services: BTreeSet<String>,
}

impl MatrixCell {
    fn add_flow(
        &mut self,
        port_key: String,
        bytes: u64,
        service_name: Option<&str>,
        timestamp: DateTime<Utc>,
    ) {
        *self.observed_ports.entry(port_key).or_insert(0) += 1;
        self.total_bytes += bytes;
        self.total_flows += 1;

        if let Some(service) = service_name {
            self.services.insert(service.to_string());
        }

        if self.first_seen.is_none_or(|f| timestamp < f) {
            self.first_seen = Some(timestamp);
        }
        if self.last_seen.is_none_or(|l| timestamp > l) {
            self.last_seen = Some(timestamp);
        }
    }

    /// Top-k ports by flow count, descending.
    pub fn top_ports(&self, k: usize) -> Vec<(&str, u64)> {
        let mut ports: Vec<(&str, u64)> = self
            .observed_ports
            .iter()
            .map(|(p, &c)| (p.as_str(), c))
            .collect();
        ports.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ports.truncate(k);
        ports
    }
}

#[derive(Debug, Clone, Default)]
pub struct PolicyMatrix {
    pub cells: BTreeMap<(u16, u16), MatrixCell>,
    pub sgt_names: BTreeMap<u16, String>,

    pub total_flows: u64,
    pub total_bytes: u64,
}

impl PolicyMatrix {
    pub fn get_cell(&self, src_sgt: u16, dst_sgt: u16) -> Option<&MatrixCell> {
        self.cells.get(&(src_sgt, dst_sgt))
    }

    pub fn add_sgt_name(&mut self, sgt: u16, name: impl Into<String>) {
        self.sgt_names.entry(sgt).or_insert_with(|| name.into());
    }

    fn get_or_create_cell(&mut self, src_sgt: u16, dst_sgt: u16) -> &mut MatrixCell {
        let src_name = self.name_of(src_sgt);
        let dst_name = self.name_of(dst_sgt);
        self.cells.entry((src_sgt, dst_sgt)).or_insert_with(|| MatrixCell {
            src_sgt,
            src_sgt_name: src_name,
            dst_sgt,
            dst_sgt_name: dst_name,
            ..MatrixCell::default()
        })
    }

    fn name_of(&self, sgt: u16) -> String {
        self.sgt_names
            .get(&sgt)
            .cloned()
            .unwrap_or_else(|| format!("SGT-{sgt}"))
    }

    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }

    /// All SGT values that appear on either axis, ascending.
    pub fn sgt_values(&self) -> Vec<u16> {
        let mut sgts = BTreeSet::new();
        for &(src, dst) in self.cells.keys() {
            sgts.insert(src);
            sgts.insert(dst);
        }
        sgts.into_iter().collect()
    }

    /// Square flow-count matrix for downstream visualization tools.
    pub fn to_heatmap(&self) -> (Vec<u16>, Vec<Vec<u64>>) {
        let sgts = self.sgt_values();
        let index: BTreeMap<u16, usize> =
            sgts.iter().enumerate().map(|(i, &s)| (s, i)).collect();

        let mut grid = vec![vec![0u64; sgts.len()]; sgts.len()];
        for (&(src, dst), cell) in &self.cells {
            grid[index[&src]][index[&dst]] = cell.total_flows;
        }
        (sgts, grid)
    }

    pub fn summary(&self) -> MatrixSummary {
        let n_sgts = self.sgt_values().len();
        MatrixSummary {
            n_sgts,
            n_cells: self.n_cells(),
            total_flows: self.total_flows,
            total_bytes: self.total_bytes,
            density: self.n_cells() as f64 / ((n_sgts * n_sgts).max(1)) as f64,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct MatrixSummary {
    pub n_sgts: usize,
    pub n_cells: usize,
    pub total_flows: u64,
    pub total_bytes: u64,
    pub density: f64,
}

/// Builds the matrix from observed flows and the current cluster → SGT
/// view of the world.
pub struct PolicyMatrixBuilder<'a> {
    /// endpoint id → cluster id from the latest analysis run.
    endpoint_to_cluster: &'a HashMap<String, i64>,
    /// cluster id → SGT value from the taxonomy.
    cluster_to_sgt: &'a BTreeMap<i64, u16>,
    /// SGT value → display name.
    sgt_names: &'a BTreeMap<u16, String>,
    /// dst ip → endpoint id, from the endpoint directory.
    ip_to_endpoint: &'a HashMap<String, String>,
    /// dst ip → service name, from the service inventory.
    ip_to_service: &'a HashMap<String, String>,
}

impl<'a> PolicyMatrixBuilder<'a> {
    pub fn new(
        endpoint_to_cluster: &'a HashMap<String, i64>,
        cluster_to_sgt: &'a BTreeMap<i64, u16>,
        sgt_names: &'a BTreeMap<u16, String>,
        ip_to_endpoint: &'a HashMap<String, String>,
        ip_to_service: &'a HashMap<String, String>,
    ) -> Self {
        Self {
            endpoint_to_cluster,
            cluster_to_sgt,
            sgt_names,
            ip_to_endpoint,
            ip_to_service,
        }
    }

    pub fn build(&self, flows: &[FlowRecord]) -> PolicyMatrix {
        let mut matrix = PolicyMatrix::default();
        for (&sgt, name) in self.sgt_names {
            matrix.add_sgt_name(sgt, name.clone());
        }

        let mut cell_src: HashMap<(u16, u16), HashSet<&str>> = HashMap::new();
        let mut cell_dst: HashMap<(u16, u16), HashSet<&str>> = HashMap::new();
        let mut skipped = 0u64;

        for flow in flows {
            let Some(src_sgt) = self.resolve_src_sgt(&flow.src_mac) else {
                skipped += 1;
                continue;
            };

            let dst_sgt = match self.resolve_dst_sgt(&flow.dst_ip) {
                Some(sgt) => sgt,
                None => {
                    matrix.add_sgt_name(UNKNOWN_SGT, "Unknown");
                    UNKNOWN_SGT
                },
            };

            let service_name = self.ip_to_service.get(&flow.dst_ip);
            let cell = matrix.get_or_create_cell(src_sgt, dst_sgt);
            cell.add_flow(
                flow.port_key(),
                flow.bytes,
                service_name.map(String::as_str),
                flow.timestamp,
            );

            let key = (src_sgt, dst_sgt);
            cell_src.entry(key).or_default().insert(flow.src_mac.as_str());
            cell_dst.entry(key).or_default().insert(flow.dst_ip.as_str());

            matrix.total_flows += 1;
            matrix.total_bytes += flow.bytes;
        }

        // Unique endpoint sets fold into the cells after the pass.
        for (key, endpoints) in cell_src {
            if let Some(cell) = matrix.cells.get_mut(&key) {
                cell.unique_src_endpoints = endpoints.len();
            }
        }
        for (key, endpoints) in cell_dst {
            if let Some(cell) = matrix.cells.get_mut(&key) {
                cell.unique_dst_endpoints = endpoints.len();
            }
        }

        info!(
            cells = matrix.n_cells(),
            flows = matrix.total_flows,
            skipped,
            "policy matrix built"
        );
        matrix
    }

    fn resolve_src_sgt(&self, src_mac: &str) -> Option<u16> {
        let cluster = self.endpoint_to_cluster.get(src_mac)?;
        let sgt = self.cluster_to_sgt.get(cluster).copied();
        if sgt.is_none() {
            debug!(endpoint = src_mac, cluster, "source cluster has no SGT");
        }
        sgt
    }

    fn resolve_dst_sgt(&self, dst_ip: &str) -> Option<u16> {
        if let Some(mac) = self.ip_to_endpoint.get(dst_ip) {
            let cluster = self.endpoint_to_cluster.get(mac)?;
            return self.cluster_to_sgt.get(cluster).copied();
        }
        if self.ip_to_service.contains_key(dst_ip) {
            return Some(SERVICE_SGT);
        }
        None
    }
}
