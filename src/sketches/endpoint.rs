// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-endpoint behavioral fingerprint.
//!
//! Each endpoint (keyed by MAC) gets one sketch capturing, in bounded
//! memory, who it talks to (cardinality), what it uses (frequency), how
//! much (volume counters), and when (24-bit hour bitmap). The sketch is
//! built on the switch, shipped to the backend, and merged there when the
//! same endpoint is seen from several vantage points.
//!
//! Memory budget per endpoint stays under 30 KB:
//! - `unique_peers` / `unique_services` HLL (p=12): ~4 KB each
//! - `unique_ports` HLL (p=10): ~1 KB
//! - `port_frequency` CMS (500×4): ~16 KB
//! - `service_frequency` CMS (128×4): ~4 KB
//! - counters and metadata: well under 1 KB

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    flow::Protocol,
    sketches::{SketchError, countmin::CountMin, hyperloglog::HyperLogLog},
};

/// HLL precision for peer and service diversity.
const DIVERSITY_PRECISION: u8 = 12;
/// HLL precision for port diversity; ports have far lower cardinality.
const PORT_PRECISION: u8 = 10;
/// Port-frequency CMS dimensions.
const PORT_FREQ_WIDTH: u32 = 500;
const PORT_FREQ_DEPTH: u32 = 4;
/// Service-frequency CMS dimensions; fewer distinct services than ports.
const SERVICE_FREQ_WIDTH: u32 = 128;
const SERVICE_FREQ_DEPTH: u32 = 4;

/// Hours 8..=17, the bits counted as business hours.
const BUSINESS_HOURS_MASK: u32 = 0b0000_0011_1111_1111_0000_0000;

/// Common enterprise ports used as CMS top-k candidates; the CMS itself
/// does not remember keys.
pub const COMMON_PORT_KEYS: &[&str] = &[
    "tcp/443", "tcp/80", "tcp/22", "tcp/445", "tcp/389", "tcp/636", "tcp/88",
    "tcp/464", "tcp/135", "tcp/3389", "tcp/8080", "tcp/8443", "tcp/3128",
    "tcp/53", "udp/53", "udp/123", "udp/161", "udp/500", "udp/4500", "tcp/25",
    "tcp/587", "tcp/993", "tcp/995", "tcp/143", "tcp/1433", "tcp/3306",
    "tcp/5432", "tcp/1521", "tcp/27017", "tcp/6379", "tcp/5672", "tcp/9092",
];

#[derive(Debug, Clone)]
pub struct EndpointSketch {
    // Identity
    pub endpoint_id: String,
    pub switch_id: Option<String>,
    pub device_id: Option<String>,

    // Cardinality sketches
    pub unique_peers: HyperLogLog,
    pub unique_services: HyperLogLog,
    pub unique_ports: HyperLogLog,

    // Frequency sketches
    pub port_frequency: CountMin,
    pub service_frequency: CountMin,

    // Volume counters
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
    pub flow_count: u64,

    // Temporal
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    /// 24-bit bitmap; bit `h` set iff any flow was seen at hour `h`.
    pub active_hours: u32,

    // Local clustering state (edge-computed)
    pub local_cluster_id: i64,
    /// Monotonically increasing change counter for sync tracking.
    pub version: u64,

    // Identity enrichment (backend-populated; empty until resolved)
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub ad_groups: Vec<String>,
    pub ise_profile: Option<String>,
    pub device_type: Option<String>,
}

impl EndpointSketch {
    pub fn new(endpoint_id: impl Into<String>, switch_id: Option<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            switch_id,
            device_id: None,
            unique_peers: HyperLogLog::new(DIVERSITY_PRECISION),
            unique_services: HyperLogLog::new(DIVERSITY_PRECISION),
            unique_ports: HyperLogLog::new(PORT_PRECISION),
            port_frequency: CountMin::new(PORT_FREQ_WIDTH, PORT_FREQ_DEPTH),
            service_frequency: CountMin::new(SERVICE_FREQ_WIDTH, SERVICE_FREQ_DEPTH),
            bytes_in: 0,
            bytes_out: 0,
            packets_in: 0,
            packets_out: 0,
            flow_count: 0,
            first_seen: None,
            last_seen: None,
            active_hours: 0,
            local_cluster_id: -1,
            version: 0,
            user_id: None,
            username: None,
            ad_groups: Vec::new(),
            ise_profile: None,
            device_type: None,
        }
    }

    /// Records an outbound flow from this endpoint.
    #[allow(clippy::too_many_arguments)]
    pub fn record_outbound(
        &mut self,
        dst_ip: &str,
        dst_port: u16,
        proto: Protocol,
        bytes: u64,
        packets: u64,
        ts: DateTime<Utc>,
        service_name: Option<&str>,
    ) {
        self.unique_peers.add(dst_ip.as_bytes());

        let port_key = format!("{proto}/{dst_port}");
        self.unique_ports.add(port_key.as_bytes());
        self.port_frequency.add(port_key.as_bytes(), 1);

        if let Some(service) = service_name {
            self.unique_services.add(service.as_bytes());
            self.service_frequency.add(service.as_bytes(), 1);
        }

        self.bytes_out = self.bytes_out.saturating_add(bytes);
        self.packets_out = self.packets_out.saturating_add(packets);
        self.flow_count += 1;

        self.touch(ts);
        self.version += 1;
    }

    /// Records an inbound flow. The synthetic `listen:` token makes server
    /// behavior discoverable through the port-frequency sketch.
    pub fn record_inbound(
        &mut self,
        _src_ip: &str,
        _src_port: u16,
        dst_port: u16,
        proto: Protocol,
        bytes: u64,
        packets: u64,
        ts: DateTime<Utc>,
    ) {
        let listen_key = format!("listen:{proto}/{dst_port}");
        self.port_frequency.add(listen_key.as_bytes(), 1);

        self.bytes_in = self.bytes_in.saturating_add(bytes);
        self.packets_in = self.packets_in.saturating_add(packets);
        self.flow_count += 1;

        self.touch(ts);
        self.version += 1;
    }

    fn touch(&mut self, ts: DateTime<Utc>) {
        if self.first_seen.is_none_or(|f| ts < f) {
            self.first_seen = Some(ts);
        }
        if self.last_seen.is_none_or(|l| ts > l) {
            self.last_seen = Some(ts);
        }
        self.active_hours |= 1 << ts.hour();
    }

    /// Merges another sketch of the same endpoint (seen from another
    /// switch or in an earlier sync batch). Sub-sketch merges are
    /// commutative and associative, so arrival order does not matter.
    pub fn merge(&mut self, other: &EndpointSketch) -> Result<(), SketchError> {
        if self.endpoint_id != other.endpoint_id {
            return Err(SketchError::EndpointMismatch {
                ours: self.endpoint_id.clone(),
                theirs: other.endpoint_id.clone(),
            });
        }

        self.unique_peers.merge(&other.unique_peers)?;
        self.unique_services.merge(&other.unique_services)?;
        self.unique_ports.merge(&other.unique_ports)?;
        self.port_frequency.merge(&other.port_frequency)?;
        self.service_frequency.merge(&other.service_frequency)?;

        self.bytes_in = self.bytes_in.saturating_add(other.bytes_in);
        self.bytes_out = self.bytes_out.saturating_add(other.bytes_out);
        self.packets_in = self.packets_in.saturating_add(other.packets_in);
        self.packets_out = self.packets_out.saturating_add(other.packets_out);
        self.flow_count = self.flow_count.saturating_add(other.flow_count);

        if let Some(f) = other.first_seen
            && self.first_seen.is_none_or(|ours| f < ours)
        {
            self.first_seen = Some(f);
        }
        if let Some(l) = other.last_seen
            && self.last_seen.is_none_or(|ours| l > ours)
        {
            self.last_seen = Some(l);
        }
        self.active_hours |= other.active_hours;

        // Enrichment is adopted only where we have nothing locally.
        if self.user_id.is_none() && other.user_id.is_some() {
            self.user_id = other.user_id.clone();
            self.username = other.username.clone();
        }
        if self.ad_groups.is_empty() && !other.ad_groups.is_empty() {
            self.ad_groups = other.ad_groups.clone();
        }
        if self.ise_profile.is_none() {
            self.ise_profile = other.ise_profile.clone();
        }
        if self.device_type.is_none() {
            self.device_type = other.device_type.clone();
        }

        self.version += 1;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Derived queries (no mutation)

    pub fn peer_diversity(&self) -> u64 {
        self.unique_peers.count()
    }

    pub fn service_diversity(&self) -> u64 {
        self.unique_services.count()
    }

    pub fn port_diversity(&self) -> u64 {
        self.unique_ports.count()
    }

    /// Fraction of bytes received once both directions have been seen;
    /// 0.5 (balanced) until then. Values above 0.5 mean the endpoint
    /// receives more than it sends.
    pub fn in_out_ratio(&self) -> f64 {
        if self.bytes_in == 0 || self.bytes_out == 0 {
            return 0.5;
        }
        let total = self.bytes_in + self.bytes_out;
        self.bytes_in as f64 / total as f64
    }

    /// Servers receive more than they send and serve a bounded client set.
    pub fn is_likely_server(&self) -> bool {
        self.in_out_ratio() > 0.6 && self.peer_diversity() < 100
    }

    pub fn active_hour_count(&self) -> u32 {
        self.active_hours.count_ones()
    }

    /// Fraction of active hours falling in 8..=17; 0.0 when never active.
    pub fn business_hours_ratio(&self) -> f64 {
        let total = self.active_hour_count();
        if total == 0 {
            return 0.0;
        }
        f64::from((self.active_hours & BUSINESS_HOURS_MASK).count_ones()) / f64::from(total)
    }

    /// Top-k ports over the common enterprise candidate table.
    pub fn top_ports(&self, k: usize) -> Vec<(&'static str, u64)> {
        self.port_frequency.top_k(COMMON_PORT_KEYS, k)
    }

    pub fn memory_bytes(&self) -> usize {
        self.unique_peers.memory_bytes()
            + self.unique_services.memory_bytes()
            + self.unique_ports.memory_bytes()
            + self.port_frequency.memory_bytes()
            + self.service_frequency.memory_bytes()
            + 512
    }

    // ─────────────────────────────────────────────────────────────────────
    // Wire form: format tag, identity strings, sub-sketch frames, counters,
    // temporal bounds, cluster state, enrichment. Every variable-length
    // field carries a length prefix; decode failures are `InvalidFormat`.

    const FORMAT_VERSION: u8 = 1;

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.memory_bytes());
        buf.put_u8(Self::FORMAT_VERSION);

        put_str(&mut buf, &self.endpoint_id);
        put_opt_str(&mut buf, self.switch_id.as_deref());
        put_opt_str(&mut buf, self.device_id.as_deref());

        for sketch in [
            self.unique_peers.serialize(),
            self.unique_services.serialize(),
            self.unique_ports.serialize(),
        ] {
            buf.put_u32_le(sketch.len() as u32);
            buf.put_slice(&sketch);
        }
        for sketch in [
            self.port_frequency.serialize(),
            self.service_frequency.serialize(),
        ] {
            buf.put_u32_le(sketch.len() as u32);
            buf.put_slice(&sketch);
        }

        buf.put_u64_le(self.bytes_in);
        buf.put_u64_le(self.bytes_out);
        buf.put_u64_le(self.packets_in);
        buf.put_u64_le(self.packets_out);
        buf.put_u64_le(self.flow_count);

        put_opt_ts(&mut buf, self.first_seen);
        put_opt_ts(&mut buf, self.last_seen);
        buf.put_u32_le(self.active_hours);
        buf.put_i64_le(self.local_cluster_id);
        buf.put_u64_le(self.version);

        put_opt_str(&mut buf, self.user_id.as_deref());
        put_opt_str(&mut buf, self.username.as_deref());
        buf.put_u16_le(self.ad_groups.len() as u16);
        for g in &self.ad_groups {
            put_str(&mut buf, g);
        }
        put_opt_str(&mut buf, self.ise_profile.as_deref());
        put_opt_str(&mut buf, self.device_type.as_deref());

        buf.freeze()
    }

    pub fn deserialize(mut data: &[u8]) -> Result<Self, SketchError> {
        let version = get_u8(&mut data)?;
        if version != Self::FORMAT_VERSION {
            return Err(SketchError::InvalidFormat(format!(
                "unsupported sketch format {version}"
            )));
        }

        let endpoint_id = get_str(&mut data)?;
        let switch_id = get_opt_str(&mut data)?;
        let device_id = get_opt_str(&mut data)?;

        let unique_peers = HyperLogLog::deserialize(&get_frame(&mut data)?)?;
        let unique_services = HyperLogLog::deserialize(&get_frame(&mut data)?)?;
        let unique_ports = HyperLogLog::deserialize(&get_frame(&mut data)?)?;
        let port_frequency = CountMin::deserialize(&get_frame(&mut data)?)?;
        let service_frequency = CountMin::deserialize(&get_frame(&mut data)?)?;

        let bytes_in = get_u64(&mut data)?;
        let bytes_out = get_u64(&mut data)?;
        let packets_in = get_u64(&mut data)?;
        let packets_out = get_u64(&mut data)?;
        let flow_count = get_u64(&mut data)?;

        let first_seen = get_opt_ts(&mut data)?;
        let last_seen = get_opt_ts(&mut data)?;
        let active_hours = get_u32(&mut data)?;
        let local_cluster_id = get_i64(&mut data)?;
        let version = get_u64(&mut data)?;

        let user_id = get_opt_str(&mut data)?;
        let username = get_opt_str(&mut data)?;
        let n_groups = get_u16(&mut data)?;
        let mut ad_groups = Vec::with_capacity(usize::from(n_groups));
        for _ in 0..n_groups {
            ad_groups.push(get_str(&mut data)?);
        }
        let ise_profile = get_opt_str(&mut data)?;
        let device_type = get_opt_str(&mut data)?;

        Ok(Self {
            endpoint_id,
            switch_id,
            device_id,
            unique_peers,
            unique_services,
            unique_ports,
            port_frequency,
            service_frequency,
            bytes_in,
            bytes_out,
            packets_in,
            packets_out,
            flow_count,
            first_seen,
            last_seen,
            active_hours,
            local_cluster_id,
            version,
            user_id,
            username,
            ad_groups,
            ise_profile,
            device_type,
        })
    }

    /// Structured summary for the JSON sync envelope.
    pub fn summary(&self) -> SketchSummary {
        SketchSummary {
            endpoint_id: self.endpoint_id.clone(),
            switch_id: self.switch_id.clone(),
            device_id: self.device_id.clone(),
            unique_peers_count: self.peer_diversity(),
            unique_services_count: self.service_diversity(),
            unique_ports_count: self.port_diversity(),
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
            packets_in: self.packets_in,
            packets_out: self.packets_out,
            flow_count: self.flow_count,
            in_out_ratio: self.in_out_ratio(),
            first_seen: self.first_seen.map(|t| t.timestamp()),
            last_seen: self.last_seen.map(|t| t.timestamp()),
            active_hours: self.active_hours,
            local_cluster_id: self.local_cluster_id,
            version: self.version,
            username: self.username.clone(),
            ad_groups: self.ad_groups.clone(),
            ise_profile: self.ise_profile.clone(),
            device_type: self.device_type.clone(),
        }
    }
}

/// JSON-surviving view of an [`EndpointSketch`]: numbers, strings, flags,
/// the hour bitmap as an integer, and sketch-derived counts in place of
/// register state.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SketchSummary {
    pub endpoint_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub unique_peers_count: u64,
    pub unique_services_count: u64,
    pub unique_ports_count: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
    pub flow_count: u64,
    pub in_out_ratio: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
    pub active_hours: u32,
    pub local_cluster_id: i64,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ad_groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ise_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────
// Buffer helpers

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_opt_str(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s);
        },
        None => buf.put_u8(0),
    }
}

fn put_opt_ts(buf: &mut BytesMut, ts: Option<DateTime<Utc>>) {
    buf.put_i64_le(ts.map_or(i64::MIN, |t| t.timestamp_millis()));
}

fn need(data: &[u8], n: usize) -> Result<(), SketchError> {
    if data.remaining() < n {
        return Err(SketchError::InvalidFormat(format!(
            "truncated sketch payload: need {n} bytes, have {}",
            data.remaining()
        )));
    }
    Ok(())
}

fn get_u8(data: &mut &[u8]) -> Result<u8, SketchError> {
    need(data, 1)?;
    Ok(data.get_u8())
}

fn get_u16(data: &mut &[u8]) -> Result<u16, SketchError> {
    need(data, 2)?;
    Ok(data.get_u16_le())
}

fn get_u32(data: &mut &[u8]) -> Result<u32, SketchError> {
    need(data, 4)?;
    Ok(data.get_u32_le())
}

fn get_u64(data: &mut &[u8]) -> Result<u64, SketchError> {
    need(data, 8)?;
    Ok(data.get_u64_le())
}

fn get_i64(data: &mut &[u8]) -> Result<i64, SketchError> {
    need(data, 8)?;
    Ok(data.get_i64_le())
}

fn get_str(data: &mut &[u8]) -> Result<String, SketchError> {
    let len = usize::from(get_u16(data)?);
    need(data, len)?;
    let (head, rest) = data.split_at(len);
    let s = std::str::from_utf8(head)
        .map_err(|_| SketchError::InvalidFormat("non-UTF8 string field".into()))?
        .to_string();
    *data = rest;
    Ok(s)
}

fn get_opt_str(data: &mut &[u8]) -> Result<Option<String>, SketchError> {
    match get_u8(data)? {
        0 => Ok(None),
        1 => Ok(Some(get_str(data)?)),
        tag => Err(SketchError::InvalidFormat(format!(
            "invalid option tag {tag}"
        ))),
    }
}

fn get_opt_ts(data: &mut &[u8]) -> Result<Option<DateTime<Utc>>, SketchError> {
    let millis = get_i64(data)?;
    if millis == i64::MIN {
        return Ok(None);
    }
    match Utc.timestamp_millis_opt(millis) {
        chrono::LocalResult::Single(ts) => Ok(Some(ts)),
        _ => Err(SketchError::InvalidFormat(format!(
            "timestamp {millis} out of range"
        ))),
    }
}

fn get_frame(data: &mut &[u8]) -> Result<Bytes, SketchError> {
    let len = get_u32(data)? as usize;
    need(data, len)?;
    let (head, rest) = data.split_at(len);
    let frame = Bytes::copy_from_slice(head);
    *data = rest;
    Ok(frame)
}
