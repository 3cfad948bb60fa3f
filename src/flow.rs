// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Decoded flow records as delivered by an external NetFlow collector.
//!
//! Clarion never parses NetFlow v5/v9/IPFIX itself; it consumes records a
//! collector has already decoded into this typed form. Records that cannot
//! identify their source endpoint (missing MAC) are rejected at the boundary
//! and counted, never processed.

use core::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport protocol of a flow record.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[serde(rename = "tcp", alias = "TCP")]
    Tcp,
    #[serde(rename = "udp", alias = "UDP")]
    Udp,
    #[serde(rename = "icmp", alias = "ICMP")]
    Icmp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        })
    }
}

impl FromStr for Protocol {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" | "TCP" => Ok(Protocol::Tcp),
            "udp" | "UDP" => Ok(Protocol::Udp),
            "icmp" | "ICMP" => Ok(Protocol::Icmp),
            other => Err(FlowError::UnknownProtocol(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum FlowError {
    /// The record carries no source MAC; it cannot be attributed to an
    /// endpoint and is dropped by the ingest path.
    #[error("flow record has no source MAC")]
    MissingSourceMac,
    #[error("unknown protocol {0:?}")]
    UnknownProtocol(String),
}

/// One unidirectional flow record, already decoded by the collector.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FlowRecord {
    /// Source endpoint MAC. Primary key for all sketches; normalized to
    /// lowercase on validation (equality is case-insensitive).
    pub src_mac: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: Protocol,
    pub bytes: u64,
    pub packets: u64,
    pub timestamp: DateTime<Utc>,
    pub switch_id: String,
    /// Service name, when the collector resolved the destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
}

impl FlowRecord {
    /// Validates the record for ingestion and normalizes the endpoint key.
    pub fn validate(mut self) -> Result<Self, FlowError> {
        if self.src_mac.trim().is_empty() {
            return Err(FlowError::MissingSourceMac);
        }
        self.src_mac = normalize_endpoint_id(&self.src_mac);
        Ok(self)
    }

    /// The `"proto/port"` key used by frequency sketches and matrix cells.
    pub fn port_key(&self) -> String {
        format!("{}/{}", self.proto, self.dst_port)
    }
}

/// Lowercases an endpoint identifier. MAC equality is case-insensitive byte
/// equality, so every store keys on this normalized form.
pub fn normalize_endpoint_id(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}
