// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Identity resolution: join endpoint keys to user, device, and group
//! context from external directories.
//!
//! The directory subsystem (ISE sessions, Active Directory, endpoint
//! inventory) is an external collaborator; the core depends only on the
//! four lookup capabilities of [`DirectoryLookups`]. Resolution failure is
//! silent: enrichment fields stay empty and the confidence grade records
//! the gap; nothing here is ever fatal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::sketches::endpoint::EndpointSketch;

/// Groups whose membership marks an endpoint as privileged.
pub const PRIVILEGED_GROUPS: &[&str] = &["Privileged-IT", "Network-Admins", "DevOps"];

/// Device record from the endpoint inventory.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EndpointRecord {
    pub mac: String,
    pub device_id: Option<String>,
    pub device_type: Option<String>,
    pub os: Option<String>,
    pub hostname: Option<String>,
}

/// One authentication session. `session_by_mac` returns the most recent.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SessionRecord {
    pub mac: String,
    pub username: Option<String>,
    pub endpoint_profile: Option<String>,
    pub auth_method: Option<String>,
    pub session_start: DateTime<Utc>,
}

/// User record from the directory.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct UserRecord {
    pub user_id: String,
    pub username: String,
    pub email: Option<String>,
    pub department: Option<String>,
    pub title: Option<String>,
}

/// The four read-only lookups the directory subsystem provides.
pub trait DirectoryLookups: Send + Sync {
    fn endpoint_by_mac(&self, mac: &str) -> Option<EndpointRecord>;
    /// Most recent session for the MAC, by `session_start`.
    fn session_by_mac(&self, mac: &str) -> Option<SessionRecord>;
    /// Case-insensitive username lookup.
    fn user_by_name(&self, username: &str) -> Option<UserRecord>;
    fn groups_of_user(&self, user_id: &str) -> Vec<String>;
}

/// Resolved identity context for one endpoint.
///
/// Confidence grades: 0.3 with only a device record, 0.8 with a session
/// but no directory user, 1.0 when the full chain resolves.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct IdentityContext {
    pub endpoint_id: String,
    pub device_id: Option<String>,
    pub device_type: Option<String>,
    pub os: Option<String>,
    pub hostname: Option<String>,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub department: Option<String>,
    pub title: Option<String>,
    pub ise_profile: Option<String>,
    pub auth_method: Option<String>,
    pub ad_groups: Vec<String>,
    pub confidence: f64,
    pub resolution_source: String,
}

impl IdentityContext {
    pub fn has_user(&self) -> bool {
        self.username.is_some()
    }

    pub fn has_groups(&self) -> bool {
        !self.ad_groups.is_empty()
    }

    pub fn is_privileged(&self) -> bool {
        self.ad_groups
            .iter()
            .any(|g| PRIVILEGED_GROUPS.contains(&g.as_str()))
    }
}

/// Composes the directory lookups into sketch enrichment.
pub struct IdentityResolver<'a> {
    directory: &'a dyn DirectoryLookups,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(directory: &'a dyn DirectoryLookups) -> Self {
        Self { directory }
    }

    /// Walks the resolution chain MAC → device → session → user → groups.
    /// Each step that fails leaves the rest empty.
    pub fn resolve(&self, endpoint_id: &str) -> IdentityContext {
        let mut ctx = IdentityContext {
            endpoint_id: endpoint_id.to_string(),
            resolution_source: "unknown".to_string(),
            ..IdentityContext::default()
        };

        if let Some(endpoint) = self.directory.endpoint_by_mac(endpoint_id) {
            ctx.device_id = endpoint.device_id;
            ctx.device_type = endpoint.device_type;
            ctx.os = endpoint.os;
            ctx.hostname = endpoint.hostname;
            ctx.confidence = 0.3;
            ctx.resolution_source = "endpoint_inventory".to_string();
        }

        if let Some(session) = self.directory.session_by_mac(endpoint_id) {
            ctx.ise_profile = session.endpoint_profile;
            ctx.auth_method = session.auth_method;

            if let Some(username) = session.username.filter(|u| !u.is_empty()) {
                ctx.username = Some(username.clone());
                ctx.confidence = 0.8;
                ctx.resolution_source = "ise_session".to_string();

                if let Some(user) = self.directory.user_by_name(&username) {
                    ctx.user_id = Some(user.user_id.clone());
                    ctx.email = user.email;
                    ctx.department = user.department;
                    ctx.title = user.title;
                    ctx.confidence = 1.0;
                    ctx.resolution_source = "active_directory".to_string();

                    ctx.ad_groups = self.directory.groups_of_user(&user.user_id);
                }
            }
        }

        ctx
    }

    /// Resolves and applies the context to a sketch. Counters are never
    /// touched; only enrichment fields change.
    pub fn enrich_sketch(&self, sketch: &mut EndpointSketch) -> IdentityContext {
        let ctx = self.resolve(&sketch.endpoint_id);

        sketch.device_id = ctx.device_id.clone();
        sketch.device_type = ctx.device_type.clone();
        sketch.user_id = ctx.user_id.clone();
        sketch.username = ctx.username.clone();
        sketch.ad_groups = ctx.ad_groups.clone();
        sketch.ise_profile = ctx.ise_profile.clone();

        ctx
    }

    /// Enriches every sketch in the batch; returns per-endpoint contexts.
    pub fn enrich_all(
        &self,
        sketches: &mut [EndpointSketch],
    ) -> Vec<IdentityContext> {
        let mut contexts = Vec::with_capacity(sketches.len());
        let mut resolved_users = 0usize;

        for sketch in sketches.iter_mut() {
            let ctx = self.enrich_sketch(sketch);
            if ctx.has_user() {
                resolved_users += 1;
            } else {
                debug!(endpoint = %sketch.endpoint_id, "no identity resolved");
            }
            contexts.push(ctx);
        }

        info!(
            total = sketches.len(),
            with_users = resolved_users,
            "identity enrichment complete"
        );
        contexts
    }
}
