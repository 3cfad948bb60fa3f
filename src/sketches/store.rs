// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Bounded endpoint → sketch store for the edge.
//!
//! The switch cannot track every endpoint it ever saw; the store holds at
//! most `max_endpoints` sketches and evicts the one with the oldest
//! `last_seen` (ties broken by endpoint id, lexicographically) when a new
//! endpoint arrives at capacity. `StoreFull` is never surfaced to writers.
//!
//! Concurrency contract: a single writer mutates the store; readers get an
//! immutable snapshot via [`SketchStore::snapshot`]. The lock enforcing
//! this lives in the edge agent.

use std::collections::HashMap;

use crate::{flow::normalize_endpoint_id, sketches::endpoint::EndpointSketch};

#[derive(Debug)]
pub struct SketchStore {
    switch_id: String,
    max_endpoints: usize,
    sketches: HashMap<String, EndpointSketch>,
    evictions: u64,
}

impl SketchStore {
    pub fn new(switch_id: impl Into<String>, max_endpoints: usize) -> Self {
        assert!(max_endpoints > 0, "store capacity must be non-zero");
        Self {
            switch_id: switch_id.into(),
            max_endpoints,
            sketches: HashMap::with_capacity(max_endpoints),
            evictions: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.sketches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sketches.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_endpoints
    }

    /// Evictions performed since creation.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn get(&self, endpoint_id: &str) -> Option<&EndpointSketch> {
        self.sketches.get(&normalize_endpoint_id(endpoint_id))
    }

    pub fn get_mut(&mut self, endpoint_id: &str) -> Option<&mut EndpointSketch> {
        self.sketches.get_mut(&normalize_endpoint_id(endpoint_id))
    }

    /// Returns the sketch for an endpoint, creating it on first sight.
    /// At capacity, the stalest endpoint is evicted first.
    pub fn get_or_create(&mut self, endpoint_id: &str) -> &mut EndpointSketch {
        let key = normalize_endpoint_id(endpoint_id);

        if !self.sketches.contains_key(&key) {
            if self.sketches.len() >= self.max_endpoints {
                self.evict_stalest();
            }
            let sketch = EndpointSketch::new(key.clone(), Some(self.switch_id.clone()));
            self.sketches.insert(key.clone(), sketch);
        }

        self.sketches
            .get_mut(&key)
            .expect("sketch inserted above cannot be missing")
    }

    fn evict_stalest(&mut self) {
        // Oldest last_seen loses; endpoints never seen sort before any
        // timestamp, and ties fall to the lexicographically smaller id.
        let victim = self
            .sketches
            .values()
            .min_by(|a, b| {
                a.last_seen
                    .cmp(&b.last_seen)
                    .then_with(|| a.endpoint_id.cmp(&b.endpoint_id))
            })
            .map(|s| s.endpoint_id.clone());

        if let Some(id) = victim {
            self.sketches.remove(&id);
            self.evictions += 1;
        }
    }

    /// Immutable snapshot for concurrent readers and for sync batches.
    pub fn snapshot(&self) -> Vec<EndpointSketch> {
        self.sketches.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EndpointSketch> {
        self.sketches.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut EndpointSketch> {
        self.sketches.values_mut()
    }

    /// Total approximate memory held by resident sketches.
    pub fn memory_bytes(&self) -> usize {
        self.sketches.values().map(EndpointSketch::memory_bytes).sum()
    }
}
