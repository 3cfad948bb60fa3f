// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Count-Min frequency sketch.
//!
//! Tracks item frequencies in fixed memory: a `depth × width` counter
//! matrix with one hash function per row. Queries return the minimum
//! counter across rows, so estimates only ever overestimate (collisions
//! add, they never subtract). Merging equal-dimension sketches is matrix
//! addition.
//!
//! The sketch does not remember keys; [`CountMin::top_k`] ranks a
//! caller-supplied candidate list instead.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::sketches::{SketchError, hash::hash64};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountMin {
    width: u32,
    depth: u32,
    counters: Vec<u64>,
    total: u64,
}

impl CountMin {
    /// Creates an empty sketch. The endpoint sketch uses 500×4 for ports
    /// and 200×4 for services.
    pub fn new(width: u32, depth: u32) -> Self {
        assert!(width > 0 && depth > 0, "CMS dimensions must be non-zero");
        Self {
            width,
            depth,
            counters: vec![0u64; (width * depth) as usize],
            total: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    #[inline]
    fn index(&self, row: u32, item: &[u8]) -> usize {
        // One independent hash function per row: the row index is the seed.
        let col = hash64(u64::from(row), item) % u64::from(self.width);
        (row * self.width + col as u32) as usize
    }

    /// Adds `n` occurrences of an item.
    pub fn add(&mut self, item: &[u8], n: u64) {
        for row in 0..self.depth {
            let idx = self.index(row, item);
            self.counters[idx] = self.counters[idx].saturating_add(n);
        }
        self.total = self.total.saturating_add(n);
    }

    /// Estimated frequency: minimum across rows, never below the truth.
    pub fn count(&self, item: &[u8]) -> u64 {
        (0..self.depth)
            .map(|row| self.counters[self.index(row, item)])
            .min()
            .unwrap_or(0)
    }

    /// Total of all additions, exact.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Ranks `candidates` by estimated count, descending, keeping the top
    /// `k` with non-zero estimates.
    pub fn top_k<'a>(&self, candidates: &[&'a str], k: usize) -> Vec<(&'a str, u64)> {
        let mut out: Vec<(&str, u64)> = candidates
            .iter()
            .map(|c| (*c, self.count(c.as_bytes())))
            .filter(|(_, n)| *n > 0)
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        out.truncate(k);
        out
    }

    /// Matrix addition. Fails when dimensions differ.
    pub fn merge(&mut self, other: &CountMin) -> Result<(), SketchError> {
        if self.width != other.width || self.depth != other.depth {
            return Err(SketchError::IncompatibleSketch(format!(
                "CMS dimensions {}x{} vs {}x{}",
                self.width, self.depth, other.width, other.depth
            )));
        }
        for (a, &b) in self.counters.iter_mut().zip(&other.counters) {
            *a = a.saturating_add(b);
        }
        self.total = self.total.saturating_add(other.total);
        Ok(())
    }

    pub fn memory_bytes(&self) -> usize {
        self.counters.len() * 8 + 24
    }

    // ─────────────────────────────────────────────────────────────────────
    // Wire form: width, depth, total, then the counter matrix row-major.

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + 4 + 8 + self.counters.len() * 8);
        buf.put_u32_le(self.width);
        buf.put_u32_le(self.depth);
        buf.put_u64_le(self.total);
        for &c in &self.counters {
            buf.put_u64_le(c);
        }
        buf.freeze()
    }

    pub fn deserialize(mut data: &[u8]) -> Result<Self, SketchError> {
        if data.remaining() < 16 {
            return Err(SketchError::InvalidFormat("CMS header truncated".into()));
        }
        let width = data.get_u32_le();
        let depth = data.get_u32_le();
        let total = data.get_u64_le();
        if width == 0 || depth == 0 {
            return Err(SketchError::InvalidFormat(format!(
                "CMS dimensions {width}x{depth} invalid"
            )));
        }
        let n = (width as usize) * (depth as usize);
        if data.remaining() != n * 8 {
            return Err(SketchError::InvalidFormat(format!(
                "CMS counter payload is {} bytes, expected {}",
                data.remaining(),
                n * 8
            )));
        }
        let mut counters = Vec::with_capacity(n);
        for _ in 0..n {
            counters.push(data.get_u64_le());
        }
        Ok(Self {
            width,
            depth,
            counters,
            total,
        })
    }
}
