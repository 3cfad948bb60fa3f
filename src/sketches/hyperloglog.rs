// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! HyperLogLog cardinality sketch.
//!
//! Estimates the number of distinct items in a stream with fixed memory:
//! `2^p` one-byte registers, expected relative error ≈ `1.04 / sqrt(2^p)`.
//! Used for peer/service/port diversity inside an [`EndpointSketch`].
//!
//! Register update: the top `p` bits of the 64-bit item hash select the
//! register; the count of trailing zeros in the remaining bits, plus one,
//! is max-combined into it. Merging two sketches of equal precision is a
//! register-wise max, which makes merge commutative, associative, and
//! bit-exact across processes.
//!
//! [`EndpointSketch`]: crate::sketches::endpoint::EndpointSketch

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::sketches::{SketchError, hash::hash64};

/// Hash seed reserved for cardinality sketches. Frequency sketches use the
/// row index as seed; keeping this out of the small-integer range avoids
/// sharing a hash function with any CMS row.
const HLL_SEED: u64 = 0x48_4c_4c;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HyperLogLog {
    precision: u8,
    registers: Vec<u8>,
}

impl HyperLogLog {
    /// Creates an empty sketch with `2^precision` registers.
    ///
    /// Precision must lie in `4..=16`; the endpoint sketch uses 10–12.
    pub fn new(precision: u8) -> Self {
        assert!(
            (4..=16).contains(&precision),
            "HLL precision out of range: {precision}"
        );
        Self {
            precision,
            registers: vec![0u8; 1 << precision],
        }
    }

    pub fn precision(&self) -> u8 {
        self.precision
    }

    /// Adds one item. Duplicates do not change the estimate.
    pub fn add(&mut self, item: &[u8]) {
        let hash = hash64(HLL_SEED, item);
        let idx = (hash >> (64 - self.precision)) as usize;

        // Remaining bits after the register index; a fully-zero remainder
        // yields the maximum rank.
        let rest = hash << self.precision;
        let max_rank = 64 - u32::from(self.precision);
        let rank = if rest == 0 {
            max_rank + 1
        } else {
            hash.trailing_zeros().min(max_rank) + 1
        };
        let rank = rank as u8;

        if rank > self.registers[idx] {
            self.registers[idx] = rank;
        }
    }

    /// Bias-corrected cardinality estimate.
    pub fn count(&self) -> u64 {
        let m = self.registers.len() as f64;

        let mut sum = 0.0f64;
        let mut zeros = 0u64;
        for &r in &self.registers {
            sum += 2f64.powi(-i32::from(r));
            if r == 0 {
                zeros += 1;
            }
        }

        let alpha = match self.registers.len() {
            16 => 0.673,
            32 => 0.697,
            64 => 0.709,
            n => 0.7213 / (1.0 + 1.079 / n as f64),
        };

        let raw = alpha * m * m / sum;

        // Small-range correction: linear counting while empty registers
        // remain and the raw estimate is below 2.5m.
        let corrected = if raw <= 2.5 * m && zeros > 0 {
            m * (m / zeros as f64).ln()
        } else if raw > (1u64 << 32) as f64 / 30.0 {
            // Large-range correction for hash saturation.
            let two32 = (1u64 << 32) as f64;
            -two32 * (1.0 - raw / two32).ln()
        } else {
            raw
        };

        corrected.round().max(0.0) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.registers.iter().all(|&r| r == 0)
    }

    /// Register-wise max merge. Fails when precisions differ.
    pub fn merge(&mut self, other: &HyperLogLog) -> Result<(), SketchError> {
        if self.precision != other.precision {
            return Err(SketchError::IncompatibleSketch(format!(
                "HLL precision {} vs {}",
                self.precision, other.precision
            )));
        }
        for (a, &b) in self.registers.iter_mut().zip(&other.registers) {
            if b > *a {
                *a = b;
            }
        }
        Ok(())
    }

    /// Approximate resident size in bytes.
    pub fn memory_bytes(&self) -> usize {
        self.registers.len() + 16
    }

    // ─────────────────────────────────────────────────────────────────────
    // Wire form: precision byte, then the raw register array.

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.registers.len());
        buf.put_u8(self.precision);
        buf.put_slice(&self.registers);
        buf.freeze()
    }

    pub fn deserialize(mut data: &[u8]) -> Result<Self, SketchError> {
        if data.remaining() < 1 {
            return Err(SketchError::InvalidFormat("empty HLL payload".into()));
        }
        let precision = data.get_u8();
        if !(4..=16).contains(&precision) {
            return Err(SketchError::InvalidFormat(format!(
                "HLL precision {precision} out of range"
            )));
        }
        let m = 1usize << precision;
        if data.remaining() != m {
            return Err(SketchError::InvalidFormat(format!(
                "HLL register payload is {} bytes, expected {m}",
                data.remaining()
            )));
        }
        Ok(Self {
            precision,
            registers: data.to_vec(),
        })
    }
}
