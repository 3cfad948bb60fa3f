// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Deterministic hash family shared by the probabilistic sketches.
//!
//! Both HyperLogLog and Count-Min require hashes that are identical across
//! processes and architectures so that register-wise merges stay bit-exact.
//! MD5 over `seed ‖ item` gives that without platform-dependent state; the
//! first eight digest bytes, little-endian, form the 64-bit hash.

use md5::{Digest, Md5};

/// Hashes `item` under the given seed into a 64-bit value.
pub fn hash64(seed: u64, item: &[u8]) -> u64 {
    let mut h = Md5::new();
    h.update(seed.to_le_bytes());
    h.update(item);
    let digest = h.finalize();

    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(out)
}
