//! Element-width selection and byte/element conversion.
//!
//! Collective counts are 32-bit signed quantities on the wire, so a large
//! aggregate send buffer cannot be addressed in bytes. The exchange instead
//! moves power-of-two-sized *elements*: the width is the smallest power of
//! two for which the whole send buffer is addressable, chosen once at setup
//! from the worst-case total so every rank agrees on it.

use crate::error::{Result, ShuffleError};
use crate::types::Rank;

/// Largest element count a collective can carry per destination.
pub const MAX_ELEMS: u64 = i32::MAX as u64;

/// A power-of-two element width, stored as its log2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementWidth {
    log2: u32,
}

impl ElementWidth {
    /// Smallest width whose element counts can address `total_bytes`.
    pub fn select(total_bytes: u64) -> Self {
        let mut log2 = 0;
        while (1u64 << log2) * MAX_ELEMS < total_bytes {
            log2 += 1;
        }
        Self { log2 }
    }

    pub const fn bytes(self) -> usize {
        1 << self.log2
    }

    /// Elements covering `bytes`, rounding the tail up.
    pub const fn elems(self, bytes: u64) -> u64 {
        bytes.div_ceil(1 << self.log2)
    }

    /// `bytes` rounded up to a whole number of elements.
    pub const fn padded(self, bytes: u64) -> u64 {
        self.elems(bytes) << self.log2
    }

    /// Pad bytes between a range of `bytes` and its element boundary.
    /// Always less than the width.
    pub const fn padding(self, bytes: u64) -> u64 {
        self.padded(bytes) - bytes
    }
}

/// Convert per-destination byte counts to element counts, rejecting any
/// destination whose padded count no longer fits the wire format.
pub fn elem_counts(width: ElementWidth, byte_counts: &[u64]) -> Result<Vec<u32>> {
    let mut counts = Vec::with_capacity(byte_counts.len());
    for (dest, &bytes) in byte_counts.iter().enumerate() {
        let elems = width.elems(bytes);
        if elems > MAX_ELEMS {
            return Err(ShuffleError::ElementOverflow {
                dest: dest as Rank,
                elements: elems,
                width: width.bytes(),
            });
        }
        counts.push(elems as u32);
    }
    Ok(counts)
}

/// Element displacements for send regions laid out at fixed strides of
/// `region_bytes`. `region_bytes` must be a multiple of the width.
pub fn region_displs(width: ElementWidth, region_bytes: usize, world: usize) -> Vec<u32> {
    let per_region = (region_bytes / width.bytes()) as u32;
    (0..world as u32).map(|i| i * per_region).collect()
}

/// Element displacements for counts packed back to back.
pub fn packed_displs(counts: &[u32]) -> Vec<u32> {
    let mut displs = Vec::with_capacity(counts.len());
    let mut off = 0u32;
    for &c in counts {
        displs.push(off);
        off += c;
    }
    displs
}
