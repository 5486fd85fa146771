//! Send-side buffers: private per-thread stage buffers and the shared
//! per-destination send slots.
//!
//! A [`SendSlot`] is one generation of the process-wide send buffer: a byte
//! region split into `world` fixed-capacity destination regions, with one
//! cache-padded atomic fill offset per region. Threads claim disjoint ranges
//! with a bounded fetch-add and copy into them without further coordination;
//! the flusher reads the region only after the two-barrier rendezvous has
//! quiesced all writers.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// Atomically add `add` to `off` unless the result would pass `ceiling`.
/// Returns the pre-add value on success.
pub(crate) fn fetch_add_bounded(off: &AtomicU64, add: u64, ceiling: u64) -> Option<u64> {
    off.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
        (cur + add <= ceiling).then_some(cur + add)
    })
    .ok()
}

/// Byte region written concurrently at disjoint reserved offsets.
///
/// Safety protocol: a range may be written only after it was claimed through
/// the slot's bounded fetch-add, and the whole region may be read only while
/// no writer holds an unwritten claim (the flush rendezvous guarantees this).
struct SharedRegion {
    data: UnsafeCell<Box<[u8]>>,
}

unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    fn new(len: usize) -> Self {
        Self {
            data: UnsafeCell::new(vec![0u8; len].into_boxed_slice()),
        }
    }

    /// # Safety
    /// The caller must hold a claim on `off..off + src.len()` and no reader
    /// may be active.
    unsafe fn write(&self, off: usize, src: &[u8]) {
        let data = unsafe { &mut *self.data.get() };
        data[off..off + src.len()].copy_from_slice(src);
    }

    /// # Safety
    /// No writer may hold an unwritten claim for the returned lifetime.
    unsafe fn as_slice(&self) -> &[u8] {
        unsafe { &*self.data.get() }
    }
}

pub(crate) struct SendSlot {
    region: SharedRegion,
    dest_cap: usize,
    offsets: Box<[CachePadded<AtomicU64>]>,
}

impl SendSlot {
    pub(crate) fn new(world: usize, dest_cap: usize) -> Self {
        Self {
            region: SharedRegion::new(world * dest_cap),
            dest_cap,
            offsets: (0..world)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
        }
    }

    /// Claim `len` bytes in destination `dest`'s region. Returns the claimed
    /// start offset within the region, or `None` when the region cannot hold
    /// the claim.
    pub(crate) fn try_reserve(&self, dest: usize, len: u64) -> Option<u64> {
        fetch_add_bounded(&self.offsets[dest], len, self.dest_cap as u64)
    }

    /// Current fill of destination `dest`'s region.
    pub(crate) fn offset(&self, dest: usize) -> u64 {
        self.offsets[dest].load(Ordering::Acquire)
    }

    /// Copy a claimed range into place.
    ///
    /// # Safety
    /// `off` must come from a [`try_reserve`](SendSlot::try_reserve) claim of
    /// at least `src.len()` bytes for this `dest`, written at most once.
    pub(crate) unsafe fn copy_in(&self, dest: usize, off: u64, src: &[u8]) {
        debug_assert!(off as usize + src.len() <= self.dest_cap);
        unsafe {
            self.region.write(dest * self.dest_cap + off as usize, src);
        }
    }

    /// The whole slot region, for the flusher.
    ///
    /// # Safety
    /// All writers must have completed their claims (post-rendezvous).
    pub(crate) unsafe fn bytes(&self) -> &[u8] {
        unsafe { self.region.as_slice() }
    }

    /// Empty all destination regions for reuse.
    pub(crate) fn reset(&self) {
        for off in self.offsets.iter() {
            off.store(0, Ordering::Release);
        }
    }
}

/// One worker thread's private stage buffers, one per destination.
pub(crate) struct ThreadBufs {
    bufs: Vec<Vec<u8>>,
    cap: usize,
}

impl ThreadBufs {
    pub(crate) fn new(world: usize, cap: usize) -> Self {
        Self {
            bufs: (0..world).map(|_| Vec::with_capacity(cap)).collect(),
            cap,
        }
    }

    pub(crate) fn cap(&self) -> usize {
        self.cap
    }

    pub(crate) fn has_room(&self, dest: usize, len: usize) -> bool {
        self.bufs[dest].len() + len <= self.cap
    }

    pub(crate) fn push(&mut self, dest: usize, key: &[u8], value: &[u8]) {
        crate::record::write_record(&mut self.bufs[dest], key, value);
    }

    pub(crate) fn len(&self, dest: usize) -> usize {
        self.bufs[dest].len()
    }

    pub(crate) fn bytes(&self, dest: usize) -> &[u8] {
        &self.bufs[dest]
    }

    pub(crate) fn clear(&mut self, dest: usize) {
        self.bufs[dest].clear();
    }
}
