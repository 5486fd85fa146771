//! Hash tables behind the grouping engine.
//!
//! Both tables are chained hash maps whose nodes live in growable slabs and
//! chain through `u32` indices (`NIL` terminated), so entries stay valid as
//! the slabs grow and the table needs no per-node allocation. Key bytes are
//! copied into a [`Pool`] arena and addressed by [`PoolRef`].
//!
//! [`ReducerTable`] accumulates per-key value statistics for the grouping
//! pass, carving its bookkeeping into partitions of bounded payload size.
//! [`CombinerTable`] deduplicates keys ahead of the exchange so a caller can
//! merge values in place of re-emitting.

use crate::arena::{Pool, PoolRef};
use crate::types::hash_key;

pub(crate) const NIL: u32 = u32::MAX;

/// Per-key accumulator in a [`ReducerTable`].
#[derive(Debug)]
pub struct Unique {
    key: PoolRef,
    /// Values seen for this key, across all partitions.
    pub nvalue: u64,
    /// Total value bytes for this key.
    pub mvbytes: u64,
    first_set: u32,
    last_set: u32,
    next: u32,
}

/// One key's share of one partition.
#[derive(Debug)]
pub struct ValueSet {
    pub pid: u32,
    pub nvalue: u64,
    pub mvbytes: u64,
    next: u32,
}

/// Key table for the grouping pass.
///
/// Every inserted value is charged against the current partition; once a
/// partition's payload (value bytes plus a length slot per value) passes
/// `page_size`, the partition id advances. A key spanning partitions gets
/// one [`ValueSet`] per partition it appears in, chained in arrival order.
pub struct ReducerTable {
    buckets: Box<[u32]>,
    uniques: Vec<Unique>,
    sets: Vec<ValueSet>,
    keys: Pool,
    page_size: u64,
    pid: u32,
    page_bytes: u64,
}

const KEY_ARENA_PAGE: usize = 1 << 20;

impl ReducerTable {
    pub fn new(nbuckets: usize, page_size: u64) -> Self {
        Self {
            buckets: vec![NIL; nbuckets].into_boxed_slice(),
            uniques: Vec::new(),
            sets: Vec::new(),
            keys: Pool::new(KEY_ARENA_PAGE),
            page_size,
            pid: 0,
            page_bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.uniques.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uniques.is_empty()
    }

    /// Number of partitions the inserted payload spans.
    pub fn partitions(&self) -> u32 {
        if self.uniques.is_empty() { 0 } else { self.pid + 1 }
    }

    pub fn unique(&self, idx: u32) -> &Unique {
        &self.uniques[idx as usize]
    }

    pub fn key(&self, idx: u32) -> &[u8] {
        self.keys.get(self.uniques[idx as usize].key)
    }

    /// Arena bytes held by copied keys.
    pub fn key_bytes(&self) -> u64 {
        self.keys.mem_bytes()
    }

    pub fn find(&self, key: &[u8]) -> Option<u32> {
        let b = (hash_key(key) % self.buckets.len() as u64) as usize;
        let mut cur = self.buckets[b];
        while cur != NIL {
            let u = &self.uniques[cur as usize];
            if self.keys.get(u.key) == key {
                return Some(cur);
            }
            cur = u.next;
        }
        None
    }

    /// Account one value of `value_bytes` bytes under `key`, returning the
    /// key's unique index.
    pub fn insert(&mut self, key: &[u8], value_bytes: u64) -> u32 {
        // A value costs its bytes plus a 4-byte length slot in the
        // finalized layout.
        let charge = value_bytes + 4;
        if self.page_bytes + charge > self.page_size {
            self.page_bytes = 0;
            self.pid += 1;
        }
        self.page_bytes += charge;

        match self.find(key) {
            Some(idx) => {
                let last = self.uniques[idx as usize].last_set;
                if self.sets[last as usize].pid == self.pid {
                    let set = &mut self.sets[last as usize];
                    set.nvalue += 1;
                    set.mvbytes += value_bytes;
                } else {
                    let set = self.push_set(value_bytes);
                    self.sets[last as usize].next = set;
                    self.uniques[idx as usize].last_set = set;
                }
                let u = &mut self.uniques[idx as usize];
                u.nvalue += 1;
                u.mvbytes += value_bytes;
                idx
            }
            None => {
                let set = self.push_set(value_bytes);
                let b = (hash_key(key) % self.buckets.len() as u64) as usize;
                let key_ref = self.keys.alloc(key);
                let idx = self.uniques.len() as u32;
                self.uniques.push(Unique {
                    key: key_ref,
                    nvalue: 1,
                    mvbytes: value_bytes,
                    first_set: set,
                    last_set: set,
                    next: self.buckets[b],
                });
                self.buckets[b] = idx;
                idx
            }
        }
    }

    fn push_set(&mut self, value_bytes: u64) -> u32 {
        let idx = self.sets.len() as u32;
        self.sets.push(ValueSet {
            pid: self.pid,
            nvalue: 1,
            mvbytes: value_bytes,
            next: NIL,
        });
        idx
    }

    /// This key's value sets, in partition order.
    pub fn sets(&self, idx: u32) -> SetIter<'_> {
        SetIter {
            table: self,
            cur: self.uniques[idx as usize].first_set,
        }
    }

    /// Unique indices in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        0..self.uniques.len() as u32
    }
}

pub struct SetIter<'a> {
    table: &'a ReducerTable,
    cur: u32,
}

impl<'a> Iterator for SetIter<'a> {
    type Item = &'a ValueSet;

    fn next(&mut self) -> Option<&'a ValueSet> {
        if self.cur == NIL {
            return None;
        }
        let set = &self.table.sets[self.cur as usize];
        self.cur = set.next;
        Some(set)
    }
}

/// Pre-exchange deduplication entry. `handle` is caller-owned state for the
/// key (typically an offset of the merged record).
#[derive(Debug)]
pub struct CombinerEntry {
    key: PoolRef,
    pub handle: u64,
    next: u32,
}

pub struct CombinerTable {
    buckets: Box<[u32]>,
    entries: Vec<CombinerEntry>,
    keys: Pool,
}

impl CombinerTable {
    pub fn new(nbuckets: usize) -> Self {
        Self {
            buckets: vec![NIL; nbuckets].into_boxed_slice(),
            entries: Vec::new(),
            keys: Pool::new(KEY_ARENA_PAGE),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, key: &[u8]) -> Option<u32> {
        let b = (hash_key(key) % self.buckets.len() as u64) as usize;
        let mut cur = self.buckets[b];
        while cur != NIL {
            let e = &self.entries[cur as usize];
            if self.keys.get(e.key) == key {
                return Some(cur);
            }
            cur = e.next;
        }
        None
    }

    /// Insert `key` with `handle` if it is new, returning the fresh entry's
    /// index. Returns `None` when an equal key already exists: the caller
    /// must merge into the existing entry (see [`find`](Self::find)) rather
    /// than treat the record as a new unique.
    pub fn insert(&mut self, key: &[u8], handle: u64) -> Option<u32> {
        if self.find(key).is_some() {
            return None;
        }
        let b = (hash_key(key) % self.buckets.len() as u64) as usize;
        let key_ref = self.keys.alloc(key);
        let idx = self.entries.len() as u32;
        self.entries.push(CombinerEntry {
            key: key_ref,
            handle,
            next: self.buckets[b],
        });
        self.buckets[b] = idx;
        Some(idx)
    }

    pub fn entry(&self, idx: u32) -> &CombinerEntry {
        &self.entries[idx as usize]
    }

    pub fn entry_mut(&mut self, idx: u32) -> &mut CombinerEntry {
        &mut self.entries[idx as usize]
    }

    /// Forget all entries but keep the bucket array.
    pub fn clear(&mut self) {
        self.buckets.fill(NIL);
        self.entries.clear();
        self.keys.clear();
    }
}
