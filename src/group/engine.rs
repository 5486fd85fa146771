//! The key grouping engine.
//!
//! `group` scans every record delivered into the input store and produces,
//! per thread shard, one block of grouped records: each key exactly once,
//! followed by all its values in arrival order. Keys are sharded across
//! threads by `hash % nthreads`, so shards are disjoint and need no locking
//! until the final write.
//!
//! The pass is two-phase: first every record is scanned, its key accounted
//! in a [`ReducerTable`] and its value staged in an arena; then the exact
//! output size is known, the grouped layout is carved out of one output
//! block, and staged values are scattered into their slots in arrival
//! order. An output that cannot fit one block is refused up front.

use std::sync::Mutex;

use super::bucket::ReducerTable;
use crate::arena::{Pool, PoolRef};
use crate::config::ShuffleConfig;
use crate::error::{Result, ShuffleError};
use crate::record::{RecordReader, grouped_size};
use crate::store::BlockStore;
use crate::types::hash_key;

/// What one grouping pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupStats {
    pub records: u64,
    pub unique_keys: u64,
    pub grouped_bytes: u64,
    pub partitions: u32,
    /// Arena bytes held for copied keys during the pass.
    pub key_bytes: u64,
}

impl GroupStats {
    fn absorb(&mut self, other: GroupStats) {
        self.records += other.records;
        self.unique_keys += other.unique_keys;
        self.grouped_bytes += other.grouped_bytes;
        self.partitions += other.partitions;
        self.key_bytes += other.key_bytes;
    }
}

pub struct GroupEngine {
    buckets: usize,
    page_size: usize,
    nthreads: usize,
}

impl GroupEngine {
    pub fn new(cfg: &ShuffleConfig, nthreads: usize) -> Result<Self> {
        cfg.validate()?;
        if nthreads == 0 {
            return Err(ShuffleError::config("nthreads must be at least 1"));
        }
        Ok(Self {
            buckets: cfg.buckets,
            page_size: cfg.page_size,
            nthreads,
        })
    }

    /// Group every record in `input`, appending one grouped block per
    /// non-empty shard to `output`.
    pub fn group(&self, input: &BlockStore, output: &mut BlockStore) -> Result<GroupStats> {
        tracing::debug!(
            blocks = input.nblocks(),
            shards = self.nthreads,
            "grouping scan"
        );
        let mut stats = GroupStats::default();
        if self.nthreads == 1 {
            let out = Mutex::new(output);
            stats.absorb(self.run_shard(0, input, &out)?);
        } else {
            let out = Mutex::new(output);
            let results: Vec<Result<GroupStats>> = std::thread::scope(|s| {
                let handles: Vec<_> = (0..self.nthreads)
                    .map(|tid| {
                        let out = &out;
                        s.spawn(move || self.run_shard(tid, input, out))
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });
            for r in results {
                stats.absorb(r?);
            }
        }
        tracing::debug!(
            records = stats.records,
            unique_keys = stats.unique_keys,
            grouped_bytes = stats.grouped_bytes,
            "grouping done"
        );
        Ok(stats)
    }

    fn run_shard(
        &self,
        tid: usize,
        input: &BlockStore,
        output: &Mutex<&mut BlockStore>,
    ) -> Result<GroupStats> {
        let mut table = ReducerTable::new(self.buckets, self.page_size as u64);
        let mut values = Pool::new(self.page_size);
        let mut staged: Vec<(u32, PoolRef)> = Vec::new();
        let mut records = 0u64;

        for b in 0..input.nblocks() {
            for rec in RecordReader::new(input.data(b)?) {
                if self.nthreads > 1
                    && (hash_key(rec.key) % self.nthreads as u64) as usize != tid
                {
                    continue;
                }
                if rec.value.len() > self.page_size {
                    return Err(ShuffleError::Unsupported {
                        what: "value exceeds the grouping arena page",
                        needed: rec.value.len() as u64,
                        capacity: self.page_size as u64,
                    });
                }
                let idx = table.insert(rec.key, rec.value.len() as u64);
                staged.push((idx, values.alloc(rec.value)));
                records += 1;
            }
        }

        let stats = GroupStats {
            records,
            unique_keys: table.len() as u64,
            grouped_bytes: self.finalize_shard(&table, &values, &staged, output)?,
            partitions: table.partitions(),
            key_bytes: table.key_bytes(),
        };
        Ok(stats)
    }

    /// Lay out the shard's grouped block and scatter the staged values.
    fn finalize_shard(
        &self,
        table: &ReducerTable,
        values: &Pool,
        staged: &[(u32, PoolRef)],
        output: &Mutex<&mut BlockStore>,
    ) -> Result<u64> {
        if table.is_empty() {
            return Ok(0);
        }
        let mut total = 0u64;
        for idx in table.iter() {
            let u = table.unique(idx);
            total += grouped_size(table.key(idx).len(), u.nvalue as usize, u.mvbytes as usize)
                as u64;
        }

        let mut store = output.lock().unwrap();
        if total > store.block_size() as u64 {
            return Err(ShuffleError::Unsupported {
                what: "grouped output exceeds a single block",
                needed: total,
                capacity: store.block_size() as u64,
            });
        }

        let id = store.add_block()?;
        store.acquire(id)?;
        {
            let buf = store.buffer_mut(id)?;
            // Header pass: key, value count, and the slot positions every
            // staged value will scatter into.
            let n = table.len();
            let mut lens_at = vec![0usize; n];
            let mut vals_at = vec![0usize; n];
            let mut off = 0usize;
            for idx in table.iter() {
                let u = table.unique(idx);
                let key = table.key(idx);
                buf[off..off + 4].copy_from_slice(&(key.len() as u32).to_le_bytes());
                off += 4;
                buf[off..off + key.len()].copy_from_slice(key);
                off += key.len();
                buf[off..off + 4].copy_from_slice(&(u.nvalue as u32).to_le_bytes());
                off += 4;
                lens_at[idx as usize] = off;
                off += 4 * u.nvalue as usize;
                vals_at[idx as usize] = off;
                off += u.mvbytes as usize;
            }
            debug_assert_eq!(off as u64, total);

            // Scatter pass, in arrival order per key.
            for &(idx, vref) in staged {
                let v = values.get(vref);
                let la = &mut lens_at[idx as usize];
                buf[*la..*la + 4].copy_from_slice(&(v.len() as u32).to_le_bytes());
                *la += 4;
                let va = &mut vals_at[idx as usize];
                buf[*va..*va + v.len()].copy_from_slice(v);
                *va += v.len();
            }
        }
        store.set_data_size(id, total as usize)?;
        store.release(id)?;
        Ok(total)
    }
}
