//! kvshuffle: the data-movement and grouping core of a distributed
//! MapReduce runtime.
//!
//! Map workers [`emit`](exchange::Worker::emit) key/value records toward
//! destination ranks; records stage in per-thread buffers, spill into a
//! shared per-destination send buffer with lock-free bounded claims, and
//! move across the group in collective exchange rounds driven by the
//! [`Exchanger`](exchange::Exchanger). Received records land in a
//! [`BlockStore`](store::BlockStore) without ever splitting a record, and
//! the [`GroupEngine`](group::GroupEngine) turns them into one grouped
//! record per key for the reduce phase.
//!
//! The communication substrate is the [`Collectives`](comm::Collectives)
//! trait; [`LocalCluster`](comm::LocalCluster) provides an in-process
//! implementation for tests and demos.
//!
//! ```no_run
//! use std::sync::{Arc, Mutex};
//! use kvshuffle::{
//!     BlockStore, Collectives, Exchanger, GroupEngine, LocalCluster, ShuffleConfig, hash_key,
//! };
//!
//! # fn main() -> kvshuffle::Result<()> {
//! let cfg = ShuffleConfig::default();
//! let comm = LocalCluster::new(1).pop().unwrap();
//! let world = comm.world_size() as u64;
//! let recv = Arc::new(Mutex::new(BlockStore::new(cfg.block_size, cfg.max_blocks)));
//! let exchanger = Exchanger::new(comm, &cfg, 1, Arc::clone(&recv))?;
//!
//! let mut worker = exchanger.workers().pop().unwrap();
//! for word in ["apple", "banana", "apple"] {
//!     let dest = (hash_key(word.as_bytes()) % world) as u32;
//!     worker.emit(dest, word.as_bytes(), &1u32.to_le_bytes())?;
//! }
//! worker.finish()?;
//! exchanger.finalize()?;
//!
//! let mut grouped = BlockStore::new(cfg.block_size, cfg.max_blocks);
//! GroupEngine::new(&cfg, 1)?.group(&recv.lock().unwrap(), &mut grouped)?;
//! # Ok(())
//! # }
//! ```

pub mod arena;
pub mod comm;
pub mod config;
pub mod error;
pub mod exchange;
pub mod group;
pub mod metrics;
pub mod record;
pub mod store;
pub mod types;

pub use arena::{Pool, PoolRef};
pub use comm::{Collectives, ExchangeHandle, LocalCluster, LocalComm};
pub use config::ShuffleConfig;
pub use error::{Result, ShuffleError};
pub use exchange::{ElementWidth, Exchanger, Worker};
pub use group::{CombinerTable, GroupEngine, GroupStats, ReducerTable};
pub use metrics::{MetricsSnapshot, ShuffleMetrics};
pub use record::{GroupedReader, Record, RecordReader, record_size, write_record};
pub use store::{BlockId, BlockStore};
pub use types::{ExchangeMode, Rank, hash_key};
