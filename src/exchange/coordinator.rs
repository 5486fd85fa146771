//! The collective exchange coordinator.
//!
//! An [`Exchanger`] owns the shared send slots and the round protocol; each
//! worker thread drives a [`Worker`] handle. Records flow from a worker's
//! private stage buffer into the current slot's per-destination regions via
//! bounded atomic claims. When a claim cannot be placed, the worker requests
//! a flush and all workers rendezvous at a barrier; worker 0 alone runs the
//! collective round between the first and second barrier, then every worker
//! resumes.
//!
//! Rounds are whole-group operations: every rank enters the same sequence of
//! rounds, each carrying a byte-count exchange, the payload exchange, and a
//! sum-reduction of finished-producer flags that drives termination. A rank
//! whose producers are all done keeps joining rounds from
//! [`Exchanger::finalize`] until the reduction reports every rank finished.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use super::buffers::{SendSlot, ThreadBufs};
use super::sink::{SinkCursor, drain_into_store};
use super::width::{ElementWidth, elem_counts, packed_displs, region_displs};
use crate::comm::{Collectives, ExchangeHandle};
use crate::config::ShuffleConfig;
use crate::error::{Result, ShuffleError};
use crate::metrics::{MetricsSnapshot, ShuffleMetrics};
use crate::record::record_size;
use crate::store::{BlockId, BlockStore};
use crate::types::{ExchangeMode, Rank};

struct Inflight {
    handle: ExchangeHandle,
    recv_bytes: Vec<u64>,
    total: u64,
    /// Element-aligned extent of the received payload. Equals `total` when
    /// the width is one byte.
    padded: u64,
    block: Option<BlockId>,
}

struct RoundState {
    ibuf: usize,
    recv_bufs: Vec<Option<Vec<u8>>>,
    inflight: Vec<Option<Inflight>>,
    sink: SinkCursor,
}

struct Shared<C: Collectives> {
    comm: C,
    world: usize,
    nthreads: usize,
    dest_cap: u64,
    thread_cap: usize,
    zero_copy: bool,
    mode: ExchangeMode,
    width: ElementWidth,
    slots: Vec<SendSlot>,
    cur_slot: AtomicUsize,
    switch_flag: AtomicUsize,
    tdone: AtomicUsize,
    barrier: Barrier,
    faulted: AtomicBool,
    fault: Mutex<Option<String>>,
    state: Mutex<RoundState>,
    store: Arc<Mutex<BlockStore>>,
    metrics: ShuffleMetrics,
    me_done: AtomicBool,
}

pub struct Exchanger<C: Collectives> {
    shared: Arc<Shared<C>>,
    workers_taken: AtomicBool,
}

impl<C: Collectives> Exchanger<C> {
    pub fn new(
        comm: C,
        cfg: &ShuffleConfig,
        nthreads: usize,
        store: Arc<Mutex<BlockStore>>,
    ) -> Result<Self> {
        cfg.validate()?;
        if nthreads == 0 {
            return Err(ShuffleError::config("nthreads must be at least 1"));
        }
        if nthreads > 1 && !comm.thread_funneled() {
            return Err(ShuffleError::ThreadSupport { threads: nthreads });
        }
        let world = comm.world_size() as usize;
        let total_send = cfg.send_buf_size as u64 * world as u64;
        let width = ElementWidth::select(total_send);
        if cfg.send_buf_size % width.bytes() != 0 {
            return Err(ShuffleError::config(format!(
                "send_buf_size {} is not a multiple of the element width {}",
                cfg.send_buf_size,
                width.bytes()
            )));
        }
        if cfg.zero_copy && cfg.block_size < total_send as usize {
            return Err(ShuffleError::config(format!(
                "zero-copy delivery needs block_size >= {} (send regions across {} ranks), got {}",
                total_send, world, cfg.block_size
            )));
        }
        let nbuf = cfg.pipeline_slots;
        let slots = (0..nbuf)
            .map(|_| SendSlot::new(world, cfg.send_buf_size))
            .collect();
        let recv_bufs = (0..nbuf)
            .map(|_| (!cfg.zero_copy).then(|| vec![0u8; total_send as usize]))
            .collect();
        tracing::debug!(
            rank = comm.rank(),
            world,
            nthreads,
            width = width.bytes(),
            mode = %cfg.mode,
            slots = nbuf,
            "exchange setup"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                comm,
                world,
                nthreads,
                dest_cap: cfg.send_buf_size as u64,
                thread_cap: cfg.thread_buf_size,
                zero_copy: cfg.zero_copy,
                mode: cfg.mode,
                width,
                slots,
                cur_slot: AtomicUsize::new(0),
                switch_flag: AtomicUsize::new(0),
                tdone: AtomicUsize::new(0),
                barrier: Barrier::new(nthreads),
                faulted: AtomicBool::new(false),
                fault: Mutex::new(None),
                state: Mutex::new(RoundState {
                    ibuf: 0,
                    recv_bufs,
                    inflight: (0..nbuf).map(|_| None).collect(),
                    sink: SinkCursor::default(),
                }),
                store,
                metrics: ShuffleMetrics::new(),
                me_done: AtomicBool::new(false),
            }),
            workers_taken: AtomicBool::new(false),
        })
    }

    pub fn rank(&self) -> Rank {
        self.shared.comm.rank()
    }

    pub fn world_size(&self) -> u32 {
        self.shared.comm.world_size()
    }

    /// Hand out the worker handles, exactly `nthreads` of them. Every handle
    /// must reach [`Worker::finish`] or the group's flush barriers wedge.
    pub fn workers(&self) -> Vec<Worker<C>> {
        assert!(
            !self.workers_taken.swap(true, Ordering::AcqRel),
            "worker handles already taken"
        );
        (0..self.shared.nthreads)
            .map(|tid| Worker {
                tid,
                bufs: ThreadBufs::new(self.shared.world, self.shared.thread_cap),
                shared: Arc::clone(&self.shared),
            })
            .collect()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Join exchange rounds until every rank's producers have finished, then
    /// drain in-flight rounds and seal the sink. Call after all workers have
    /// returned from [`Worker::finish`].
    pub fn finalize(&self) -> Result<()> {
        let shared = &self.shared;
        shared.check_fault()?;
        shared.me_done.store(true, Ordering::Release);
        let mut st = shared.state.lock().unwrap();
        loop {
            let done = shared.exchange_round(&mut st)?;
            if done >= shared.world as u64 {
                break;
            }
        }
        // Settle leftover in-flight rounds oldest first, starting at the
        // slot that would have been reused next.
        let nbuf = st.inflight.len();
        for k in 0..nbuf {
            let idx = (st.ibuf + k) % nbuf;
            shared.complete_slot(&mut st, idx)?;
        }
        {
            let mut store = shared.store.lock().unwrap();
            st.sink.close(&mut store)?;
        }
        tracing::debug!(rank = shared.comm.rank(), "exchange drained");
        Ok(())
    }
}

impl<C: Collectives> Shared<C> {
    fn check_fault(&self) -> Result<()> {
        if !self.faulted.load(Ordering::Acquire) {
            return Ok(());
        }
        let reason = self
            .fault
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "unknown collective failure".into());
        Err(ShuffleError::collective(
            "exchange",
            self.comm.rank(),
            reason,
        ))
    }

    fn set_fault(&self, err: &ShuffleError) {
        *self.fault.lock().unwrap() = Some(err.to_string());
        self.faulted.store(true, Ordering::Release);
    }

    /// One collective round: byte counts, element conversion, payload
    /// move, delivery (or pipelining), and the termination reduction.
    /// Returns how many ranks report their producers finished.
    fn exchange_round(&self, st: &mut RoundState) -> Result<u64> {
        let ibuf = st.ibuf;
        let slot = &self.slots[ibuf];

        let send_bytes: Vec<u64> = (0..self.world).map(|d| slot.offset(d)).collect();
        for (d, &b) in send_bytes.iter().enumerate() {
            assert!(
                b <= self.dest_cap,
                "send region {d} filled to {b} past its capacity {}",
                self.dest_cap
            );
        }
        let send_total: u64 = send_bytes.iter().sum();

        let send_u32: Vec<u32> = send_bytes.iter().map(|&b| b as u32).collect();
        let recv_u32 = self.comm.alltoall_counts(&send_u32)?;
        let recv_bytes: Vec<u64> = recv_u32.iter().map(|&b| b as u64).collect();
        let recv_total: u64 = recv_bytes.iter().sum();

        let send_counts = elem_counts(self.width, &send_bytes)?;
        let recv_counts = elem_counts(self.width, &recv_bytes)?;
        let send_displs = region_displs(self.width, self.dest_cap as usize, self.world);
        let recv_displs = packed_displs(&recv_counts);
        let recv_padded: u64 =
            recv_counts.iter().map(|&c| c as u64).sum::<u64>() * self.width.bytes() as u64;
        let send_padded: u64 =
            send_counts.iter().map(|&c| c as u64).sum::<u64>() * self.width.bytes() as u64;

        self.metrics.add_bytes_sent(send_total);
        self.metrics.add_send_padding(send_padded - send_total);
        self.metrics.add_recv_padding(recv_padded - recv_total);
        tracing::debug!(
            rank = self.comm.rank(),
            slot = ibuf,
            send = send_total,
            recv = recv_total,
            "exchange round"
        );

        // Where the payload lands: a recycled round buffer, or directly in a
        // fresh storage block when zero-copy is on (empty rounds skip the
        // block).
        let (recv_buf, block) = if self.zero_copy {
            if recv_total == 0 {
                (Vec::new(), None)
            } else {
                let mut store = self.store.lock().unwrap();
                let id = store.add_block()?;
                store.acquire(id)?;
                let page = store.take_buffer(id)?;
                (Vec::from(page), Some(id))
            }
        } else {
            let buf = st.recv_bufs[ibuf]
                .take()
                .expect("slot receive buffer still in flight at issue time");
            (buf, None)
        };

        let send_region = unsafe { slot.bytes() };
        match self.mode {
            ExchangeMode::Blocking => {
                let mut recv_buf = recv_buf;
                self.comm.alltoallv(
                    send_region,
                    &send_counts,
                    &send_displs,
                    &mut recv_buf,
                    &recv_counts,
                    &recv_displs,
                    self.width.bytes(),
                )?;
                st.inflight[ibuf] = Some(Inflight {
                    handle: ExchangeHandle::ready(recv_buf),
                    recv_bytes,
                    total: recv_total,
                    padded: recv_padded,
                    block,
                });
                self.complete_slot(st, ibuf)?;
                slot.reset();
            }
            ExchangeMode::Pipelined => {
                let handle = self.comm.ialltoallv(
                    send_region,
                    &send_counts,
                    &send_displs,
                    recv_buf,
                    &recv_counts,
                    &recv_displs,
                    self.width.bytes(),
                )?;
                st.inflight[ibuf] = Some(Inflight {
                    handle,
                    recv_bytes,
                    total: recv_total,
                    padded: recv_padded,
                    block,
                });
                st.ibuf = (ibuf + 1) % self.slots.len();
                // The next slot must be settled before it can refill.
                self.complete_slot(st, st.ibuf)?;
                self.slots[st.ibuf].reset();
                self.cur_slot.store(st.ibuf, Ordering::Release);
            }
        }

        let done = self
            .comm
            .allreduce_sum(self.me_done.load(Ordering::Acquire) as u64)?;
        self.metrics.round_finished();
        Ok(done)
    }

    /// Settle slot `idx`'s in-flight round, if any: wait for the payload,
    /// then sink it (or seal its zero-copy block) and recycle the buffer.
    fn complete_slot(&self, st: &mut RoundState, idx: usize) -> Result<()> {
        let Some(fl) = st.inflight[idx].take() else {
            return Ok(());
        };
        let recv = fl.handle.wait()?;
        self.metrics.add_bytes_received(fl.total);
        if let Some(id) = fl.block {
            // The block keeps the element-aligned layout; with a one-byte
            // width (every aggregate buffer under 2 GiB) there is no
            // padding and the block is a plain record run.
            let mut store = self.store.lock().unwrap();
            store.restore_buffer(id, recv.into_boxed_slice())?;
            store.set_data_size(id, fl.padded as usize)?;
            store.release(id)?;
        } else {
            if fl.total > 0 {
                let mut store = self.store.lock().unwrap();
                drain_into_store(&mut store, &mut st.sink, &recv, &fl.recv_bytes, self.width)?;
            }
            st.recv_bufs[idx] = Some(recv);
        }
        Ok(())
    }
}

pub struct Worker<C: Collectives> {
    tid: usize,
    bufs: ThreadBufs,
    shared: Arc<Shared<C>>,
}

impl<C: Collectives> Worker<C> {
    pub fn tid(&self) -> usize {
        self.tid
    }

    /// Stage one record for destination `dest`, flushing through the shared
    /// slot as needed. Blocks while a flush rendezvous is in progress.
    pub fn emit(&mut self, dest: Rank, key: &[u8], value: &[u8]) -> Result<()> {
        if dest as usize >= self.shared.world {
            return Err(ShuffleError::InvalidRank {
                rank: dest,
                world_size: self.shared.world as u32,
            });
        }
        let len = record_size(key.len(), value.len());
        if len > self.bufs.cap() {
            return Err(ShuffleError::OversizedRecord {
                record_bytes: len,
                capacity: self.bufs.cap(),
            });
        }
        let dest = dest as usize;
        loop {
            self.checkpoint()?;
            if self.bufs.has_room(dest, len) {
                self.bufs.push(dest, key, value);
                self.shared.metrics.record_emitted();
                return Ok(());
            }
            if !self.spill(dest) {
                self.request_flush();
            }
        }
    }

    /// Flush remaining staged records and wait for every sibling worker to
    /// do the same. Must be called on every worker handle.
    pub fn finish(mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let mut dest = 0;
        while dest < shared.world {
            self.checkpoint()?;
            if self.bufs.len(dest) == 0 || self.spill(dest) {
                dest += 1;
                continue;
            }
            self.request_flush();
        }
        shared.tdone.fetch_add(1, Ordering::AcqRel);
        while shared.tdone.load(Ordering::Acquire) < shared.nthreads {
            self.checkpoint()?;
            std::thread::yield_now();
        }
        Ok(())
    }

    /// Move this thread's staged bytes for `dest` into the current slot.
    /// Fails (without side effects) when the slot region cannot take them.
    fn spill(&mut self, dest: usize) -> bool {
        let shared = &self.shared;
        let staged = self.bufs.len(dest) as u64;
        if staged == 0 {
            return true;
        }
        let slot = &shared.slots[shared.cur_slot.load(Ordering::Acquire)];
        match slot.try_reserve(dest, staged) {
            Some(off) => {
                unsafe { slot.copy_in(dest, off, self.bufs.bytes(dest)) };
                self.bufs.clear(dest);
                true
            }
            None => false,
        }
    }

    fn request_flush(&self) {
        self.shared.switch_flag.fetch_add(1, Ordering::AcqRel);
        self.shared.metrics.flush_requested();
    }

    /// Join a flush rendezvous if one was requested. Worker 0 runs the
    /// round between the two barriers; everyone else just waits it out.
    fn checkpoint(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.switch_flag.load(Ordering::Acquire) == 0 {
            return shared.check_fault();
        }
        shared.barrier.wait();
        if self.tid == 0 {
            let mut st = shared.state.lock().unwrap();
            if let Err(e) = shared.exchange_round(&mut st) {
                shared.set_fault(&e);
            }
            shared.switch_flag.store(0, Ordering::Release);
        }
        shared.barrier.wait();
        shared.check_fault()
    }
}
