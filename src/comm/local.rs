//! In-process collective substrate.
//!
//! `LocalCluster::new(n)` hands out `n` connected [`LocalComm`] endpoints,
//! one per rank, each meant to be driven from its own thread. Every rank has
//! one inbox; messages carry their source rank, and each endpoint keeps a
//! per-source stash so that a fast peer running ahead into the next
//! collective cannot have its messages consumed out of order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use crossbeam_queue::ArrayQueue;

use super::{Collectives, ExchangeHandle};
use crate::error::{Result, ShuffleError};
use crate::types::Rank;

/// How long a rank waits for a peer's contribution to a collective before
/// declaring the group wedged.
const PEER_TIMEOUT: Duration = Duration::from_secs(60);

const PAYLOAD_POOL_SLOTS: usize = 64;

struct Msg {
    src: u32,
    body: Vec<u8>,
}

/// Recycles payload vectors across rounds so steady-state exchanges do not
/// allocate per message.
struct PayloadPool {
    bufs: ArrayQueue<Vec<u8>>,
}

impl PayloadPool {
    fn new() -> Self {
        Self {
            bufs: ArrayQueue::new(PAYLOAD_POOL_SLOTS),
        }
    }

    fn checkout(&self, len: usize) -> Vec<u8> {
        let mut buf = self.bufs.pop().unwrap_or_default();
        buf.clear();
        buf.reserve(len);
        buf
    }

    fn put_back(&self, buf: Vec<u8>) {
        // Queue full means we simply drop the buffer.
        let _ = self.bufs.push(buf);
    }
}

pub struct LocalCluster;

impl LocalCluster {
    /// Build a fully connected in-process group of `world` ranks.
    pub fn new(world: u32) -> Vec<LocalComm> {
        assert!(world > 0, "world size must be at least 1");
        let pool = Arc::new(PayloadPool::new());
        let mut txs: Vec<Sender<Msg>> = Vec::with_capacity(world as usize);
        let mut rxs: Vec<Receiver<Msg>> = Vec::with_capacity(world as usize);
        for _ in 0..world {
            let (tx, rx) = unbounded();
            txs.push(tx);
            rxs.push(rx);
        }
        rxs.into_iter()
            .enumerate()
            .map(|(rank, rx)| LocalComm {
                rank: rank as u32,
                world,
                peers: txs.clone(),
                inbox: rx,
                stash: Mutex::new(vec![VecDeque::new(); world as usize]),
                pool: Arc::clone(&pool),
            })
            .collect()
    }
}

pub struct LocalComm {
    rank: u32,
    world: u32,
    peers: Vec<Sender<Msg>>,
    inbox: Receiver<Msg>,
    stash: Mutex<Vec<VecDeque<Vec<u8>>>>,
    pool: Arc<PayloadPool>,
}

impl LocalComm {
    fn send_to(&self, dst: u32, body: Vec<u8>, op: &'static str) -> Result<()> {
        self.peers[dst as usize]
            .send(Msg {
                src: self.rank,
                body,
            })
            .map_err(|_| ShuffleError::collective(op, self.rank, format!("rank {dst} is gone")))
    }

    /// Next message from `src`, preserving per-source FIFO order even when
    /// other sources' messages arrive interleaved.
    fn recv_from(&self, src: u32, op: &'static str) -> Result<Vec<u8>> {
        let mut stash = self.stash.lock().unwrap();
        loop {
            if let Some(body) = stash[src as usize].pop_front() {
                return Ok(body);
            }
            match self.inbox.recv_timeout(PEER_TIMEOUT) {
                Ok(msg) => stash[msg.src as usize].push_back(msg.body),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(ShuffleError::collective(
                        op,
                        self.rank,
                        format!("timed out waiting for rank {src}"),
                    ));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ShuffleError::collective(
                        op,
                        self.rank,
                        format!("rank {src} is gone"),
                    ));
                }
            }
        }
    }
}

impl Collectives for LocalComm {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.world
    }

    fn thread_funneled(&self) -> bool {
        true
    }

    fn alltoall_counts(&self, send: &[u32]) -> Result<Vec<u32>> {
        debug_assert_eq!(send.len(), self.world as usize);
        for dst in 0..self.world {
            let mut body = self.pool.checkout(4);
            body.extend_from_slice(&send[dst as usize].to_le_bytes());
            self.send_to(dst, body, "alltoall")?;
        }
        let mut recv = vec![0u32; self.world as usize];
        for src in 0..self.world {
            let body = self.recv_from(src, "alltoall")?;
            let bytes: [u8; 4] = body[..].try_into().map_err(|_| {
                ShuffleError::collective(
                    "alltoall",
                    self.rank,
                    format!("malformed count from rank {src}"),
                )
            })?;
            recv[src as usize] = u32::from_le_bytes(bytes);
            self.pool.put_back(body);
        }
        Ok(recv)
    }

    fn alltoallv(
        &self,
        send: &[u8],
        send_counts: &[u32],
        send_displs: &[u32],
        recv: &mut [u8],
        recv_counts: &[u32],
        recv_displs: &[u32],
        width: usize,
    ) -> Result<()> {
        for dst in 0..self.world as usize {
            let start = send_displs[dst] as usize * width;
            let len = send_counts[dst] as usize * width;
            let mut body = self.pool.checkout(len);
            body.extend_from_slice(&send[start..start + len]);
            self.send_to(dst as u32, body, "alltoallv")?;
        }
        for src in 0..self.world as usize {
            let body = self.recv_from(src as u32, "alltoallv")?;
            let start = recv_displs[src] as usize * width;
            let len = recv_counts[src] as usize * width;
            if body.len() != len {
                return Err(ShuffleError::collective(
                    "alltoallv",
                    self.rank,
                    format!("rank {src} sent {} bytes, expected {len}", body.len()),
                ));
            }
            recv[start..start + len].copy_from_slice(&body);
            self.pool.put_back(body);
        }
        Ok(())
    }

    fn ialltoallv(
        &self,
        send: &[u8],
        send_counts: &[u32],
        send_displs: &[u32],
        mut recv: Vec<u8>,
        recv_counts: &[u32],
        recv_displs: &[u32],
        width: usize,
    ) -> Result<ExchangeHandle> {
        // In-process, the exchange completes at issue time; the handle just
        // carries the filled buffer to the wait site.
        self.alltoallv(
            send,
            send_counts,
            send_displs,
            &mut recv,
            recv_counts,
            recv_displs,
            width,
        )?;
        Ok(ExchangeHandle::ready(recv))
    }

    fn allreduce_sum(&self, value: u64) -> Result<u64> {
        for dst in 0..self.world {
            let mut body = self.pool.checkout(8);
            body.extend_from_slice(&value.to_le_bytes());
            self.send_to(dst, body, "allreduce")?;
        }
        let mut sum = 0u64;
        for src in 0..self.world {
            let body = self.recv_from(src, "allreduce")?;
            let bytes: [u8; 8] = body[..].try_into().map_err(|_| {
                ShuffleError::collective(
                    "allreduce",
                    self.rank,
                    format!("malformed contribution from rank {src}"),
                )
            })?;
            sum += u64::from_le_bytes(bytes);
            self.pool.put_back(body);
        }
        Ok(sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ranks<F, T>(world: u32, f: F) -> Vec<T>
    where
        F: Fn(LocalComm) -> T + Send + Sync,
        T: Send,
    {
        let comms = LocalCluster::new(world);
        std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| s.spawn(|| f(comm)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn test_single_rank_group() {
        let results = run_ranks(1, |comm| {
            let counts = comm.alltoall_counts(&[7]).unwrap();
            let sum = comm.allreduce_sum(5).unwrap();
            (counts, sum)
        });
        assert_eq!(results[0], (vec![7], 5));
    }

    #[test]
    fn test_alltoall_counts_transpose() {
        // Rank r sends r*10 + d to rank d; rank d must see r*10 + d from r.
        let results = run_ranks(3, |comm| {
            let r = comm.rank();
            let send: Vec<u32> = (0..3).map(|d| r * 10 + d).collect();
            comm.alltoall_counts(&send).unwrap()
        });
        for (d, recv) in results.iter().enumerate() {
            let expect: Vec<u32> = (0..3).map(|r| r * 10 + d as u32).collect();
            assert_eq!(recv, &expect);
        }
    }

    #[test]
    fn test_allreduce_sum() {
        let results = run_ranks(4, |comm| comm.allreduce_sum(comm.rank() as u64 + 1).unwrap());
        assert_eq!(results, vec![10, 10, 10, 10]);
    }

    #[test]
    fn test_alltoallv_elementwise() {
        // Width-2 elements: rank r sends one element [r, d] to each rank d,
        // packed at displacement d.
        let results = run_ranks(3, |comm| {
            let r = comm.rank() as u8;
            let send: Vec<u8> = (0..3u8).flat_map(|d| [r, d]).collect();
            let counts = [1u32, 1, 1];
            let displs = [0u32, 1, 2];
            let mut recv = vec![0u8; 6];
            comm.alltoallv(&send, &counts, &displs, &mut recv, &counts, &displs, 2)
                .unwrap();
            recv
        });
        for (d, recv) in results.iter().enumerate() {
            let expect: Vec<u8> = (0..3u8).flat_map(|r| [r, d as u8]).collect();
            assert_eq!(recv, &expect);
        }
    }

    #[test]
    fn test_back_to_back_collectives_do_not_interleave() {
        // A rank that races ahead into round 2 must not have its round-2
        // payload consumed as round 1 by a slower peer.
        let results = run_ranks(2, |comm| {
            let mut out = Vec::new();
            for round in 0..10u32 {
                let recv = comm.alltoall_counts(&[round, round]).unwrap();
                out.push(recv);
            }
            out
        });
        for recvs in results {
            for (round, recv) in recvs.iter().enumerate() {
                assert_eq!(recv, &vec![round as u32, round as u32]);
            }
        }
    }
}
