//! Communication substrate.
//!
//! The exchange pipeline talks to its peers through the [`Collectives`]
//! trait: a dense `0..world_size` group where every operation is a
//! whole-group rendezvous entered by all ranks in the same order. The
//! in-process [`LocalCluster`] implementation backs tests and demos; an MPI
//! or RDMA binding would implement the same trait.
//!
//! [`LocalCluster`]: local::LocalCluster

mod local;

pub use local::{LocalCluster, LocalComm};

use crate::error::Result;
use crate::types::Rank;

/// Blocking group collectives over a fixed set of ranks.
///
/// `alltoallv`/`ialltoallv` move payload at *element* granularity: counts and
/// displacements are in units of `width` bytes, never raw bytes. All slices
/// indexed by rank have exactly `world_size` entries.
pub trait Collectives: Send + Sync {
    fn rank(&self) -> Rank;

    fn world_size(&self) -> u32;

    /// Whether multiple worker threads may exist per rank with all
    /// communication funneled through one of them.
    fn thread_funneled(&self) -> bool;

    /// Personalized exchange of one `u32` per destination. `send[d]` goes to
    /// rank `d`; the result's entry `s` is what rank `s` sent here.
    fn alltoall_counts(&self, send: &[u32]) -> Result<Vec<u32>>;

    /// Personalized payload exchange. Sends `send_counts[d]` elements from
    /// element offset `send_displs[d]` of `send` to each rank `d`, and
    /// gathers `recv_counts[s]` elements from each rank `s` at element
    /// offset `recv_displs[s]` of `recv`.
    #[allow(clippy::too_many_arguments)]
    fn alltoallv(
        &self,
        send: &[u8],
        send_counts: &[u32],
        send_displs: &[u32],
        recv: &mut [u8],
        recv_counts: &[u32],
        recv_displs: &[u32],
        width: usize,
    ) -> Result<()>;

    /// Initiating form of [`alltoallv`](Collectives::alltoallv). Takes
    /// ownership of the receive buffer and hands it back, filled, when the
    /// returned handle is waited on. Implementations may complete eagerly;
    /// callers must not observe the data before `wait`.
    #[allow(clippy::too_many_arguments)]
    fn ialltoallv(
        &self,
        send: &[u8],
        send_counts: &[u32],
        send_displs: &[u32],
        recv: Vec<u8>,
        recv_counts: &[u32],
        recv_displs: &[u32],
        width: usize,
    ) -> Result<ExchangeHandle>;

    /// Sum of `value` across all ranks, returned to every rank.
    fn allreduce_sum(&self, value: u64) -> Result<u64>;
}

/// An in-flight `ialltoallv`. Dropping a handle without waiting abandons the
/// receive buffer.
pub struct ExchangeHandle {
    inner: Box<dyn PendingExchange>,
}

pub trait PendingExchange: Send {
    fn wait(self: Box<Self>) -> Result<Vec<u8>>;
}

struct Ready(Vec<u8>);

impl PendingExchange for Ready {
    fn wait(self: Box<Self>) -> Result<Vec<u8>> {
        Ok(self.0)
    }
}

impl ExchangeHandle {
    /// Handle over an exchange that already completed into `recv`.
    pub fn ready(recv: Vec<u8>) -> Self {
        Self {
            inner: Box::new(Ready(recv)),
        }
    }

    /// Handle over an exchange still in flight. Substrates that genuinely
    /// overlap communication (MPI non-blocking, RDMA) wrap their completion
    /// state in a [`PendingExchange`]; the in-process substrate completes
    /// eagerly and uses [`ready`](ExchangeHandle::ready) instead.
    pub fn pending(inner: Box<dyn PendingExchange>) -> Self {
        Self { inner }
    }

    /// Block until the exchange completes and return the filled buffer.
    pub fn wait(self) -> Result<Vec<u8>> {
        self.inner.wait()
    }
}
