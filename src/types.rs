use std::hash::Hasher;

use twox_hash::XxHash64;

/// Process identifier within the exchange group. Dense in `0..world_size`.
pub type Rank = u32;

/// Strategy for moving filled send regions across the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeMode {
    /// Each round blocks until its payload has landed and been sunk.
    Blocking,
    /// Rounds are issued on rotating slots; a round is completed when its
    /// slot comes up for reuse (or at drain time).
    Pipelined,
}

impl std::fmt::Display for ExchangeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeMode::Blocking => write!(f, "blocking"),
            ExchangeMode::Pipelined => write!(f, "pipelined"),
        }
    }
}

/// Deterministic key hash, identical on every rank and across runs.
///
/// Both destination selection (`hash % world`) and the grouping tables key off
/// this value, so it must never depend on process-local state.
pub fn hash_key(key: &[u8]) -> u64 {
    let mut h = XxHash64::with_seed(0);
    h.write(key);
    h.finish()
}
