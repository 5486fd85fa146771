//! Runtime-configurable tuning parameters for kvshuffle.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `KVSHUFFLE_`) or by constructing a custom `ShuffleConfig`.

use crate::error::{Result, ShuffleError};
use crate::record::HEADER_BYTES;
use crate::types::ExchangeMode;

/// Tuning parameters for the exchange pipeline and grouping engine.
#[derive(Debug, Clone)]
pub struct ShuffleConfig {
    /// Number of send-slot generations. `1` degenerates to strictly
    /// alternating fill/flush even in pipelined mode; `2` or more lets a
    /// round's payload remain in flight while the next slot fills.
    pub pipeline_slots: usize,

    /// Bytes reserved in each send slot per destination rank. The
    /// process-wide send buffer of a slot is `send_buf_size * world`.
    pub send_buf_size: usize,

    /// Per-destination capacity of each worker thread's private stage
    /// buffer. Also the hard ceiling on a single record's encoded size.
    pub thread_buf_size: usize,

    /// Bucket count for the grouping hash tables.
    pub buckets: usize,

    /// Page size for grouping arenas, and the granularity at which the
    /// reducer table advances its partition id.
    pub page_size: usize,

    /// Capacity of one storage block. Received data and grouped output are
    /// laid out in blocks of this size.
    pub block_size: usize,

    /// Upper bound on blocks a store will allocate.
    pub max_blocks: usize,

    /// Deliver each round's payload directly into a freshly acquired
    /// storage block instead of copying through the sink.
    pub zero_copy: bool,

    /// Blocking or pipelined exchange rounds.
    pub mode: ExchangeMode,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            pipeline_slots: 2,
            send_buf_size: 64 * 1024,
            thread_buf_size: 8 * 1024,
            buckets: 1 << 17,
            page_size: 16 * 1024 * 1024,
            block_size: 64 * 1024 * 1024,
            max_blocks: 1024,
            zero_copy: false,
            mode: ExchangeMode::Blocking,
        }
    }
}

impl ShuffleConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `KVSHUFFLE_PIPELINE_SLOTS`
    /// - `KVSHUFFLE_SEND_BUF_SIZE`
    /// - `KVSHUFFLE_THREAD_BUF_SIZE`
    /// - `KVSHUFFLE_BUCKETS`
    /// - `KVSHUFFLE_PAGE_SIZE`
    /// - `KVSHUFFLE_BLOCK_SIZE`
    /// - `KVSHUFFLE_MAX_BLOCKS`
    /// - `KVSHUFFLE_ZERO_COPY` (`0`/`1`)
    /// - `KVSHUFFLE_EXCHANGE_MODE` (`blocking`/`pipelined`)
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("KVSHUFFLE_PIPELINE_SLOTS") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.pipeline_slots = n;
            }
        }
        if let Ok(v) = std::env::var("KVSHUFFLE_SEND_BUF_SIZE") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.send_buf_size = n;
            }
        }
        if let Ok(v) = std::env::var("KVSHUFFLE_THREAD_BUF_SIZE") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.thread_buf_size = n;
            }
        }
        if let Ok(v) = std::env::var("KVSHUFFLE_BUCKETS") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.buckets = n;
            }
        }
        if let Ok(v) = std::env::var("KVSHUFFLE_PAGE_SIZE") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.page_size = n;
            }
        }
        if let Ok(v) = std::env::var("KVSHUFFLE_BLOCK_SIZE") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.block_size = n;
            }
        }
        if let Ok(v) = std::env::var("KVSHUFFLE_MAX_BLOCKS") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.max_blocks = n;
            }
        }
        if let Ok(v) = std::env::var("KVSHUFFLE_ZERO_COPY") {
            cfg.zero_copy = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("KVSHUFFLE_EXCHANGE_MODE") {
            if v.eq_ignore_ascii_case("pipelined") {
                cfg.mode = ExchangeMode::Pipelined;
            } else if v.eq_ignore_ascii_case("blocking") {
                cfg.mode = ExchangeMode::Blocking;
            }
        }

        cfg
    }

    /// Reject combinations that cannot work, before any buffer is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline_slots == 0 {
            return Err(ShuffleError::config("pipeline_slots must be at least 1"));
        }
        if self.thread_buf_size <= HEADER_BYTES {
            return Err(ShuffleError::config(format!(
                "thread_buf_size {} cannot hold even an empty record header ({} bytes)",
                self.thread_buf_size, HEADER_BYTES
            )));
        }
        if self.thread_buf_size > self.send_buf_size {
            return Err(ShuffleError::config(format!(
                "thread_buf_size {} exceeds per-destination send_buf_size {}",
                self.thread_buf_size, self.send_buf_size
            )));
        }
        if self.send_buf_size > self.block_size {
            // The sink guarantees any contiguous received range (at most one
            // send region) fits in a fresh block.
            return Err(ShuffleError::config(format!(
                "send_buf_size {} exceeds block_size {}",
                self.send_buf_size, self.block_size
            )));
        }
        if self.send_buf_size as u64 > u32::MAX as u64 {
            return Err(ShuffleError::config(
                "send_buf_size must fit a 32-bit byte count",
            ));
        }
        if self.buckets == 0 {
            return Err(ShuffleError::config("buckets must be at least 1"));
        }
        if self.page_size == 0 {
            return Err(ShuffleError::config("page_size must be nonzero"));
        }
        if self.max_blocks == 0 {
            return Err(ShuffleError::config("max_blocks must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ShuffleConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_slots() {
        let cfg = ShuffleConfig {
            pipeline_slots: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ShuffleError::Config(_))));
    }

    #[test]
    fn test_rejects_thread_buf_over_send_buf() {
        let cfg = ShuffleConfig {
            thread_buf_size: 1024,
            send_buf_size: 512,
            block_size: 4096,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("thread_buf_size"));
    }

    #[test]
    fn test_rejects_send_buf_over_block() {
        let cfg = ShuffleConfig {
            send_buf_size: 1 << 20,
            block_size: 1 << 16,
            thread_buf_size: 1 << 12,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
