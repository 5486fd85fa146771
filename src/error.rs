use crate::types::Rank;

pub type Result<T> = std::result::Result<T, ShuffleError>;

#[derive(Debug, thiserror::Error)]
pub enum ShuffleError {
    #[error(
        "record of {record_bytes} bytes exceeds the thread buffer capacity of {capacity} bytes"
    )]
    OversizedRecord {
        record_bytes: usize,
        capacity: usize,
    },

    #[error(
        "padded element count {elements} for destination {dest} overflows a 32-bit count \
         (element width {width} bytes)"
    )]
    ElementOverflow {
        dest: Rank,
        elements: u64,
        width: usize,
    },

    #[error("invalid destination rank {rank}: world size is {world_size}")]
    InvalidRank { rank: Rank, world_size: u32 },

    #[error("{threads} worker threads require a funneled substrate, which this one is not")]
    ThreadSupport { threads: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{operation} failed at rank {rank}: {reason}")]
    Collective {
        operation: &'static str,
        rank: Rank,
        reason: String,
    },

    #[error("{what}: need {needed} bytes, a single block holds {capacity}")]
    Unsupported {
        what: &'static str,
        needed: u64,
        capacity: u64,
    },

    #[error("block store is full: {blocks} blocks allocated, limit is {max_blocks}")]
    BlockLimit { blocks: usize, max_blocks: usize },

    #[error("block {block} misuse: {reason}")]
    BlockState { block: usize, reason: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShuffleError {
    /// Create a `Config` error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a `Collective` error for a failed group operation.
    pub fn collective(operation: &'static str, rank: Rank, reason: impl Into<String>) -> Self {
        Self::Collective {
            operation,
            rank,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oversized_record_display() {
        let e = ShuffleError::OversizedRecord {
            record_bytes: 9000,
            capacity: 4096,
        };
        assert_eq!(
            e.to_string(),
            "record of 9000 bytes exceeds the thread buffer capacity of 4096 bytes"
        );
    }

    #[test]
    fn test_collective_display() {
        let e = ShuffleError::collective("alltoallv", 3, "peer hung up");
        assert_eq!(e.to_string(), "alltoallv failed at rank 3: peer hung up");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::other("disk gone");
        let err: ShuffleError = io_err.into();
        assert!(err.to_string().contains("disk gone"));
    }

    #[test]
    fn test_all_variants_display() {
        // Ensure all variants produce non-empty display strings
        let errors: Vec<ShuffleError> = vec![
            ShuffleError::OversizedRecord {
                record_bytes: 1,
                capacity: 0,
            },
            ShuffleError::ElementOverflow {
                dest: 2,
                elements: 1 << 33,
                width: 4,
            },
            ShuffleError::InvalidRank {
                rank: 9,
                world_size: 4,
            },
            ShuffleError::ThreadSupport { threads: 8 },
            ShuffleError::config("pipeline_slots must be at least 1"),
            ShuffleError::collective("alltoall", 0, "x"),
            ShuffleError::Unsupported {
                what: "grouped output exceeds a single block",
                needed: 100,
                capacity: 10,
            },
            ShuffleError::BlockLimit {
                blocks: 4,
                max_blocks: 4,
            },
            ShuffleError::BlockState {
                block: 1,
                reason: "released while not acquired",
            },
        ];
        for e in &errors {
            assert!(!e.to_string().is_empty(), "empty display for {e:?}");
        }
    }
}
