//! Received-data sink.
//!
//! A round's receive buffer is a sequence of per-source ranges, each padded
//! up to the element width. Ranges hold whole records, so a range may never
//! be split across storage blocks; the sink batches consecutive ranges into
//! one copy until it hits a padded hole or a range that no longer fits the
//! open block, in which case it seals the block and rolls to a fresh one.

use super::width::ElementWidth;
use crate::error::Result;
use crate::store::{BlockId, BlockStore};

/// The sink's open output block, carried across rounds so partially filled
/// blocks keep filling.
#[derive(Default)]
pub(crate) struct SinkCursor {
    pub(crate) block: Option<BlockId>,
}

impl SinkCursor {
    /// Seal the open block, if any.
    pub(crate) fn close(&mut self, store: &mut BlockStore) -> Result<()> {
        if let Some(id) = self.block.take() {
            store.release(id)?;
        }
        Ok(())
    }
}

/// Copy one round's received ranges into the store, skipping pad bytes and
/// never splitting a range across blocks. `range_bytes[s]` is the unpadded
/// byte count received from source `s`; `payload` holds the padded ranges
/// back to back.
pub(crate) fn drain_into_store(
    store: &mut BlockStore,
    cursor: &mut SinkCursor,
    payload: &[u8],
    range_bytes: &[u64],
    width: ElementWidth,
) -> Result<()> {
    let mut id = match cursor.block {
        Some(id) => id,
        None => {
            let id = store.add_block()?;
            store.acquire(id)?;
            id
        }
    };
    let mut space = store.block_size() - store.data_size(id)?;

    let mut src = 0usize;
    let mut k = 0usize;
    let n = range_bytes.len();
    while k < n {
        // Batch ranges while they are contiguous in the payload and fit the
        // open block; a nonzero pad after a range breaks contiguity.
        let mut copy = 0u64;
        let mut pad = 0u64;
        while k < n && space as u64 >= range_bytes[k] {
            copy += range_bytes[k];
            space -= range_bytes[k] as usize;
            pad = width.padding(range_bytes[k]);
            k += 1;
            if pad != 0 {
                break;
            }
        }
        if copy > 0 {
            let at = store.data_size(id)?;
            store.buffer_mut(id)?[at..at + copy as usize]
                .copy_from_slice(&payload[src..src + copy as usize]);
            store.set_data_size(id, at + copy as usize)?;
            src += copy as usize;
        }
        if pad != 0 {
            src += pad as usize;
        } else if k < n {
            // Next range does not fit the open block; setup guarantees any
            // single range fits an empty one.
            store.release(id)?;
            id = store.add_block()?;
            store.acquire(id)?;
            space = store.block_size();
            tracing::debug!(block = id, "sink rolled to a new block");
        }
    }
    cursor.block = Some(id);
    Ok(())
}
