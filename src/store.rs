//! In-memory block storage.
//!
//! Blocks are fixed-size byte pages with a used-length watermark. Writers
//! must `acquire` a block before touching its buffer and `release` it when
//! done; misuse is surfaced as [`ShuffleError::BlockState`]. The store is
//! shared behind a `Mutex` wherever more than one thread writes.

use crate::error::{Result, ShuffleError};

pub type BlockId = usize;

struct Block {
    data: Box<[u8]>,
    len: usize,
    held: bool,
}

pub struct BlockStore {
    block_size: usize,
    max_blocks: usize,
    blocks: Vec<Block>,
}

impl BlockStore {
    pub fn new(block_size: usize, max_blocks: usize) -> Self {
        Self {
            block_size,
            max_blocks,
            blocks: Vec::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn nblocks(&self) -> usize {
        self.blocks.len()
    }

    /// Allocate a fresh empty block.
    pub fn add_block(&mut self) -> Result<BlockId> {
        if self.blocks.len() >= self.max_blocks {
            return Err(ShuffleError::BlockLimit {
                blocks: self.blocks.len(),
                max_blocks: self.max_blocks,
            });
        }
        self.blocks.push(Block {
            data: vec![0u8; self.block_size].into_boxed_slice(),
            len: 0,
            held: false,
        });
        Ok(self.blocks.len() - 1)
    }

    fn block(&self, id: BlockId) -> Result<&Block> {
        self.blocks.get(id).ok_or(ShuffleError::BlockState {
            block: id,
            reason: "no such block",
        })
    }

    fn block_mut(&mut self, id: BlockId) -> Result<&mut Block> {
        self.blocks.get_mut(id).ok_or(ShuffleError::BlockState {
            block: id,
            reason: "no such block",
        })
    }

    pub fn acquire(&mut self, id: BlockId) -> Result<()> {
        let b = self.block_mut(id)?;
        if b.held {
            return Err(ShuffleError::BlockState {
                block: id,
                reason: "already acquired",
            });
        }
        b.held = true;
        Ok(())
    }

    pub fn release(&mut self, id: BlockId) -> Result<()> {
        let b = self.block_mut(id)?;
        if !b.held {
            return Err(ShuffleError::BlockState {
                block: id,
                reason: "released while not acquired",
            });
        }
        b.held = false;
        Ok(())
    }

    /// The full fixed-size page.
    pub fn buffer(&self, id: BlockId) -> Result<&[u8]> {
        Ok(&self.block(id)?.data)
    }

    /// Mutable access requires the block to be acquired.
    pub fn buffer_mut(&mut self, id: BlockId) -> Result<&mut [u8]> {
        let b = self.block_mut(id)?;
        if !b.held {
            return Err(ShuffleError::BlockState {
                block: id,
                reason: "mutated while not acquired",
            });
        }
        Ok(&mut b.data)
    }

    pub fn data_size(&self, id: BlockId) -> Result<usize> {
        Ok(self.block(id)?.len)
    }

    pub fn set_data_size(&mut self, id: BlockId, len: usize) -> Result<()> {
        if len > self.block_size {
            return Err(ShuffleError::BlockState {
                block: id,
                reason: "data size exceeds block capacity",
            });
        }
        self.block_mut(id)?.len = len;
        Ok(())
    }

    /// The used prefix of the block.
    pub fn data(&self, id: BlockId) -> Result<&[u8]> {
        let b = self.block(id)?;
        Ok(&b.data[..b.len])
    }

    /// Move the page out of an acquired block so a receive can land in it
    /// directly. The block must get its page back via [`restore_buffer`]
    /// before it is released.
    ///
    /// [`restore_buffer`]: BlockStore::restore_buffer
    pub fn take_buffer(&mut self, id: BlockId) -> Result<Box<[u8]>> {
        let b = self.block_mut(id)?;
        if !b.held {
            return Err(ShuffleError::BlockState {
                block: id,
                reason: "buffer taken while not acquired",
            });
        }
        if b.data.is_empty() {
            return Err(ShuffleError::BlockState {
                block: id,
                reason: "buffer already taken",
            });
        }
        Ok(std::mem::take(&mut b.data))
    }

    pub fn restore_buffer(&mut self, id: BlockId, data: Box<[u8]>) -> Result<()> {
        if data.len() != self.block_size {
            return Err(ShuffleError::BlockState {
                block: id,
                reason: "restored buffer has the wrong size",
            });
        }
        self.block_mut(id)?.data = data;
        Ok(())
    }
}
