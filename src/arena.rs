//! Append-only page arena used by the grouping engine.
//!
//! Allocations are bump-pointer within fixed-size pages and are addressed by
//! [`PoolRef`] indices rather than pointers, so the arena can be moved and
//! its contents survive `Vec` growth. An allocation never spans pages; when
//! one does not fit in the current page's tail, the tail is wasted and a new
//! page starts.

/// Index of one allocation inside a [`Pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRef {
    page: u32,
    off: u32,
    len: u32,
}

pub struct Pool {
    page_size: usize,
    pages: Vec<Box<[u8]>>,
    tail: usize,
}

impl Pool {
    pub fn new(page_size: usize) -> Self {
        assert!(page_size > 0, "arena page size must be nonzero");
        Self {
            page_size,
            pages: Vec::new(),
            tail: 0,
        }
    }

    /// Copy `bytes` into the arena. `bytes` must fit one page; callers
    /// validate sizes before staging.
    pub fn alloc(&mut self, bytes: &[u8]) -> PoolRef {
        assert!(
            bytes.len() <= self.page_size,
            "allocation of {} bytes exceeds arena page size {}",
            bytes.len(),
            self.page_size
        );
        if self.pages.is_empty() || self.tail + bytes.len() > self.page_size {
            self.pages
                .push(vec![0u8; self.page_size].into_boxed_slice());
            self.tail = 0;
        }
        let page = (self.pages.len() - 1) as u32;
        let off = self.tail;
        self.pages[page as usize][off..off + bytes.len()].copy_from_slice(bytes);
        self.tail += bytes.len();
        PoolRef {
            page,
            off: off as u32,
            len: bytes.len() as u32,
        }
    }

    pub fn get(&self, r: PoolRef) -> &[u8] {
        let start = r.off as usize;
        &self.pages[r.page as usize][start..start + r.len as usize]
    }

    /// Bytes held by allocated pages (including wasted tails).
    pub fn mem_bytes(&self) -> u64 {
        (self.pages.len() * self.page_size) as u64
    }

    pub fn clear(&mut self) {
        self.pages.clear();
        self.tail = 0;
    }
}
