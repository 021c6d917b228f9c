/// Note: 2**12 = 4 KiB, the page granularity of the traced target
pub const PAGE_ADDR_SIZE: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_ADDR_SIZE;
pub const PAGE_ADDR_MASK: usize = PAGE_SIZE - 1;

/// Address right-shifted by [`PAGE_ADDR_SIZE`].
pub type PageIndex = u64;

#[inline]
pub fn page_index(addr: u64) -> PageIndex {
    addr >> PAGE_ADDR_SIZE
}

#[inline]
pub fn page_base(index: PageIndex) -> u64 {
    index << PAGE_ADDR_SIZE
}

#[inline]
pub fn page_offset(addr: u64) -> usize {
    (addr as usize) & PAGE_ADDR_MASK
}

/// One page of target memory mirrored by the cache.
#[derive(Debug, Clone)]
pub struct CachedPage {
    pub data: [u8; PAGE_SIZE],
    /// set on every write, cleared only by a successful write-back
    pub dirty: bool,
}

impl Default for CachedPage {
    fn default() -> Self {
        Self::new()
    }
}

impl CachedPage {
    pub fn new() -> Self {
        Self {
            data: [0u8; PAGE_SIZE],
            dirty: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_and_base() {
        assert_eq!(page_index(0xfff), 0);
        assert_eq!(page_index(0x1000), 1);
        assert_eq!(page_base(0x7FFE0), 0x7FFE0000);
        assert_eq!(page_offset(0x12345), 0x345);
        assert!(!CachedPage::new().dirty);
    }
}
