use crate::config::CacheConfig;
use crate::error::{fatal, MemoryError};
use crate::page::{page_base, page_index, page_offset, CachedPage, PageIndex, PAGE_SIZE};
use crate::split::{fits_in_page, split_access};
use crate::target::{Protection, SharedTarget, TargetMemory};
use byteorder::{ByteOrder, LittleEndian};
use itertools::Itertools;
use log::{debug, trace, warn};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// A byte whose cached value differs from the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteMismatch {
    pub address: u64,
    pub cached: u8,
    pub target: u8,
}

/// Write-deferred, page granular mirror of a target's memory.
///
/// Pages are fetched on first touch and never evicted. Writes only reach the
/// target through [`MemoryCache::flush`].
pub struct MemoryCache {
    target: SharedTarget,
    config: CacheConfig,

    /// page index -> cached page
    pages: BTreeMap<PageIndex, Rc<RefCell<CachedPage>>>,

    // the page used last, shares its allocation with the entry in `pages`.
    // consecutive accesses mostly land in the same page, this skips the map lookup
    pub(crate) last_page: Option<(PageIndex, Rc<RefCell<CachedPage>>)>,
}

impl Clone for MemoryCache {
    /// Deep copy of every cached page and dirty flag, bound to the same target.
    fn clone(&self) -> Self {
        let pages = self
            .pages
            .iter()
            .map(|(index, page)| (*index, Rc::new(RefCell::new(page.borrow().clone()))))
            .collect();

        Self {
            target: self.target.clone(),
            config: self.config.clone(),
            pages,
            last_page: None,
        }
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("config", &self.config)
            .field("pages", &self.page_count())
            .field("dirty", &self.dirty_pages())
            .finish()
    }
}

impl MemoryCache {
    pub fn new(target: SharedTarget, config: CacheConfig) -> Self {
        Self {
            target,
            config,
            pages: BTreeMap::new(),
            last_page: None,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn dirty_pages(&self) -> Vec<PageIndex> {
        self.pages
            .iter()
            .filter(|(_, page)| page.borrow().dirty)
            .map(|(index, _)| *index)
            .collect()
    }

    /// `None` if the page has never been loaded.
    pub fn is_dirty(&self, index: PageIndex) -> Option<bool> {
        self.pages.get(&index).map(|page| page.borrow().dirty)
    }

    /// Fetches the page holding `addr` from the target and caches it clean.
    /// A page that is already cached is returned as is.
    pub(crate) fn load_page(&mut self, addr: u64) -> Result<Rc<RefCell<CachedPage>>, MemoryError> {
        if self.config.is_volatile(addr) {
            trace!("not loading volatile address 0x{:x}", addr);
            return Err(MemoryError::VolatileRegion { addr });
        }

        let index = page_index(addr);
        if let Some(page) = self.pages.get(&index) {
            return Ok(page.clone());
        }
        let mut page = CachedPage::new();
        self.target
            .borrow_mut()
            .read(page_base(index), &mut page.data)
            .map_err(|source| MemoryError::Load { addr, source })?;

        trace!("loaded page 0x{:x}", page_base(index));
        let page = Rc::new(RefCell::new(page));
        self.pages.insert(index, page.clone());
        Ok(page)
    }

    /// Resolves the cached page holding `addr`, loading it on a miss.
    pub(crate) fn find_page(&mut self, addr: u64) -> Result<Rc<RefCell<CachedPage>>, MemoryError> {
        let index = page_index(addr);
        if let Some((last_index, page)) = &self.last_page {
            if *last_index == index {
                return Ok(page.clone());
            }
        }

        let page = match self.pages.get(&index) {
            Some(page) => page.clone(),
            None => self.load_page(addr)?,
        };
        self.last_page = Some((index, page.clone()));
        Ok(page)
    }

    /// Sets the dirty flag of an already cached page.
    ///
    /// # Panics
    ///
    /// Panics if the page was never loaded.
    pub fn mark_dirty(&mut self, index: PageIndex) {
        match self.pages.get(&index) {
            Some(page) => page.borrow_mut().dirty = true,
            None => fatal(format_args!(
                "marking page 0x{:x} dirty, but it is not cached",
                page_base(index)
            )),
        }
    }

    // `addr .. addr + width` must lie within one page
    fn read_in_page(&mut self, addr: u64, width: usize) -> Result<u64, MemoryError> {
        let page = self.find_page(addr)?;
        let page = page.borrow();
        let offset = page_offset(addr);
        Ok(LittleEndian::read_uint(&page.data[offset..offset + width], width))
    }

    fn write_in_page(&mut self, addr: u64, width: usize, value: u64) -> Result<(), MemoryError> {
        let page = self.find_page(addr)?;
        let offset = page_offset(addr);
        LittleEndian::write_uint(
            &mut page.borrow_mut().data[offset..offset + width],
            value,
            width,
        );
        self.mark_dirty(page_index(addr));
        Ok(())
    }

    fn read_sized(&mut self, addr: u64, width: usize) -> Result<u64, MemoryError> {
        // the first page must be reachable before anything else is attempted
        self.find_page(addr)?;
        if fits_in_page(addr, width, PAGE_SIZE) {
            return self.read_in_page(addr, width);
        }

        let mut value = 0u64;
        for piece in split_access(addr, width, PAGE_SIZE).iter().rev() {
            value |= self.read_in_page(piece.address, piece.width)? << piece.shift;
        }
        Ok(value)
    }

    // a straddling write that fails halfway leaves the pieces before it written
    fn write_sized(&mut self, addr: u64, width: usize, value: u64) -> Result<(), MemoryError> {
        self.find_page(addr)?;
        if fits_in_page(addr, width, PAGE_SIZE) {
            return self.write_in_page(addr, width, value);
        }

        for piece in split_access(addr, width, PAGE_SIZE) {
            self.write_in_page(piece.address, piece.width, (value >> piece.shift) & piece.mask())?;
        }
        Ok(())
    }

    pub fn read_byte(&mut self, addr: u64) -> Result<u8, MemoryError> {
        self.read_in_page(addr, 1).map(|v| v as u8)
    }

    pub fn write_byte(&mut self, addr: u64, value: u8) -> Result<(), MemoryError> {
        self.write_in_page(addr, 1, value as u64)
    }

    pub fn read_wyde(&mut self, addr: u64) -> Result<u16, MemoryError> {
        self.read_sized(addr, 2).map(|v| v as u16)
    }

    pub fn write_wyde(&mut self, addr: u64, value: u16) -> Result<(), MemoryError> {
        self.write_sized(addr, 2, value as u64)
    }

    pub fn read_tetrabyte(&mut self, addr: u64) -> Result<u32, MemoryError> {
        self.read_sized(addr, 4).map(|v| v as u32)
    }

    pub fn write_tetrabyte(&mut self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.write_sized(addr, 4, value as u64)
    }

    pub fn read_octabyte(&mut self, addr: u64) -> Result<u64, MemoryError> {
        self.read_sized(addr, 8)
    }

    pub fn write_octabyte(&mut self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.write_sized(addr, 8, value)
    }

    /// Reads a value of the session's native register width.
    pub fn read_register_width(&mut self, addr: u64) -> Result<u64, MemoryError> {
        let width = self.config.address_width.register_bytes();
        self.read_value(addr, width)
    }

    pub fn write_register_width(&mut self, addr: u64, value: u64) -> Result<(), MemoryError> {
        let width = self.config.address_width.register_bytes();
        self.write_value(addr, width, value)
    }

    /// # Panics
    ///
    /// Panics if `width` is not 1, 2, 4 or 8.
    pub fn read_value(&mut self, addr: u64, width: usize) -> Result<u64, MemoryError> {
        match width {
            1 => self.read_byte(addr).map(u64::from),
            2 => self.read_wyde(addr).map(u64::from),
            4 => self.read_tetrabyte(addr).map(u64::from),
            8 => self.read_octabyte(addr),
            _ => fatal(format_args!("unsupported access width {}", width)),
        }
    }

    /// Stores the low `width` bytes of `value`.
    ///
    /// # Panics
    ///
    /// Panics if `width` is not 1, 2, 4 or 8.
    pub fn write_value(&mut self, addr: u64, width: usize, value: u64) -> Result<(), MemoryError> {
        match width {
            1 => self.write_byte(addr, value as u8),
            2 => self.write_wyde(addr, value as u16),
            4 => self.write_tetrabyte(addr, value as u32),
            8 => self.write_octabyte(addr, value),
            _ => fatal(format_args!("unsupported access width {}", width)),
        }
    }

    /// Stops at the first unreadable byte; bytes before it are already copied.
    pub fn read_buffer(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.read_byte(addr.wrapping_add(i as u64))?;
        }
        Ok(())
    }

    /// Stops at the first unwritable byte; bytes before it stay written.
    pub fn write_buffer(&mut self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        for (i, b) in data.iter().enumerate() {
            self.write_byte(addr.wrapping_add(i as u64), *b)?;
        }
        Ok(())
    }

    /// Writes every dirty page back to the target.
    ///
    /// A write-back that fails is retried once with the region made writable,
    /// after which the original protection is restored.
    ///
    /// # Panics
    ///
    /// Panics if the retry path fails in any step. The page stays dirty and the
    /// target can no longer be assumed to match the cache.
    pub fn flush(&mut self) {
        let mut target = self.target.borrow_mut();
        for (index, page) in self.pages.iter() {
            let mut page = page.borrow_mut();
            if !page.dirty {
                continue;
            }

            let addr = page_base(*index);
            if let Err(e) = target.write(addr, &page.data) {
                warn!(
                    "write-back of page 0x{:x} failed: {}, relaxing protection",
                    addr, e
                );
                write_unprotected(&mut *target, addr, &page.data);
            }

            page.dirty = false;
            debug!("flushed page 0x{:x}", addr);
        }
    }

    /// Re-reads every dirty page from the target and lists the bytes that differ.
    ///
    /// # Panics
    ///
    /// Panics if a dirty page can no longer be read from the target.
    pub fn diff_with_target(&self) -> Vec<ByteMismatch> {
        let mut target = self.target.borrow_mut();
        let mut tmp = [0u8; PAGE_SIZE];
        let mut mismatches = vec![];

        for (index, page) in self.pages.iter() {
            let page = page.borrow();
            if !page.dirty {
                continue;
            }

            let addr = page_base(*index);
            if let Err(e) = target.read(addr, &mut tmp) {
                fatal(format_args!("can't read page 0x{:x} back: {}", addr, e));
            }

            mismatches.extend(
                page.data
                    .iter()
                    .zip(tmp.iter())
                    .positions(|(cached, real)| cached != real)
                    .map(|offset| ByteMismatch {
                        address: addr + offset as u64,
                        cached: page.data[offset],
                        target: tmp[offset],
                    }),
            );
        }

        mismatches
    }

    /// Debug consistency check, logs every differing byte.
    pub fn compare_with_target(&self) -> bool {
        let mismatches = self.diff_with_target();
        for m in mismatches.iter() {
            warn!(
                "bytes are different at 0x{:x}: in cache: 0x{:02X}, in memory: 0x{:02X}",
                m.address, m.cached, m.target
            );
        }
        mismatches.is_empty()
    }

    pub fn dump_state(&self) {
        debug!("memory cache: {} pages", self.pages.len());
        for (index, page) in self.pages.iter() {
            debug!("addr=0x{:x}, dirty={}", page_base(*index), page.borrow().dirty);
        }
    }

    /// Drops the cache.
    ///
    /// # Panics
    ///
    /// With `check_unflushed` set, panics if any page is still dirty, since
    /// those writes would be lost silently.
    pub fn close(self, check_unflushed: bool) {
        if check_unflushed {
            let dirty = self.dirty_pages();
            if !dirty.is_empty() {
                fatal(format_args!(
                    "{} pages are still to be flushed: {:x?}",
                    dirty.len(),
                    dirty.iter().map(|i| page_base(*i)).collect_vec()
                ));
            }
        }
    }
}

fn write_unprotected(target: &mut dyn TargetMemory, addr: u64, data: &[u8]) {
    let region = target.query_protection(addr).unwrap_or_else(|e| {
        fatal(format_args!(
            "can't query protection of 0x{:x}: {}",
            addr, e
        ))
    });

    let old = target
        .set_protection(
            region.base,
            region.size,
            region.protection | Protection::READ | Protection::WRITE,
        )
        .unwrap_or_else(|e| fatal(format_args!("first protection change failed: {}", e)));

    if let Err(e) = target.write(addr, data) {
        fatal(format_args!("second write to 0x{:x} also failed: {}", addr, e));
    }

    if let Err(e) = target.set_protection(region.base, region.size, old) {
        fatal(format_args!("restoring protection failed: {}", e));
    }
}
