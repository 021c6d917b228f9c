//! The capability through which the cache reaches real memory.

use crate::error::TargetError;
use crate::page::{page_index, PageIndex, PAGE_SIZE};
use bitflags::bitflags;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        const READ    = 0b001;
        const WRITE   = 0b010;
        const EXECUTE = 0b100;
    }
}

/// A run of pages sharing one protection, as reported by the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionRegion {
    pub base: u64,
    pub size: usize,
    pub protection: Protection,
}

/// Page-aligned access to the address space of a traced process.
pub trait TargetMemory {
    fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), TargetError>;

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), TargetError>;

    /// Returns the region containing `addr` together with its protection.
    fn query_protection(&mut self, addr: u64) -> Result<ProtectionRegion, TargetError>;

    /// Applies `protection` to `[base, base + size)` and returns the previous one.
    fn set_protection(
        &mut self,
        base: u64,
        size: usize,
        protection: Protection,
    ) -> Result<Protection, TargetError>;
}

/// Handle shared between a cache and its copies.
pub type SharedTarget = Rc<RefCell<dyn TargetMemory>>;

/// How the buffer target treats a write-back touching its very last page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoundCheck {
    /// `addr + size <= len` is in bounds
    #[default]
    Inclusive,
    /// `addr + size < len` is required, so the final page is never written back
    Strict,
}

/// Fixed in-memory address space starting at address zero.
///
/// Counts reads per page and total writes, and can simulate read failures and
/// read-only pages.
#[derive(Debug)]
pub struct BufferTarget {
    data: Vec<u8>,
    bound_check: BoundCheck,
    protections: Vec<Protection>,
    denied_reads: BTreeSet<PageIndex>,
    protection_locked: bool,
    reads: BTreeMap<PageIndex, usize>,
    writes: usize,
}

impl BufferTarget {
    /// # Panics
    ///
    /// Panics if the buffer length is not a multiple of [`PAGE_SIZE`].
    pub fn new(data: Vec<u8>) -> Self {
        assert!(
            data.len() % PAGE_SIZE == 0,
            "buffer size 0x{:x} is not a multiple of the page size",
            data.len()
        );
        let pages = data.len() / PAGE_SIZE;
        Self {
            data,
            bound_check: BoundCheck::default(),
            protections: vec![Protection::READ | Protection::WRITE; pages],
            denied_reads: BTreeSet::new(),
            protection_locked: false,
            reads: BTreeMap::new(),
            writes: 0,
        }
    }

    pub fn zeroed(pages: usize) -> Self {
        Self::new(vec![0u8; pages * PAGE_SIZE])
    }

    pub fn with_bound_check(mut self, bound_check: BoundCheck) -> Self {
        self.bound_check = bound_check;
        self
    }

    pub fn shared(self) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(self))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Direct access that bypasses protections and counters.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Sets the protection of every page overlapping `[addr, addr + size)`.
    pub fn protect(&mut self, addr: u64, size: usize, protection: Protection) {
        if size == 0 || self.protections.is_empty() {
            return;
        }
        let first = page_index(addr) as usize;
        let last = page_index(addr.saturating_add(size as u64 - 1)) as usize;
        for p in first..=last.min(self.protections.len() - 1) {
            self.protections[p] = protection;
        }
    }

    /// Makes every read of the page containing `addr` fail.
    pub fn deny_reads(&mut self, addr: u64) {
        self.denied_reads.insert(page_index(addr));
    }

    /// Makes every later `set_protection` call fail.
    pub fn lock_protection(&mut self) {
        self.protection_locked = true;
    }

    pub fn protection_at(&self, addr: u64) -> Protection {
        self.protections[page_index(addr) as usize]
    }

    pub fn read_count(&self, index: PageIndex) -> usize {
        self.reads.get(&index).copied().unwrap_or(0)
    }

    pub fn total_reads(&self) -> usize {
        self.reads.values().sum()
    }

    pub fn write_count(&self) -> usize {
        self.writes
    }

    fn check_range(&self, addr: u64, size: usize, strict: bool) -> Result<usize, TargetError> {
        let end = addr.checked_add(size as u64);
        let in_bounds = match (end, strict) {
            (Some(end), false) => end <= self.data.len() as u64,
            (Some(end), true) => end < self.data.len() as u64,
            (None, _) => false,
        };
        if !in_bounds {
            return Err(TargetError::OutOfBounds { addr, size });
        }
        Ok(addr as usize)
    }

    fn pages_of(addr: u64, size: usize) -> std::ops::RangeInclusive<usize> {
        page_index(addr) as usize..=page_index(addr + size.max(1) as u64 - 1) as usize
    }
}

impl TargetMemory for BufferTarget {
    fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), TargetError> {
        let start = self.check_range(addr, buf.len(), false)?;
        for p in Self::pages_of(addr, buf.len()) {
            if self.denied_reads.contains(&(p as PageIndex))
                || !self.protections[p].contains(Protection::READ)
            {
                return Err(TargetError::ReadDenied { addr });
            }
        }
        for p in Self::pages_of(addr, buf.len()) {
            *self.reads.entry(p as PageIndex).or_insert(0) += 1;
        }
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), TargetError> {
        let strict = self.bound_check == BoundCheck::Strict;
        let start = self.check_range(addr, data.len(), strict)?;
        if Self::pages_of(addr, data.len())
            .any(|p| !self.protections[p].contains(Protection::WRITE))
        {
            return Err(TargetError::WriteDenied { addr });
        }
        self.data[start..start + data.len()].copy_from_slice(data);
        self.writes += 1;
        Ok(())
    }

    fn query_protection(&mut self, addr: u64) -> Result<ProtectionRegion, TargetError> {
        let index = page_index(addr) as usize;
        let protection = *self
            .protections
            .get(index)
            .ok_or(TargetError::NoRegion { addr })?;

        let mut first = index;
        while first > 0 && self.protections[first - 1] == protection {
            first -= 1;
        }
        let mut last = index;
        while last + 1 < self.protections.len() && self.protections[last + 1] == protection {
            last += 1;
        }

        Ok(ProtectionRegion {
            base: (first * PAGE_SIZE) as u64,
            size: (last - first + 1) * PAGE_SIZE,
            protection,
        })
    }

    fn set_protection(
        &mut self,
        base: u64,
        size: usize,
        protection: Protection,
    ) -> Result<Protection, TargetError> {
        if self.protection_locked {
            return Err(TargetError::Unsupported("protection is locked"));
        }
        self.check_range(base, size.max(1), false)?;
        let old = self.protection_at(base);
        self.protect(base, size, protection);
        Ok(old)
    }
}
