#[allow(clippy::module_inception)]
#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::rc::Rc;

    use proptest::prelude::*;

    use crate::config::{AddressWidth, CacheConfig};
    use crate::error::MemoryError;
    use crate::memory::MemoryCache;
    use crate::page::{page_index, PAGE_SIZE};
    use crate::target::{BoundCheck, BufferTarget, Protection};

    const PAGES: usize = 4;

    fn setup(target: BufferTarget) -> (Rc<RefCell<BufferTarget>>, MemoryCache) {
        env_logger::try_init().unwrap_or_default();
        let target = target.shared();
        let mem = MemoryCache::new(target.clone(), CacheConfig::for_width(AddressWidth::Bits64));
        (target, mem)
    }

    #[test]
    fn test_round_trip_all_widths() {
        let (_, mut mem) = setup(BufferTarget::zeroed(PAGES));
        for addr in [0x10u64, 0xffe, 0xfff, 0x1ffc, 0x1ffd, 0x2ff9] {
            mem.write_byte(addr, 0xA5).unwrap();
            assert_eq!(mem.read_byte(addr).unwrap(), 0xA5);
            mem.write_wyde(addr, 0xBEEF).unwrap();
            assert_eq!(mem.read_wyde(addr).unwrap(), 0xBEEF);
            mem.write_tetrabyte(addr, 0xDEADBEEF).unwrap();
            assert_eq!(mem.read_tetrabyte(addr).unwrap(), 0xDEADBEEF);
            mem.write_octabyte(addr, 0x0123_4567_89AB_CDEF).unwrap();
            assert_eq!(mem.read_octabyte(addr).unwrap(), 0x0123_4567_89AB_CDEF);
        }
    }

    #[test]
    fn test_straddling_tetrabyte_is_little_endian() {
        let (target, mut mem) = setup(BufferTarget::zeroed(PAGES));
        mem.write_tetrabyte(4095, 0x11223344).unwrap();

        assert_eq!(mem.read_byte(4095).unwrap(), 0x44);
        assert_eq!(mem.read_byte(4096).unwrap(), 0x33);
        assert_eq!(mem.read_byte(4097).unwrap(), 0x22);
        assert_eq!(mem.read_byte(4098).unwrap(), 0x11);
        assert_eq!(mem.dirty_pages(), vec![0, 1]);

        mem.flush();
        assert_eq!(&target.borrow().bytes()[4095..4099], &[0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn test_straddling_octabyte() {
        let (target, mut mem) = setup(BufferTarget::zeroed(PAGES));
        mem.write_octabyte(0x1ffe, 0x8877_6655_4433_2211).unwrap();
        mem.flush();
        assert_eq!(
            &target.borrow().bytes()[0x1ffe..0x2006],
            &0x8877_6655_4433_2211u64.to_le_bytes()
        );
        assert_eq!(mem.read_wyde(0x1fff).unwrap(), 0x3322);
    }

    #[test]
    fn test_dirty_tracking_and_flush() {
        let (target, mut mem) = setup(BufferTarget::zeroed(PAGES));
        mem.read_tetrabyte(0x10).unwrap();
        assert_eq!(mem.is_dirty(0), Some(false));
        assert_eq!(mem.is_dirty(1), None);

        // nothing dirty: no target writes at all
        mem.flush();
        assert_eq!(target.borrow().write_count(), 0);

        mem.write_wyde(0x2010, 0x1234).unwrap();
        assert_eq!(mem.is_dirty(2), Some(true));
        assert_eq!(target.borrow().bytes()[0x2010], 0);

        mem.flush();
        assert_eq!(target.borrow().write_count(), 1);
        assert_eq!(target.borrow().bytes()[0x2010], 0x34);
        assert!(mem.dirty_pages().is_empty());

        mem.flush();
        assert_eq!(target.borrow().write_count(), 1);
    }

    #[test]
    fn test_single_fetch_per_page() {
        let (target, mut mem) = setup(BufferTarget::zeroed(PAGES));
        for addr in (0x1000..0x2000u64).step_by(0x80) {
            mem.read_octabyte(addr).unwrap();
            mem.write_byte(addr, 1).unwrap();
        }
        mem.read_byte(0x10).unwrap();
        mem.read_byte(0x1234).unwrap();
        assert_eq!(target.borrow().read_count(1), 1);
        assert_eq!(target.borrow().read_count(0), 1);
        assert_eq!(mem.page_count(), 2);
    }

    #[test]
    fn test_fast_slot_matches_map() {
        let mut buffer = BufferTarget::zeroed(PAGES);
        buffer.bytes_mut()[0x1000..0x1004].copy_from_slice(&[1, 2, 3, 4]);
        let (_, mut mem) = setup(buffer);

        let cold = mem.find_page(0x1002).unwrap();
        let warm = mem.find_page(0x1800).unwrap();
        assert!(Rc::ptr_eq(&cold, &warm));

        mem.find_page(0x10).unwrap();
        mem.write_byte(0x1001, 9).unwrap();
        mem.last_page = None;
        let from_map = mem.find_page(0x1000).unwrap();
        assert!(Rc::ptr_eq(&from_map, &cold));
        assert_eq!(&from_map.borrow().data[..4], &[1, 9, 3, 4]);
    }

    #[test]
    fn test_reload_keeps_dirty_page() {
        let (target, mut mem) = setup(BufferTarget::zeroed(PAGES));
        mem.write_byte(0x10, 7).unwrap();
        let cached = mem.find_page(0x10).unwrap();

        let reloaded = mem.load_page(0x10).unwrap();
        assert!(Rc::ptr_eq(&reloaded, &cached));
        assert_eq!(target.borrow().read_count(0), 1);

        mem.last_page = None;
        let resolved = mem.find_page(0x20).unwrap();
        assert!(Rc::ptr_eq(&resolved, &cached));
        assert_eq!(mem.read_byte(0x10).unwrap(), 7);
        assert_eq!(mem.is_dirty(0), Some(true));

        mem.flush();
        assert_eq!(target.borrow().bytes()[0x10], 7);
    }

    #[test]
    fn test_copy_isolation() {
        let (target, mut mem) = setup(BufferTarget::zeroed(PAGES));
        mem.write_tetrabyte(0x100, 0xAAAA_AAAA).unwrap();
        mem.read_byte(0x1000).unwrap();

        let mut copy = mem.clone();
        copy.write_tetrabyte(0x100, 0xBBBB_BBBB).unwrap();
        copy.write_byte(0x1000, 0xCC).unwrap();
        assert_eq!(mem.read_tetrabyte(0x100).unwrap(), 0xAAAA_AAAA);
        assert_eq!(mem.is_dirty(1), Some(false));

        mem.write_byte(0x104, 0x11).unwrap();
        assert_eq!(copy.read_byte(0x104).unwrap(), 0);

        // the copy is discarded without touching the target
        copy.close(false);
        assert_eq!(target.borrow().write_count(), 0);
        mem.flush();
        assert_eq!(target.borrow().bytes()[0x100], 0xAA);
    }

    #[test]
    fn test_failed_loads() {
        let mut buffer = BufferTarget::zeroed(PAGES);
        buffer.deny_reads(0x2000);
        let (_, mut mem) = setup(buffer);

        assert!(matches!(mem.read_byte(0x2000), Err(MemoryError::Load { .. })));
        assert!(mem.read_tetrabyte(0x1ffe).is_err());
        assert!(mem.read_octabyte((PAGES * PAGE_SIZE) as u64).is_err());
        assert_eq!(mem.is_dirty(2), None);

        // the low part of a straddling write lands before the high part fails
        assert!(mem.write_tetrabyte(0x1ffe, 0x11223344).is_err());
        assert_eq!(mem.read_wyde(0x1ffe).unwrap(), 0x3344);
        assert_eq!(mem.is_dirty(1), Some(true));

        let mut buf = [0u8; 8];
        assert!(mem.read_buffer(0x1ffc, &mut buf).is_err());
        assert_eq!(&buf[..4], &[0, 0, 0x44, 0x33]);
        assert!(mem.write_buffer(0x1ffe, &[1, 2, 3]).is_err());
        assert_eq!(mem.read_wyde(0x1ffe).unwrap(), 0x0201);
    }

    #[test]
    fn test_volatile_region_never_reaches_target() {
        env_logger::try_init().unwrap_or_default();
        let target = BufferTarget::zeroed(PAGES).shared();
        let config = CacheConfig {
            volatile_regions: vec![crate::config::VolatileRegion {
                start: 0x3000,
                size: PAGE_SIZE as u64,
            }],
            ..CacheConfig::for_width(AddressWidth::Bits32).skipping_volatile_regions()
        };
        let mut mem = MemoryCache::new(target.clone(), config);

        assert!(matches!(
            mem.read_byte(0x3004),
            Err(MemoryError::VolatileRegion { addr: 0x3004 })
        ));
        assert_eq!(target.borrow().read_count(page_index(0x3000)), 0);
        assert!(mem.read_byte(0x2004).is_ok());
    }

    #[test]
    fn test_register_width() {
        let target = BufferTarget::zeroed(PAGES).shared();
        let mut mem32 = MemoryCache::new(target.clone(), CacheConfig::for_width(AddressWidth::Bits32));
        let mut mem64 = MemoryCache::new(target, CacheConfig::for_width(AddressWidth::Bits64));

        mem32.write_register_width(0x100, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(mem32.read_octabyte(0x100).unwrap(), 0x5566_7788);
        assert_eq!(mem32.read_register_width(0x100).unwrap(), 0x5566_7788);

        mem64.write_register_width(0x100, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(mem64.read_register_width(0x100).unwrap(), 0x1122_3344_5566_7788);
    }

    #[test]
    #[should_panic(expected = "unsupported access width")]
    fn test_write_value_bad_width() {
        let (_, mut mem) = setup(BufferTarget::zeroed(PAGES));
        let _ = mem.write_value(0x10, 3, 0);
    }

    #[test]
    #[should_panic(expected = "is not cached")]
    fn test_mark_dirty_unloaded_page() {
        let (_, mut mem) = setup(BufferTarget::zeroed(PAGES));
        mem.mark_dirty(2);
    }

    #[test]
    fn test_flush_relaxes_protection() {
        let mut buffer = BufferTarget::zeroed(PAGES);
        buffer.protect(0x1000, 2 * PAGE_SIZE, Protection::READ | Protection::EXECUTE);
        let (target, mut mem) = setup(buffer);

        mem.write_octabyte(0x1800, 0x0102_0304_0506_0708).unwrap();
        mem.flush();

        let target = target.borrow();
        assert_eq!(&target.bytes()[0x1800..0x1808], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(target.protection_at(0x1000), Protection::READ | Protection::EXECUTE);
        assert_eq!(target.protection_at(0x2000), Protection::READ | Protection::EXECUTE);
        assert!(mem.dirty_pages().is_empty());
    }

    #[test]
    fn test_flush_failure_keeps_page_dirty() {
        let mut buffer = BufferTarget::zeroed(PAGES);
        buffer.protect(0x1000, PAGE_SIZE, Protection::READ);
        buffer.lock_protection();
        let (_, mut mem) = setup(buffer);

        mem.write_byte(0x1000, 1).unwrap();
        let r = catch_unwind(AssertUnwindSafe(|| mem.flush()));
        assert!(r.is_err());
        assert_eq!(mem.is_dirty(1), Some(true));
    }

    #[test]
    fn test_last_page_inclusive_bound() {
        let (target, mut mem) = setup(BufferTarget::zeroed(PAGES));
        let last = ((PAGES - 1) * PAGE_SIZE) as u64;
        mem.write_byte(last, 7).unwrap();
        mem.flush();
        assert_eq!(target.borrow().bytes()[last as usize], 7);
    }

    #[test]
    #[should_panic(expected = "second write")]
    fn test_last_page_strict_bound() {
        let (_, mut mem) = setup(BufferTarget::zeroed(PAGES).with_bound_check(BoundCheck::Strict));
        mem.write_byte(0x10, 7).unwrap();
        mem.flush();

        mem.write_byte(((PAGES - 1) * PAGE_SIZE) as u64, 7).unwrap();
        mem.flush();
    }

    #[test]
    fn test_compare_with_target() {
        let (target, mut mem) = setup(BufferTarget::zeroed(PAGES));
        mem.write_wyde(0x2000, 0xABCD).unwrap();
        mem.read_byte(0x1000).unwrap();
        target.borrow_mut().bytes_mut()[0x1000] = 0x99;

        let diff = mem.diff_with_target();
        assert_eq!(diff.len(), 2);
        assert_eq!((diff[0].address, diff[0].cached, diff[0].target), (0x2000, 0xCD, 0));
        assert_eq!((diff[1].address, diff[1].cached, diff[1].target), (0x2001, 0xAB, 0));
        assert!(!mem.compare_with_target());

        mem.flush();
        assert!(mem.compare_with_target());
        assert_eq!(mem.page_count(), 2);
    }

    #[test]
    #[should_panic(expected = "still to be flushed")]
    fn test_close_with_unflushed_pages() {
        let (_, mut mem) = setup(BufferTarget::zeroed(PAGES));
        mem.write_byte(0x10, 1).unwrap();
        mem.dump_state();
        mem.close(true);
    }

    #[test]
    fn test_close_after_flush() {
        let (_, mut mem) = setup(BufferTarget::zeroed(PAGES));
        mem.write_byte(0x10, 1).unwrap();
        mem.flush();
        mem.close(true);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn round_trip_any_width(
            addr in 0u64..(PAGES * PAGE_SIZE - 8) as u64,
            width in prop::sample::select(vec![1usize, 2, 4, 8]),
            value in any::<u64>(),
        ) {
            let target = BufferTarget::zeroed(PAGES).shared();
            let mut mem = MemoryCache::new(target.clone(), CacheConfig::default());
            let mask = if width == 8 { u64::MAX } else { (1u64 << (width * 8)) - 1 };

            mem.write_value(addr, width, value).unwrap();
            prop_assert_eq!(mem.read_value(addr, width).unwrap(), value & mask);

            mem.flush();
            let mut fresh = MemoryCache::new(target, CacheConfig::default());
            prop_assert_eq!(fresh.read_value(addr, width).unwrap(), value & mask);
        }
    }
}
