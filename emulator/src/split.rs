//! Decomposition of multi-byte accesses that straddle a page boundary.
//!
//! An access that fits inside one page is a single piece. A straddling
//! octabyte becomes two tetrabytes, and a straddling tetrabyte or wyde
//! becomes single bytes. The pieces are listed from the lowest address up,
//! and `shift` places each piece inside the little-endian value, so the same
//! list drives both reads and writes.

/// A sub-access that lies entirely within one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece {
    pub address: u64,
    pub width: usize,
    /// bit position of this piece inside the full value
    pub shift: u32,
}

impl Piece {
    pub fn mask(&self) -> u64 {
        if self.width >= 8 {
            u64::MAX
        } else {
            (1u64 << (self.width * 8)) - 1
        }
    }
}

#[inline]
pub fn fits_in_page(address: u64, width: usize, page_size: usize) -> bool {
    let offset = (address as usize) & (page_size - 1);
    offset + width <= page_size
}

/// Splits an access of `width` bytes at `address` into page-local pieces.
///
/// # Panics
///
/// Panics if `width` is not 1, 2, 4 or 8, or `page_size` is not a power of two.
pub fn split_access(address: u64, width: usize, page_size: usize) -> Vec<Piece> {
    assert!(
        matches!(width, 1 | 2 | 4 | 8),
        "unsupported access width: {}",
        width
    );
    assert!(page_size.is_power_of_two(), "invalid page size: {}", page_size);

    let mut pieces = Vec::with_capacity(width);
    push_pieces(address, width, 0, page_size, &mut pieces);
    pieces
}

fn push_pieces(address: u64, width: usize, shift: u32, page_size: usize, out: &mut Vec<Piece>) {
    if width == 1 || fits_in_page(address, width, page_size) {
        out.push(Piece {
            address,
            width,
            shift,
        });
        return;
    }

    match width {
        8 => {
            push_pieces(address, 4, shift, page_size, out);
            push_pieces(address.wrapping_add(4), 4, shift + 32, page_size, out);
        }
        _ => {
            for i in 0..width {
                out.push(Piece {
                    address: address.wrapping_add(i as u64),
                    width: 1,
                    shift: shift + (i as u32) * 8,
                });
            }
        }
    }
}
