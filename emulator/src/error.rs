use std::fmt::{Display, Formatter};

/// Failure reported by a [`crate::target::TargetMemory`] implementation.
#[derive(Debug)]
pub enum TargetError {
    OutOfBounds { addr: u64, size: usize },
    ReadDenied { addr: u64 },
    WriteDenied { addr: u64 },
    NoRegion { addr: u64 },
    Unsupported(&'static str),
    Io(std::io::Error),
}

impl Display for TargetError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetError::OutOfBounds { addr, size } => {
                write!(f, "range 0x{:x}+0x{:x} is outside the target", addr, size)
            }
            TargetError::ReadDenied { addr } => write!(f, "read denied at 0x{:x}", addr),
            TargetError::WriteDenied { addr } => write!(f, "write denied at 0x{:x}", addr),
            TargetError::NoRegion { addr } => write!(f, "no mapped region at 0x{:x}", addr),
            TargetError::Unsupported(what) => write!(f, "unsupported operation: {}", what),
            TargetError::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for TargetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TargetError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TargetError {
    fn from(e: std::io::Error) -> Self {
        TargetError::Io(e)
    }
}

/// Recoverable failure of a page cache access.
#[allow(clippy::enum_variant_names)]
#[derive(Debug)]
pub enum MemoryError {
    /// the address lies in a region configured as volatile
    VolatileRegion { addr: u64 },
    /// the page holding the address could not be fetched from the target
    Load { addr: u64, source: TargetError },
    /// a string read hit a byte that is not printable text
    NotText { addr: u64, byte: u8 },
}

impl Display for MemoryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::VolatileRegion { addr } => {
                write!(f, "refusing to cache volatile address 0x{:x}", addr)
            }
            MemoryError::Load { addr, source } => {
                write!(f, "cannot load page for 0x{:x}: {}", addr, source)
            }
            MemoryError::NotText { addr, byte } => {
                write!(f, "non-text byte 0x{:02x} at 0x{:x}", byte, addr)
            }
        }
    }
}

impl std::error::Error for MemoryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MemoryError::Load { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Reports a condition the cache cannot recover from and unwinds.
///
/// Used for caller-invariant violations and for a shadow cache that may no
/// longer match its target. These are never returned as ordinary errors.
#[track_caller]
pub(crate) fn fatal(args: std::fmt::Arguments<'_>) -> ! {
    log::error!("fatal: {}", args);
    panic!("fatal: {}", args)
}
