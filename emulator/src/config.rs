use crate::page::PAGE_SIZE;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Address-space mode of the traced session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressWidth {
    Bits32,
    Bits64,
}

impl AddressWidth {
    pub fn native() -> Self {
        if cfg!(target_pointer_width = "64") {
            AddressWidth::Bits64
        } else {
            AddressWidth::Bits32
        }
    }

    /// Width of a general purpose register in bytes.
    pub fn register_bytes(self) -> usize {
        match self {
            AddressWidth::Bits32 => 4,
            AddressWidth::Bits64 => 8,
        }
    }

    pub fn mask(self) -> u64 {
        match self {
            AddressWidth::Bits32 => 0xffff_ffff,
            AddressWidth::Bits64 => u64::MAX,
        }
    }
}

impl Default for AddressWidth {
    fn default() -> Self {
        Self::native()
    }
}

/// A range whose content changes on its own, e.g. a live system-time page.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolatileRegion {
    pub start: u64,
    pub size: u64,
}

impl VolatileRegion {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr - self.start < self.size
    }
}

/// Shared user data page of 32-bit Windows processes, holds the system clock.
pub const SHARED_USER_DATA_32: VolatileRegion = VolatileRegion {
    start: 0x7FFE0000,
    size: PAGE_SIZE as u64,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub address_width: AddressWidth,
    /// refuse to load pages from `volatile_regions`
    pub skip_volatile_regions: bool,
    pub volatile_regions: Vec<VolatileRegion>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::for_width(AddressWidth::native())
    }
}

impl CacheConfig {
    pub fn for_width(address_width: AddressWidth) -> Self {
        let volatile_regions = match address_width {
            AddressWidth::Bits32 => vec![SHARED_USER_DATA_32],
            AddressWidth::Bits64 => vec![],
        };
        Self {
            address_width,
            skip_volatile_regions: false,
            volatile_regions,
        }
    }

    pub fn skipping_volatile_regions(mut self) -> Self {
        self.skip_volatile_regions = true;
        self
    }

    pub fn is_volatile(&self, addr: u64) -> bool {
        self.skip_volatile_regions && self.volatile_regions.iter().any(|r| r.contains(addr))
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).context("invalid cache configuration")
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("could not read {}", path.display()))?;
        Self::from_json_str(&data).with_context(|| format!("while loading {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volatile_only_when_skipping() {
        let config = CacheConfig::for_width(AddressWidth::Bits32);
        assert!(!config.is_volatile(0x7FFE0014));

        let config = config.skipping_volatile_regions();
        assert!(config.is_volatile(0x7FFE0014));
        assert!(!config.is_volatile(0x7FFE0000 + PAGE_SIZE as u64));
        assert!(!config.is_volatile(0x7FFDFFFF));

        let config = CacheConfig::for_width(AddressWidth::Bits64).skipping_volatile_regions();
        assert!(!config.is_volatile(0x7FFE0014));
    }

    #[test]
    fn test_from_json() {
        let config = CacheConfig::from_json_str(
            r#"{ "address_width": "Bits32", "skip_volatile_regions": true,
                 "volatile_regions": [{ "start": 4096, "size": 4096 }] }"#,
        )
        .unwrap();
        assert_eq!(config.address_width, AddressWidth::Bits32);
        assert!(config.is_volatile(0x1fff));
        assert_eq!(config.address_width.register_bytes(), 4);

        let config = CacheConfig::from_json_str("{}").unwrap();
        assert_eq!(config, CacheConfig::default());

        assert!(CacheConfig::from_json_str(r#"{ "address_width": 12 }"#).is_err());
        assert!(CacheConfig::from_file("/nonexistent/cache.json").is_err());
    }
}
