//! Live process target on Linux, backed by `/proc/<pid>/mem`.

use crate::error::TargetError;
use crate::target::{Protection, ProtectionRegion, TargetMemory};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;

pub struct ProcessTarget {
    pid: u32,
    mem: File,
}

impl ProcessTarget {
    /// Opens the memory of `pid`. The caller needs ptrace access to it.
    pub fn attach(pid: u32) -> Result<Self, TargetError> {
        let mem = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/proc/{}/mem", pid))?;
        log::debug!("attached to process {}", pid);
        Ok(Self { pid, mem })
    }

    pub fn current() -> Result<Self, TargetError> {
        Self::attach(std::process::id())
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn regions(&self) -> Result<Vec<ProtectionRegion>, TargetError> {
        let maps = fs::read_to_string(format!("/proc/{}/maps", self.pid))?;
        Ok(maps.lines().filter_map(parse_maps_line).collect())
    }
}

// "7f0000000000-7f0000021000 rw-p 00000000 00:00 0   [heap]"
fn parse_maps_line(line: &str) -> Option<ProtectionRegion> {
    let mut fields = line.split_whitespace();
    let (start, end) = fields.next()?.split_once('-')?;
    let perms = fields.next()?.as_bytes();
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;

    let mut protection = Protection::empty();
    if perms.first() == Some(&b'r') {
        protection |= Protection::READ;
    }
    if perms.get(1) == Some(&b'w') {
        protection |= Protection::WRITE;
    }
    if perms.get(2) == Some(&b'x') {
        protection |= Protection::EXECUTE;
    }

    Some(ProtectionRegion {
        base: start,
        size: (end - start) as usize,
        protection,
    })
}

impl TargetMemory for ProcessTarget {
    fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), TargetError> {
        self.mem
            .read_exact_at(buf, addr)
            .map_err(|_| TargetError::ReadDenied { addr })
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), TargetError> {
        self.mem
            .write_all_at(data, addr)
            .map_err(|_| TargetError::WriteDenied { addr })
    }

    fn query_protection(&mut self, addr: u64) -> Result<ProtectionRegion, TargetError> {
        self.regions()?
            .into_iter()
            .find(|r| addr >= r.base && addr - r.base < r.size as u64)
            .ok_or(TargetError::NoRegion { addr })
    }

    fn set_protection(
        &mut self,
        base: u64,
        size: usize,
        protection: Protection,
    ) -> Result<Protection, TargetError> {
        // there is no way to mprotect another address space from outside
        if self.pid != std::process::id() {
            return Err(TargetError::Unsupported("changing protection of another process"));
        }

        let old = self.query_protection(base)?.protection;
        let mut prot = libc::PROT_NONE;
        if protection.contains(Protection::READ) {
            prot |= libc::PROT_READ;
        }
        if protection.contains(Protection::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if protection.contains(Protection::EXECUTE) {
            prot |= libc::PROT_EXEC;
        }

        // SAFETY: only the protection of a mapping reported by /proc/self/maps changes
        let rc = unsafe { libc::mprotect(base as usize as *mut libc::c_void, size, prot) };
        if rc != 0 {
            return Err(TargetError::Io(std::io::Error::last_os_error()));
        }
        Ok(old)
    }
}
