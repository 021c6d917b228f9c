//! Register and flag state the emulator reads and writes.

use bitflags::bitflags;
use std::fmt::{Display, Formatter};

/// General purpose registers in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Gpr {
    Rax = 0,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

pub const GPR_COUNT: usize = 16;

/// The slice of a general purpose register an operand names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegPart {
    /// bits 0..8, e.g. `al`
    Low8,
    /// bits 8..16, e.g. `ah`
    High8,
    Word,
    Dword,
    Qword,
}

impl RegPart {
    pub fn width(self) -> usize {
        match self {
            RegPart::Low8 | RegPart::High8 => 1,
            RegPart::Word => 2,
            RegPart::Dword => 4,
            RegPart::Qword => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register {
    pub gpr: Gpr,
    pub part: RegPart,
}

impl Register {
    pub const fn new(gpr: Gpr, part: RegPart) -> Self {
        Self { gpr, part }
    }

    pub const fn qword(gpr: Gpr) -> Self {
        Self::new(gpr, RegPart::Qword)
    }

    pub const fn dword(gpr: Gpr) -> Self {
        Self::new(gpr, RegPart::Dword)
    }

    pub const fn word(gpr: Gpr) -> Self {
        Self::new(gpr, RegPart::Word)
    }

    pub const fn low8(gpr: Gpr) -> Self {
        Self::new(gpr, RegPart::Low8)
    }

    pub fn width(&self) -> usize {
        self.part.width()
    }

    /// Extracts this register's bits from the full 64-bit value.
    pub fn extract(&self, full: u64) -> u64 {
        match self.part {
            RegPart::Low8 => full & 0xff,
            RegPart::High8 => (full >> 8) & 0xff,
            RegPart::Word => full & 0xffff,
            RegPart::Dword => full & 0xffff_ffff,
            RegPart::Qword => full,
        }
    }

    /// Merges `value` into `full` the way a write to this register does:
    /// 32-bit writes clear the upper half, narrower writes keep it.
    pub fn merge(&self, full: u64, value: u64) -> u64 {
        match self.part {
            RegPart::Low8 => (full & !0xff) | (value & 0xff),
            RegPart::High8 => (full & !0xff00) | ((value & 0xff) << 8),
            RegPart::Word => (full & !0xffff) | (value & 0xffff),
            RegPart::Dword => value & 0xffff_ffff,
            RegPart::Qword => value,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u64 {
        const CF = 1 << 0;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
    }
}

/// Access to the register file of the thread being emulated.
pub trait RegisterContext {
    fn gpr(&self, gpr: Gpr) -> u64;
    fn set_gpr(&mut self, gpr: Gpr, value: u64);
    fn ip(&self) -> u64;
    fn set_ip(&mut self, ip: u64);
    fn flags(&self) -> Flags;
    fn set_flags(&mut self, flags: Flags);

    fn register(&self, reg: Register) -> u64 {
        reg.extract(self.gpr(reg.gpr))
    }

    fn set_register(&mut self, reg: Register, value: u64) {
        let full = reg.merge(self.gpr(reg.gpr), value);
        self.set_gpr(reg.gpr, full);
    }
}

/// Plain x86 thread context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    pub gprs: [u64; GPR_COUNT],
    pub ip: u64,
    pub flags: Flags,
}

impl Context {
    pub fn new(ip: u64) -> Self {
        Self {
            ip,
            ..Default::default()
        }
    }
}

impl RegisterContext for Context {
    fn gpr(&self, gpr: Gpr) -> u64 {
        self.gprs[gpr as usize]
    }

    fn set_gpr(&mut self, gpr: Gpr, value: u64) {
        self.gprs[gpr as usize] = value;
    }

    fn ip(&self) -> u64 {
        self.ip
    }

    fn set_ip(&mut self, ip: u64) {
        self.ip = ip;
    }

    fn flags(&self) -> Flags {
        self.flags
    }

    fn set_flags(&mut self, flags: Flags) {
        self.flags = flags;
    }
}

impl Display for Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Context {{ ip: 0x{:x}, flags: {:?}, \n gprs: {:x?} \n}}",
            self.ip, self.flags, self.gprs
        )
    }
}
