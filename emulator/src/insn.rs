//! Decoded instruction descriptors as handed over by the decoder.

use crate::config::AddressWidth;
use crate::context::{Flags, Gpr, Register, RegisterContext};

/// x86 condition codes, in `tttn` encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    O,
    No,
    B,
    Ae,
    E,
    Ne,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
}

impl Condition {
    pub fn evaluate(self, flags: Flags) -> bool {
        let cf = flags.contains(Flags::CF);
        let zf = flags.contains(Flags::ZF);
        let sf = flags.contains(Flags::SF);
        let of = flags.contains(Flags::OF);
        let pf = flags.contains(Flags::PF);

        match self {
            Condition::O => of,
            Condition::No => !of,
            Condition::B => cf,
            Condition::Ae => !cf,
            Condition::E => zf,
            Condition::Ne => !zf,
            Condition::Be => cf || zf,
            Condition::A => !cf && !zf,
            Condition::S => sf,
            Condition::Ns => !sf,
            Condition::P => pf,
            Condition::Np => !pf,
            Condition::L => sf != of,
            Condition::Ge => sf == of,
            Condition::Le => zf || sf != of,
            Condition::G => !zf && sf == of,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mnemonic {
    Mov,
    Jcc(Condition),
    Cmovcc(Condition),
    Setcc(Condition),
    /// anything the emulator has no handler for
    Other(&'static str),
}

/// `[base + index * scale + disp]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOperand {
    pub base: Option<Gpr>,
    pub index: Option<Gpr>,
    pub scale: u8,
    pub disp: i64,
    /// displacement is relative to the next instruction
    pub rip_relative: bool,
    /// access width in bytes
    pub width: usize,
}

impl MemoryOperand {
    pub fn absolute(addr: u64, width: usize) -> Self {
        Self {
            base: None,
            index: None,
            scale: 1,
            disp: addr as i64,
            rip_relative: false,
            width,
        }
    }

    pub fn based(base: Gpr, disp: i64, width: usize) -> Self {
        Self {
            base: Some(base),
            ..Self::absolute(disp as u64, width)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Register(Register),
    Memory(MemoryOperand),
    /// already extended to `width` bytes by the decoder
    Immediate { value: u64, width: usize },
    /// segment, control or debug register
    Special(&'static str),
}

impl Operand {
    pub fn width(&self) -> Option<usize> {
        match self {
            Operand::Register(r) => Some(r.width()),
            Operand::Memory(m) => Some(m.width),
            Operand::Immediate { width, .. } => Some(*width),
            Operand::Special(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub mnemonic: Mnemonic,
    pub operands: Vec<Operand>,
    /// encoded length in bytes
    pub length: usize,
    /// decoded destination of a relative branch
    pub target: Option<u64>,
}

impl Instruction {
    pub fn new(mnemonic: Mnemonic, operands: Vec<Operand>, length: usize) -> Self {
        Self {
            mnemonic,
            operands,
            length,
            target: None,
        }
    }

    pub fn branch(cond: Condition, target: u64, length: usize) -> Self {
        Self {
            mnemonic: Mnemonic::Jcc(cond),
            operands: vec![],
            length,
            target: Some(target),
        }
    }

    /// Address of the instruction that follows this one.
    pub fn next_ip<C: RegisterContext + ?Sized>(&self, ctx: &C, width: AddressWidth) -> u64 {
        ctx.ip().wrapping_add(self.length as u64) & width.mask()
    }

    pub fn effective_address<C: RegisterContext + ?Sized>(
        &self,
        op: &MemoryOperand,
        ctx: &C,
        width: AddressWidth,
    ) -> u64 {
        let mut addr = op.disp as u64;
        if op.rip_relative {
            addr = addr.wrapping_add(self.next_ip(ctx, width));
        }
        if let Some(base) = op.base {
            addr = addr.wrapping_add(ctx.gpr(base));
        }
        if let Some(index) = op.index {
            addr = addr.wrapping_add(ctx.gpr(index).wrapping_mul(op.scale as u64));
        }
        addr & width.mask()
    }
}
