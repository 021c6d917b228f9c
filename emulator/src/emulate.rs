//! Executes a handful of instruction shapes against the page cache instead of
//! single-stepping the real thread.

use crate::context::RegisterContext;
use crate::insn::{Instruction, Mnemonic, Operand};
use crate::memory::MemoryCache;
use log::{debug, trace};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulationResult {
    /// the mnemonic is outside of what the emulator handles
    NotEmulated,
    Ok,
    CannotReadMemory,
    CannotWriteMemory,
    /// known mnemonic, but this operand form has no handler
    NotSupported,
}

impl EmulationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmulationResult::NotEmulated => "not emulated",
            EmulationResult::Ok => "emulated ok",
            EmulationResult::CannotReadMemory => "cannot read memory",
            EmulationResult::CannotWriteMemory => "cannot write memory",
            EmulationResult::NotSupported => "not supported",
        }
    }
}

impl Display for EmulationResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn outcome(r: Result<(), EmulationResult>) -> EmulationResult {
    match r {
        Ok(()) => EmulationResult::Ok,
        Err(e) => e,
    }
}

fn read_operand<C: RegisterContext + ?Sized>(
    insn: &Instruction,
    op: &Operand,
    ctx: &C,
    mem: &mut MemoryCache,
) -> Result<u64, EmulationResult> {
    match op {
        Operand::Register(reg) => Ok(ctx.register(*reg)),
        Operand::Immediate { value, .. } => Ok(*value),
        Operand::Memory(m) => {
            let addr = insn.effective_address(m, ctx, mem.config().address_width);
            mem.read_value(addr, m.width).map_err(|e| {
                debug!("emulation read failed: {}", e);
                EmulationResult::CannotReadMemory
            })
        }
        Operand::Special(_) => Err(EmulationResult::NotSupported),
    }
}

fn write_operand<C: RegisterContext + ?Sized>(
    insn: &Instruction,
    op: &Operand,
    value: u64,
    ctx: &mut C,
    mem: &mut MemoryCache,
) -> Result<(), EmulationResult> {
    match op {
        Operand::Register(reg) => {
            ctx.set_register(*reg, value);
            Ok(())
        }
        Operand::Memory(m) => {
            let addr = insn.effective_address(m, ctx, mem.config().address_width);
            mem.write_value(addr, m.width, value).map_err(|e| {
                debug!("emulation write failed: {}", e);
                EmulationResult::CannotWriteMemory
            })
        }
        Operand::Immediate { .. } | Operand::Special(_) => Err(EmulationResult::NotSupported),
    }
}

/// Checks a `dst <- src` pair: writable destination, memory accesses of 1, 2,
/// 4 or 8 bytes, no memory to memory, matching widths (immediates are
/// truncated to the destination).
fn move_operands(insn: &Instruction) -> Result<(&Operand, &Operand), EmulationResult> {
    let (dst, src) = match insn.operands.as_slice() {
        [dst, src] => (dst, src),
        _ => return Err(EmulationResult::NotSupported),
    };

    let sized = |op: &Operand| match op {
        Operand::Memory(m) => matches!(m.width, 1 | 2 | 4 | 8),
        _ => true,
    };
    if !sized(dst) || !sized(src) {
        return Err(EmulationResult::NotSupported);
    }

    match (dst, src) {
        (Operand::Memory(_), Operand::Memory(_)) => Err(EmulationResult::NotSupported),
        (Operand::Register(_) | Operand::Memory(_), Operand::Immediate { .. }) => Ok((dst, src)),
        (
            Operand::Register(_) | Operand::Memory(_),
            Operand::Register(_) | Operand::Memory(_),
        ) if dst.width() == src.width() => Ok((dst, src)),
        _ => Err(EmulationResult::NotSupported),
    }
}

fn do_move<C: RegisterContext + ?Sized>(
    insn: &Instruction,
    ctx: &mut C,
    mem: &mut MemoryCache,
) -> Result<(), EmulationResult> {
    let (dst, src) = move_operands(insn)?;
    let value = read_operand(insn, src, ctx, mem)?;
    let width = dst.width().unwrap_or(8);
    let value = if width >= 8 {
        value
    } else {
        value & ((1u64 << (width * 8)) - 1)
    };
    write_operand(insn, dst, value, ctx, mem)
}

/// `op1 <- op2`. Does not advance the instruction pointer.
pub fn emulate_mov<C: RegisterContext + ?Sized>(
    insn: &Instruction,
    ctx: &mut C,
    mem: &mut MemoryCache,
) -> EmulationResult {
    outcome(do_move(insn, ctx, mem))
}

/// Sets the instruction pointer to the decoded branch `target` if `cond` holds.
///
/// A branch that is not taken leaves the context untouched, moving past the
/// instruction is up to the caller.
pub fn emulate_jcc<C: RegisterContext + ?Sized>(
    target: u64,
    cond: bool,
    ctx: &mut C,
) -> EmulationResult {
    if cond {
        ctx.set_ip(target);
    }
    EmulationResult::Ok
}

/// A move that only happens if `cond` holds. The destination must be a register.
pub fn emulate_cmovcc<C: RegisterContext + ?Sized>(
    insn: &Instruction,
    cond: bool,
    ctx: &mut C,
    mem: &mut MemoryCache,
) -> EmulationResult {
    match insn.operands.first() {
        Some(Operand::Register(reg)) if reg.width() > 1 => {}
        _ => return EmulationResult::NotSupported,
    }
    if let Err(e) = move_operands(insn) {
        return e;
    }
    if !cond {
        return EmulationResult::Ok;
    }
    emulate_mov(insn, ctx, mem)
}

/// Stores 1 or 0 into a byte register or a byte of memory.
pub fn emulate_setcc<C: RegisterContext + ?Sized>(
    insn: &Instruction,
    cond: bool,
    ctx: &mut C,
    mem: &mut MemoryCache,
) -> EmulationResult {
    let dst = match insn.operands.as_slice() {
        [dst @ (Operand::Register(_) | Operand::Memory(_))] if dst.width() == Some(1) => dst,
        _ => return EmulationResult::NotSupported,
    };
    outcome(write_operand(insn, dst, cond as u64, ctx, mem))
}

/// Emulates one decoded instruction.
///
/// Condition codes are evaluated from the context flags. On success the
/// instruction pointer ends up on the next instruction, or on the branch
/// target of a taken branch. Any other result leaves the instruction pointer
/// alone so the caller can run the instruction for real.
pub fn emulate<C: RegisterContext + ?Sized>(
    insn: &Instruction,
    ctx: &mut C,
    mem: &mut MemoryCache,
) -> EmulationResult {
    let next_ip = insn.next_ip(ctx, mem.config().address_width);
    let flags = ctx.flags();

    let (result, branched) = match &insn.mnemonic {
        Mnemonic::Mov => (emulate_mov(insn, ctx, mem), false),
        Mnemonic::Jcc(cond) => match insn.target {
            Some(target) => {
                let taken = cond.evaluate(flags);
                (emulate_jcc(target, taken, ctx), taken)
            }
            None => (EmulationResult::NotSupported, false),
        },
        Mnemonic::Cmovcc(cond) => (emulate_cmovcc(insn, cond.evaluate(flags), ctx, mem), false),
        Mnemonic::Setcc(cond) => (emulate_setcc(insn, cond.evaluate(flags), ctx, mem), false),
        Mnemonic::Other(name) => {
            trace!("{} is not emulated", name);
            (EmulationResult::NotEmulated, false)
        }
    };

    if result == EmulationResult::Ok && !branched {
        ctx.set_ip(next_ip);
    }
    debug!("emulate {:?}: {}", insn.mnemonic, result);
    result
}
