//! Write-deferred page cache over a traced process, and an emulator for a few
//! instruction shapes that runs against it.

pub mod config;
pub mod context;
pub mod emulate;
pub mod error;
pub mod insn;
pub mod memory;
pub mod page;
#[cfg(target_os = "linux")]
pub mod procmem;
pub mod split;
pub mod strings;
pub mod target;
mod tests;

pub use config::{AddressWidth, CacheConfig, VolatileRegion};
pub use context::{Context, Flags, Gpr, RegPart, Register, RegisterContext};
pub use emulate::{
    emulate, emulate_cmovcc, emulate_jcc, emulate_mov, emulate_setcc, EmulationResult,
};
pub use error::{MemoryError, TargetError};
pub use insn::{Condition, Instruction, MemoryOperand, Mnemonic, Operand};
pub use memory::{ByteMismatch, MemoryCache};
pub use page::{CachedPage, PageIndex, PAGE_ADDR_SIZE, PAGE_SIZE};
#[cfg(target_os = "linux")]
pub use procmem::ProcessTarget;
pub use target::{
    BoundCheck, BufferTarget, Protection, ProtectionRegion, SharedTarget, TargetMemory,
};
