//! Machine state and the outer run loop
//!
//! [`MachineState`] is the architectural state a guest program can
//! observe: the integer and float register files, program counter,
//! the CSRs the core implements, and the latches the host inspects
//! between runs. [`Machine`] couples that state with the host IO
//! callbacks and the decoded-block caches, and drives execution one
//! block at a time.
//!
//! The single hart executes strictly sequentially. Between block exits
//! the state is always consistent (pc and cycle both written back), so
//! the host may inspect it, service an environment call, or decline to
//! re-enter.

use std::rc::Rc;

use log::debug;
use thiserror::Error;

use crate::block::{link_block, translate, Block, BlockCache, BlockMap};
use crate::exec::{self, BlockExit};
use crate::instr::decode::IllegalInstruction;
use crate::softfloat::FloatOracle;

/// mstatus.MPIE mask, written by MRET.
pub const MSTATUS_MPIE: u32 = 1 << 7;

/// Zero register, stack pointer and return address indices.
pub const REG_ZERO: u8 = 0;
pub const REG_RA: u8 = 1;
pub const REG_SP: u8 = 2;

/// Access class of a misaligned address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MisalignKind {
    Insn,
    Load,
    Store,
}

impl std::fmt::Display for MisalignKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MisalignKind::Insn => write!(f, "instruction address"),
            MisalignKind::Load => write!(f, "load address"),
            MisalignKind::Store => write!(f, "store address"),
        }
    }
}

/// Latched description of the most recent misalignment fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MisalignInfo {
    pub pc: u32,
    pub kind: MisalignKind,
    pub target: u32,
}

/// Faults surfaced to the host. Nothing is recovered inside the
/// interpreter; pc and cycle are written back before the error
/// propagates out of [`Machine::run`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    #[error(transparent)]
    IllegalInstruction(#[from] IllegalInstruction),
    #[error("misaligned {} {target:#010x} at pc {pc:#010x}", .kind)]
    Misaligned {
        pc: u32,
        kind: MisalignKind,
        target: u32,
    },
}

/// Why [`Machine::run`] stopped without a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The cycle budget was consumed; call `run` again to continue.
    CycleLimit,
    /// Execution reached WFI. The core does not implement interrupts,
    /// so there is nothing to wait for.
    Wfi,
    /// The host halted the machine from an environment call.
    Halted,
}

/// Architectural state with stable field offsets, shared between the
/// interpreter, the host and a tier-1 code generator.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct MachineState {
    pub x: [u32; 32],
    pub f: [u32; 32],
    pub pc: u32,
    /// Instructions retired since reset; advanced on every block exit.
    pub cycle: u64,
    /// The cycle CSR view, kept in lockstep with `cycle`.
    pub csr_cycle: u64,
    pub csr_mstatus: u32,
    pub csr_mepc: u32,
    pub csr_fcsr: u32,
    /// True when the last retired ECALL/EBREAK was a 16-bit encoding;
    /// the host uses it to step the pc past the trapping instruction.
    pub compressed: bool,
    /// Set by the host (typically from `on_ecall`) to stop the run loop.
    pub halt: bool,
    /// Latched on misalignment so the host can inspect the faulting
    /// class and target.
    pub misalign: Option<MisalignInfo>,
}

impl Default for MachineState {
    fn default() -> Self {
        Self {
            x: [0; 32],
            f: [0; 32],
            pc: 0,
            cycle: 0,
            csr_cycle: 0,
            csr_mstatus: 0,
            csr_mepc: 0,
            csr_fcsr: 0,
            compressed: false,
            halt: false,
            misalign: None,
        }
    }
}

// CSR numbers the core exposes.
const CSR_FFLAGS: u32 = 0x001;
const CSR_FRM: u32 = 0x002;
const CSR_FCSR: u32 = 0x003;
const CSR_MSTATUS: u32 = 0x300;
const CSR_MEPC: u32 = 0x341;
const CSR_CYCLE: u32 = 0xc00;
const CSR_CYCLEH: u32 = 0xc80;

impl MachineState {
    /// Read register xn. x0 always reads zero.
    #[inline]
    pub fn x(&self, n: u8) -> u32 {
        self.x[usize::from(n)]
    }

    /// Write register xn. Writes to x0 are dropped, which keeps the
    /// zero-register invariant without a reset on the read path.
    #[inline]
    pub fn set_x(&mut self, n: u8, value: u32) {
        if n != REG_ZERO {
            self.x[usize::from(n)] = value;
        }
    }

    #[inline]
    pub fn freg(&self, n: u8) -> u32 {
        self.f[usize::from(n)]
    }

    #[inline]
    pub fn set_freg(&mut self, n: u8, bits: u32) {
        self.f[usize::from(n)] = bits;
    }

    /// Read a CSR; `None` means the number is not implemented and the
    /// instruction is illegal.
    pub fn csr_read(&self, csr: u32) -> Option<u32> {
        let value = match csr {
            CSR_FFLAGS => self.csr_fcsr & 0x1f,
            CSR_FRM => (self.csr_fcsr >> 5) & 0x7,
            CSR_FCSR => self.csr_fcsr & 0xff,
            CSR_MSTATUS => self.csr_mstatus,
            CSR_MEPC => self.csr_mepc,
            CSR_CYCLE => self.csr_cycle as u32,
            CSR_CYCLEH => (self.csr_cycle >> 32) as u32,
            _ => return None,
        };
        Some(value)
    }

    /// Write a CSR; `None` means unimplemented or read-only.
    pub fn csr_write(&mut self, csr: u32, value: u32) -> Option<()> {
        match csr {
            CSR_FFLAGS => self.csr_fcsr = (self.csr_fcsr & !0x1f) | (value & 0x1f),
            CSR_FRM => self.csr_fcsr = (self.csr_fcsr & !0xe0) | ((value & 0x7) << 5),
            CSR_FCSR => self.csr_fcsr = value & 0xff,
            CSR_MSTATUS => self.csr_mstatus = value,
            CSR_MEPC => self.csr_mepc = value,
            // cycle/cycleh are read-only counters
            _ => return None,
        }
        Some(())
    }
}

/// Host-provided IO callback table.
///
/// Memory accesses arrive pre-checked for alignment: the core never
/// calls a halfword or word accessor with a misaligned address. The
/// environment-call hooks receive the machine state with pc and cycle
/// already persisted; `on_ecall` is expected to advance the pc past the
/// trapping instruction (2 bytes when `state.compressed`, else 4).
pub trait SystemIo {
    fn read_b(&mut self, addr: u32) -> u8;
    fn read_s(&mut self, addr: u32) -> u16;
    fn read_w(&mut self, addr: u32) -> u32;
    fn write_b(&mut self, addr: u32, value: u8);
    fn write_s(&mut self, addr: u32, value: u16);
    fn write_w(&mut self, addr: u32, value: u32);

    /// Instruction fetch; defaults to a word read.
    fn fetch(&mut self, addr: u32) -> u32 {
        self.read_w(addr)
    }

    fn on_ecall(&mut self, state: &mut MachineState);
    fn on_ebreak(&mut self, state: &mut MachineState);

    /// Base of a contiguous host mapping of guest memory, if one
    /// exists. A code generator uses it for fast-path addressing; the
    /// interpreter never does.
    fn mem_base(&mut self) -> Option<usize> {
        None
    }
}

/// Tunables for block formation and the block caches.
#[derive(Debug, Clone, Copy)]
pub struct MachineConfig {
    /// Maximum decoded instructions per block.
    pub max_block_len: usize,
    /// Blocks held by the persistent block map before LRU eviction.
    pub block_map_capacity: usize,
    /// Entries in the hot-index block cache.
    pub block_cache_capacity: usize,
    /// Dispatch count at which the cache reports a block hot.
    pub hot_threshold: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            max_block_len: 64,
            block_map_capacity: 4096,
            block_cache_capacity: 256,
            hot_threshold: 32,
        }
    }
}

/// A single RV32-IMC hart bound to its host IO.
pub struct Machine<IO> {
    pub state: MachineState,
    pub io: IO,
    pub(crate) blocks: BlockMap,
    pub(crate) cache: BlockCache,
    pub(crate) float: Option<Box<dyn FloatOracle>>,
    config: MachineConfig,
}

impl<IO: SystemIo> Machine<IO> {
    pub fn new(io: IO) -> Self {
        Self::with_config(io, MachineConfig::default())
    }

    pub fn with_config(io: IO, config: MachineConfig) -> Self {
        Self {
            state: MachineState::default(),
            io,
            blocks: BlockMap::new(config.block_map_capacity),
            cache: BlockCache::new(config.block_cache_capacity, config.hot_threshold),
            float: None,
            config,
        }
    }

    /// Install the soft-float implementation backing the F extension.
    pub fn set_float_oracle(&mut self, oracle: Box<dyn FloatOracle>) {
        self.float = Some(oracle);
    }

    /// Run until `cycle_limit` instructions have retired, the machine
    /// halts, or a fault is raised.
    ///
    /// On a fault, pc and cycle are already written back and a
    /// misalignment has been latched in [`MachineState::misalign`];
    /// the host decides what happens next.
    pub fn run(&mut self, cycle_limit: u64) -> Result<StopReason, Trap> {
        while self.state.cycle < cycle_limit {
            if self.state.halt {
                return Ok(StopReason::Halted);
            }
            let block = self.find_or_translate()?;
            let exit = exec::dispatch(self, &block, cycle_limit).map_err(|trap| {
                if let Trap::Misaligned { pc, kind, target } = trap {
                    self.state.misalign = Some(MisalignInfo { pc, kind, target });
                }
                trap
            })?;
            match exit {
                BlockExit::Continue => {}
                BlockExit::Halt => return Ok(StopReason::Wfi),
            }
        }
        Ok(StopReason::CycleLimit)
    }

    /// Probe the block cache, then the block map, without decoding.
    /// Used by terminators to resolve successor edges.
    pub(crate) fn lookup_block(&mut self, pc: u32) -> Option<Rc<Block>> {
        if let Some(block) = self.cache.get(pc) {
            return Some(block);
        }
        let block = self.blocks.find(pc)?;
        self.cache.insert(pc, block.clone());
        Some(block)
    }

    /// Find the block entered at the current pc, decoding and linking a
    /// fresh one on a cold miss.
    fn find_or_translate(&mut self) -> Result<Rc<Block>, Trap> {
        let pc = self.state.pc;
        if let Some(block) = self.lookup_block(pc) {
            return Ok(block);
        }
        let block = translate(&mut self.io, pc, self.config.max_block_len)?;
        link_block(&block, &self.blocks);
        debug!(
            "translated block at {pc:#010x}: {} instructions",
            block.insns.len()
        );
        let block = self.blocks.insert(block);
        self.cache.insert(pc, block.clone());
        Ok(block)
    }

    /// Hotness signal for tier-1 promotion: true once the block entered
    /// at `pc` has been fetched from the cache often enough.
    pub fn block_is_hot(&self, pc: u32) -> bool {
        self.cache.hot(pc)
    }

    /// Number of decoded blocks currently owned by the block map.
    pub fn decoded_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Drop every decoded block. FENCE.I lands here: stores may have
    /// modified instruction memory, so cached decodes are stale.
    pub(crate) fn flush_blocks(&mut self) {
        debug!("flushing block map and cache");
        self.blocks.clear();
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_x0_reads_zero_after_write() {
        let mut s = MachineState::default();
        s.set_x(0, 0xdead_beef);
        assert_eq!(s.x(0), 0);
        s.set_x(5, 0xdead_beef);
        assert_eq!(s.x(5), 0xdead_beef);
    }

    #[test]
    fn check_fcsr_subfield_views() {
        let mut s = MachineState::default();
        s.csr_write(0x003, 0xff).unwrap();
        assert_eq!(s.csr_read(0x001), Some(0x1f));
        assert_eq!(s.csr_read(0x002), Some(0x7));
        s.csr_write(0x002, 0).unwrap();
        assert_eq!(s.csr_read(0x003), Some(0x1f));
    }

    #[test]
    fn check_cycle_csr_is_read_only() {
        let mut s = MachineState::default();
        assert!(s.csr_write(0xc00, 1).is_none());
        assert!(s.csr_write(0xc80, 1).is_none());
        assert!(s.csr_read(0xc00).is_some());
    }

    #[test]
    fn check_unknown_csr_number() {
        let s = MachineState::default();
        assert_eq!(s.csr_read(0x345), None);
    }
}
