//! Decoded instruction records
//!
//! The decoder turns raw guest instruction words into [`Insn`] records:
//! an opcode tag plus pre-extracted fields, ready for both the
//! interpreter and the tier-1 emitter. Records are grouped into blocks
//! (see [`crate::block`]); control-transfer records additionally carry
//! successor edges and, for indirect jumps, a small branch history
//! table.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::block::Block;

pub mod decode;
pub mod encode;

/// Number of (PC, target) pairs each indirect-jump site remembers.
pub const HISTORY_SIZE: usize = 8;

/// Opcode tags for the decoded RV32-IMCAF + Zicsr/Zifencei instruction
/// set. Compressed instructions keep their own tags: they retire with a
/// different instruction size and lower to different tier-1 sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // RV32I
    Nop,
    Lui,
    Auipc,
    Jal,
    Jalr,
    Beq,
    Bne,
    Blt,
    Bge,
    Bltu,
    Bgeu,
    Lb,
    Lh,
    Lw,
    Lbu,
    Lhu,
    Sb,
    Sh,
    Sw,
    Addi,
    Slti,
    Sltiu,
    Xori,
    Ori,
    Andi,
    Slli,
    Srli,
    Srai,
    Add,
    Sub,
    Sll,
    Slt,
    Sltu,
    Xor,
    Srl,
    Sra,
    Or,
    And,
    Fence,
    FenceI,
    Ecall,
    Ebreak,
    Wfi,
    Mret,
    // Zicsr
    Csrrw,
    Csrrs,
    Csrrc,
    Csrrwi,
    Csrrsi,
    Csrrci,
    // M
    Mul,
    Mulh,
    Mulhsu,
    Mulhu,
    Div,
    Divu,
    Rem,
    Remu,
    // A (non-atomic placeholders)
    LrW,
    ScW,
    AmoswapW,
    AmoaddW,
    AmoxorW,
    AmoandW,
    AmoorW,
    AmominW,
    AmomaxW,
    AmominuW,
    AmomaxuW,
    // F
    Flw,
    Fsw,
    FmaddS,
    FmsubS,
    FnmsubS,
    FnmaddS,
    FaddS,
    FsubS,
    FmulS,
    FdivS,
    FsqrtS,
    FsgnjS,
    FsgnjnS,
    FsgnjxS,
    FminS,
    FmaxS,
    FcvtWS,
    FcvtWuS,
    FmvXW,
    FeqS,
    FltS,
    FleS,
    FclassS,
    FcvtSW,
    FcvtSWu,
    FmvWX,
    // C
    CAddi4spn,
    CLw,
    CSw,
    CNop,
    CAddi,
    CJal,
    CLi,
    CAddi16sp,
    CLui,
    CSrli,
    CSrai,
    CAndi,
    CSub,
    CXor,
    COr,
    CAnd,
    CJ,
    CBeqz,
    CBnez,
    CSlli,
    CLwsp,
    CJr,
    CMv,
    CEbreak,
    CJalr,
    CAdd,
    CSwsp,
}

impl Opcode {
    /// True for instructions that end a block: every control transfer
    /// plus the environment ops that hand control to the host.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Opcode::Jal
                | Opcode::Jalr
                | Opcode::Beq
                | Opcode::Bne
                | Opcode::Blt
                | Opcode::Bge
                | Opcode::Bltu
                | Opcode::Bgeu
                | Opcode::Ecall
                | Opcode::Ebreak
                | Opcode::Wfi
                | Opcode::Mret
                | Opcode::FenceI
                | Opcode::CJal
                | Opcode::CJ
                | Opcode::CJr
                | Opcode::CJalr
                | Opcode::CBeqz
                | Opcode::CBnez
                | Opcode::CEbreak
        )
    }

    /// True for the indirect jumps that own a branch history table.
    pub fn is_indirect_jump(&self) -> bool {
        matches!(self, Opcode::Jalr | Opcode::CJr | Opcode::CJalr)
    }
}

/// A stable handle to an instruction record inside a block owned by the
/// block map. The reference is weak: if the block map evicts the target
/// block, the upgrade fails and the holder nulls the edge before it is
/// ever dispatched through.
#[derive(Debug, Clone)]
pub struct InsnRef {
    pub block: Weak<Block>,
    pub index: usize,
}

impl InsnRef {
    pub fn head_of(block: &Rc<Block>) -> Self {
        Self {
            block: Rc::downgrade(block),
            index: 0,
        }
    }

    /// Resolve the handle, returning the owning block if it is still
    /// alive in the block map.
    pub fn upgrade(&self) -> Option<(Rc<Block>, usize)> {
        self.block.upgrade().map(|b| (b, self.index))
    }
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    pc: u32,
    target: InsnRef,
}

/// Per-site history for indirect jumps: a fixed array of
/// (PC, target record) pairs with a round-robin write index. Overwrite
/// is FIFO by slot; there is no recency tracking.
#[derive(Debug)]
pub struct BranchHistory {
    slots: RefCell<[Option<HistoryEntry>; HISTORY_SIZE]>,
    idx: Cell<usize>,
}

impl Default for BranchHistory {
    fn default() -> Self {
        Self {
            slots: RefCell::new(std::array::from_fn(|_| None)),
            idx: Cell::new(0),
        }
    }
}

impl BranchHistory {
    /// Linear-scan for a recorded target. Slots whose block has been
    /// evicted are cleared as they are encountered.
    pub fn find(&self, pc: u32) -> Option<(Rc<Block>, usize)> {
        let mut slots = self.slots.borrow_mut();
        for slot in slots.iter_mut() {
            let Some(entry) = slot else { continue };
            if entry.pc != pc {
                continue;
            }
            match entry.target.upgrade() {
                Some(hit) => return Some(hit),
                None => *slot = None,
            }
        }
        None
    }

    /// Record (pc, head of block) at the round-robin index.
    pub fn record(&self, pc: u32, block: &Rc<Block>) {
        let idx = self.idx.get();
        self.slots.borrow_mut()[idx] = Some(HistoryEntry {
            pc,
            target: InsnRef::head_of(block),
        });
        self.idx.set((idx + 1) % HISTORY_SIZE);
    }
}

/// One decoded instruction.
///
/// `imm` is already sign- or zero-extended as the encoding demands; for
/// LUI/AUIPC it holds the full shifted 32-bit value, and for the Zicsr
/// ops it holds the CSR number. `len` is the encoded size in bytes
/// (2 or 4).
#[derive(Debug)]
pub struct Insn {
    pub opcode: Opcode,
    /// The raw instruction word, kept for fault reporting.
    pub raw: u32,
    pub pc: u32,
    pub rd: u8,
    pub rs1: u8,
    pub rs2: u8,
    pub rs3: u8,
    pub imm: i32,
    pub shamt: u8,
    pub len: u8,
    /// Successor edge taken-direction; terminators only.
    pub branch_taken: RefCell<Option<InsnRef>>,
    /// Successor edge fall-through direction; terminators only.
    pub branch_untaken: RefCell<Option<InsnRef>>,
    /// Indirect-jump sites only.
    pub history: Option<Box<BranchHistory>>,
}

impl Insn {
    pub fn new(opcode: Opcode, pc: u32, len: u8) -> Self {
        let history = opcode
            .is_indirect_jump()
            .then(|| Box::new(BranchHistory::default()));
        Self {
            opcode,
            raw: 0,
            pc,
            rd: 0,
            rs1: 0,
            rs2: 0,
            rs3: 0,
            imm: 0,
            shamt: 0,
            len,
            branch_taken: RefCell::new(None),
            branch_untaken: RefCell::new(None),
            history,
        }
    }

    /// Address of the next sequential instruction.
    pub fn next_pc(&self) -> u32 {
        self.pc.wrapping_add(u32::from(self.len))
    }
}
