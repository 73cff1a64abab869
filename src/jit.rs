//! Tier-1 code-generation contract
//!
//! The same decoded records the interpreter dispatches can be lowered
//! to a small abstract instruction set that a host code generator
//! consumes: immediates and architectural-field accesses, 32/64-bit
//! ALU operations, compare/conditional-jump pairs with one-deep
//! back-patching, guest memory accesses relative to a materialized
//! memory base, host calls for the environment hooks, and block exits.
//!
//! [`emit`] produces the operator sequence for one record through a
//! [`TierOneEmitter`]. The generator behind the trait is a black box;
//! its only obligation is that the machine code it produces is
//! observationally equivalent to the interpreter for the same record.

use thiserror::Error;

use crate::instr::Opcode;

mod emit;

pub use emit::emit;

/// Scratch registers of the abstract host machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostReg {
    T0,
    T1,
    T2,
}

/// Operand sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    S8,
    S16,
    S32,
    S64,
}

/// Architectural fields addressable by the generated code. Offsets are
/// stable because the machine state is `repr(C)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// General register x0..x31.
    X(u8),
    Pc,
    Compressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    /// Logical shift left.
    Shl,
    /// Logical shift right.
    Shr,
    /// Arithmetic shift right.
    Sar,
}

/// Branch conditions for [`TierOneEmitter::jcc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Ltu,
    Geu,
}

/// Which multiply result to keep. The high variants include the
/// per-operand sign extension of the MULH family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulKind {
    Low,
    HighSigned,
    HighSignedUnsigned,
    HighUnsigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivKind {
    Signed,
    Unsigned,
}

/// Host runtime handlers reachable from generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCall {
    Ecall,
    Ebreak,
}

/// Records with no tier-1 lowering: system, atomic and float
/// operations, and the compressed indirect jumps, whose misalignment
/// fault the operator set cannot express.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("no tier-1 lowering for {opcode:?}")]
pub struct Unsupported {
    pub opcode: Opcode,
}

/// The operator set a tier-1 code generator implements.
///
/// `set_jmp_off`/`jmp_off` are a one-deep forward-branch back-patch:
/// `jcc` emitted after `set_jmp_off` targets the position recorded by
/// the following `jmp_off`. `cond(p)`/`end` bracket operators that are
/// only emitted when the decode-time predicate `p` held (the generator
/// may simply skip the bracketed region when `p` is false).
pub trait TierOneEmitter {
    /// Materialize an immediate.
    fn ld_imm(&mut self, dst: HostReg, imm: i64);
    /// Load an architectural field.
    fn ld(&mut self, size: Size, dst: HostReg, field: Field);
    /// Store to an architectural field.
    fn st(&mut self, size: Size, src: HostReg, field: Field);
    /// Store an immediate to an architectural field.
    fn st_imm(&mut self, size: Size, field: Field, imm: i32);

    /// Zero-extending load from guest memory at base + offset.
    fn ld_mem(&mut self, size: Size, dst: HostReg, base: HostReg, offset: i32);
    /// Sign-extending load from guest memory.
    fn ld_sext(&mut self, size: Size, dst: HostReg, base: HostReg, offset: i32);
    /// Store to guest memory.
    fn st_mem(&mut self, size: Size, src: HostReg, base: HostReg, offset: i32);
    /// Materialize the guest memory base into a host register.
    fn mem(&mut self, dst: HostReg);

    fn alu32(&mut self, op: AluOp, src: HostReg, dst: HostReg);
    fn alu32_imm(&mut self, op: AluOp, dst: HostReg, imm: i32);
    fn alu64(&mut self, op: AluOp, src: HostReg, dst: HostReg);
    fn alu64_imm(&mut self, op: AluOp, dst: HostReg, imm: i64);

    fn cmp(&mut self, lhs: HostReg, rhs: HostReg);
    fn cmp_imm(&mut self, lhs: HostReg, imm: i32);
    fn set_jmp_off(&mut self);
    fn jcc(&mut self, cond: Cond);
    fn jmp_off(&mut self);
    /// Unconditional transfer to pc + imm within the code cache.
    fn jmp(&mut self, pc: u32, imm: i32);

    fn mul(&mut self, kind: MulKind, src: HostReg, dst: HostReg);
    /// Division implementing the ISA edge cases left unhandled by the
    /// emitted fixups (signed overflow).
    fn div(&mut self, kind: DivKind, src: HostReg, dst: HostReg);
    fn rem(&mut self, kind: DivKind, src: HostReg, dst: HostReg);

    /// Begin a region gated on a decode-time predicate.
    fn cond(&mut self, pred: bool);
    /// End the innermost gated region.
    fn end(&mut self);

    /// Call a host runtime handler.
    fn call(&mut self, handler: HostCall);
    /// Return from the compiled block.
    fn exit(&mut self);
}
