//! Per-record tier-1 emission sequences
//!
//! Each arm lowers one decoded record to the abstract operator set,
//! mirroring the interpreter semantics for the same record: same field
//! reads, same alignment-free fast path (alignment is the generator's
//! concern only where the interpreter also checks), same pc updates at
//! block exits.

use super::{AluOp, Cond, DivKind, Field, HostCall, HostReg, MulKind, Size, TierOneEmitter,
            Unsupported};
use crate::instr::{Insn, Opcode};

use AluOp::*;
use HostReg::{T0, T1, T2};
use Size::{S16, S32, S8};

type Emit = Result<(), Unsupported>;

/// Lower one decoded record. System, atomic and float records have no
/// tier-1 lowering and stay on the interpreter, as do C.JR/C.JALR:
/// their targets carry no low-bit guarantee and the operator set has
/// no way to raise the misalignment fault the interpreter raises.
pub fn emit(insn: &Insn, e: &mut dyn TierOneEmitter) -> Emit {
    let rd = insn.rd;
    let imm = insn.imm;
    let pc = insn.pc;
    match insn.opcode {
        Opcode::Nop | Opcode::CNop | Opcode::Fence => {}

        Opcode::Lui | Opcode::CLi | Opcode::CLui => {
            e.ld_imm(T0, i64::from(imm));
            e.st(S32, T0, Field::X(rd));
        }
        Opcode::Auipc => {
            e.ld_imm(T0, i64::from(pc.wrapping_add(imm as u32)));
            e.st(S32, T0, Field::X(rd));
        }

        Opcode::Jal | Opcode::CJal | Opcode::CJ => {
            e.cond(rd != 0);
            e.ld_imm(T0, i64::from(pc.wrapping_add(insn.len.into())));
            e.st(S32, T0, Field::X(rd));
            e.end();
            e.ld_imm(T0, i64::from(pc.wrapping_add(imm as u32)));
            e.st(S32, T0, Field::Pc);
            e.jmp(pc, imm);
            e.exit();
        }
        Opcode::Jalr => {
            e.cond(rd != 0);
            e.ld_imm(T0, i64::from(pc.wrapping_add(insn.len.into())));
            e.st(S32, T0, Field::X(rd));
            e.end();
            e.ld(S32, T0, Field::X(insn.rs1));
            e.alu32_imm(Add, T0, imm);
            e.alu32_imm(And, T0, !1);
            e.st(S32, T0, Field::Pc);
            e.exit();
        }
        Opcode::Beq => branch(insn, e, Cond::Eq),
        Opcode::Bne => branch(insn, e, Cond::Ne),
        Opcode::Blt => branch(insn, e, Cond::Lt),
        Opcode::Bge => branch(insn, e, Cond::Ge),
        Opcode::Bltu => branch(insn, e, Cond::Ltu),
        Opcode::Bgeu => branch(insn, e, Cond::Geu),
        Opcode::CBeqz => branch_zero(insn, e, Cond::Eq),
        Opcode::CBnez => branch_zero(insn, e, Cond::Ne),

        Opcode::Lb => load(insn, e, |e| e.ld_sext(S8, T0, T0, 0)),
        Opcode::Lh => load(insn, e, |e| e.ld_sext(S16, T0, T0, 0)),
        Opcode::Lw | Opcode::CLw | Opcode::CLwsp => load(insn, e, |e| e.ld_mem(S32, T0, T0, 0)),
        Opcode::Lbu => load(insn, e, |e| e.ld_mem(S8, T0, T0, 0)),
        Opcode::Lhu => load(insn, e, |e| e.ld_mem(S16, T0, T0, 0)),
        Opcode::Sb => store(insn, e, S8),
        Opcode::Sh => store(insn, e, S16),
        Opcode::Sw | Opcode::CSw | Opcode::CSwsp => store(insn, e, S32),

        Opcode::Addi | Opcode::CAddi | Opcode::CAddi16sp | Opcode::CAddi4spn => {
            alu_imm(insn, e, Add)
        }
        Opcode::Xori => alu_imm(insn, e, Xor),
        Opcode::Ori => alu_imm(insn, e, Or),
        Opcode::Andi | Opcode::CAndi => alu_imm(insn, e, And),
        Opcode::Slti => set_less_imm(insn, e, Cond::Lt),
        Opcode::Sltiu => set_less_imm(insn, e, Cond::Ltu),
        Opcode::Slli | Opcode::CSlli => shift_imm(insn, e, Shl),
        Opcode::Srli | Opcode::CSrli => shift_imm(insn, e, Shr),
        Opcode::Srai | Opcode::CSrai => shift_imm(insn, e, Sar),

        Opcode::Add | Opcode::CAdd => alu_reg(insn, e, Add),
        Opcode::Sub | Opcode::CSub => alu_reg(insn, e, Sub),
        Opcode::Xor | Opcode::CXor => alu_reg(insn, e, Xor),
        Opcode::Or | Opcode::COr => alu_reg(insn, e, Or),
        Opcode::And | Opcode::CAnd => alu_reg(insn, e, And),
        Opcode::Sll => shift_reg(insn, e, Shl),
        Opcode::Srl => shift_reg(insn, e, Shr),
        Opcode::Sra => shift_reg(insn, e, Sar),
        Opcode::Slt => set_less_reg(insn, e, Cond::Lt),
        Opcode::Sltu => set_less_reg(insn, e, Cond::Ltu),
        Opcode::CMv => {
            e.ld(S32, T0, Field::X(insn.rs2));
            e.st(S32, T0, Field::X(rd));
        }

        Opcode::Mul => mul(insn, e, MulKind::Low),
        Opcode::Mulh => mul(insn, e, MulKind::HighSigned),
        Opcode::Mulhsu => mul(insn, e, MulKind::HighSignedUnsigned),
        Opcode::Mulhu => mul(insn, e, MulKind::HighUnsigned),
        Opcode::Div | Opcode::Divu => {
            let kind = div_kind(insn.opcode);
            e.ld(S32, T0, Field::X(insn.rs1));
            e.ld(S32, T1, Field::X(insn.rs2));
            e.div(kind, T1, T0);
            // Division by zero yields all-ones.
            e.cmp_imm(T1, 0);
            e.set_jmp_off();
            e.jcc(Cond::Ne);
            e.ld_imm(T0, -1);
            e.jmp_off();
            e.st(S32, T0, Field::X(rd));
        }
        Opcode::Rem | Opcode::Remu => {
            let kind = div_kind(insn.opcode);
            e.ld(S32, T0, Field::X(insn.rs1));
            e.ld(S32, T1, Field::X(insn.rs2));
            e.rem(kind, T1, T0);
            e.st(S32, T0, Field::X(rd));
        }

        Opcode::Ecall => {
            e.ld_imm(T0, i64::from(pc));
            e.st(S32, T0, Field::Pc);
            e.call(HostCall::Ecall);
            e.exit();
        }
        Opcode::Ebreak => {
            e.ld_imm(T0, i64::from(pc));
            e.st(S32, T0, Field::Pc);
            e.call(HostCall::Ebreak);
            e.exit();
        }
        Opcode::CEbreak => {
            e.ld_imm(T0, i64::from(pc));
            e.st(S32, T0, Field::Pc);
            e.st_imm(S32, Field::Compressed, 1);
            e.call(HostCall::Ebreak);
            e.exit();
        }

        _ => {
            return Err(Unsupported {
                opcode: insn.opcode,
            })
        }
    }
    Ok(())
}

fn div_kind(opcode: Opcode) -> DivKind {
    match opcode {
        Opcode::Div | Opcode::Rem => DivKind::Signed,
        _ => DivKind::Unsigned,
    }
}

/// Conditional branch: compare, then two exits, each gated on its
/// pre-linked edge so the generator can fall through into the linked
/// block instead of leaving the cache.
fn branch(insn: &Insn, e: &mut dyn TierOneEmitter, cond: Cond) {
    e.ld(S32, T0, Field::X(insn.rs1));
    e.ld(S32, T1, Field::X(insn.rs2));
    e.cmp(T1, T0);
    branch_tail(insn, e, cond);
}

fn branch_zero(insn: &Insn, e: &mut dyn TierOneEmitter, cond: Cond) {
    e.ld(S32, T0, Field::X(insn.rs1));
    e.cmp_imm(T0, 0);
    branch_tail(insn, e, cond);
}

fn branch_tail(insn: &Insn, e: &mut dyn TierOneEmitter, cond: Cond) {
    let len = i32::from(insn.len);
    e.set_jmp_off();
    e.jcc(cond);
    // Untaken path.
    e.cond(insn.branch_untaken.borrow().is_some());
    e.jmp(insn.pc, len);
    e.end();
    e.ld_imm(T0, i64::from(insn.next_pc()));
    e.st(S32, T0, Field::Pc);
    e.exit();
    // Taken path.
    e.jmp_off();
    e.cond(insn.branch_taken.borrow().is_some());
    e.jmp(insn.pc, insn.imm);
    e.end();
    e.ld_imm(T0, i64::from(insn.pc.wrapping_add(insn.imm as u32)));
    e.st(S32, T0, Field::Pc);
    e.exit();
}

/// Guest load: effective address, memory base, then the width-specific
/// access provided by the caller.
fn load(insn: &Insn, e: &mut dyn TierOneEmitter, access: impl FnOnce(&mut dyn TierOneEmitter)) {
    e.ld(S32, T0, Field::X(insn.rs1));
    e.alu32_imm(Add, T0, insn.imm);
    e.mem(T1);
    e.alu64(Add, T1, T0);
    access(&mut *e);
    e.st(S32, T0, Field::X(insn.rd));
}

fn store(insn: &Insn, e: &mut dyn TierOneEmitter, size: Size) {
    e.ld(S32, T0, Field::X(insn.rs1));
    e.alu32_imm(Add, T0, insn.imm);
    e.mem(T1);
    e.alu64(Add, T1, T0);
    e.ld(S32, T1, Field::X(insn.rs2));
    e.st_mem(size, T1, T0, 0);
}

fn alu_imm(insn: &Insn, e: &mut dyn TierOneEmitter, op: AluOp) {
    e.ld(S32, T0, Field::X(insn.rs1));
    e.alu32_imm(op, T0, insn.imm);
    e.st(S32, T0, Field::X(insn.rd));
}

fn shift_imm(insn: &Insn, e: &mut dyn TierOneEmitter, op: AluOp) {
    e.ld(S32, T0, Field::X(insn.rs1));
    e.alu32_imm(op, T0, i32::from(insn.shamt & 0x1f));
    e.st(S32, T0, Field::X(insn.rd));
}

fn alu_reg(insn: &Insn, e: &mut dyn TierOneEmitter, op: AluOp) {
    e.ld(S32, T0, Field::X(insn.rs1));
    e.ld(S32, T1, Field::X(insn.rs2));
    e.alu32(op, T1, T0);
    e.st(S32, T0, Field::X(insn.rd));
}

/// Register shifts mask the amount to the low five bits first.
fn shift_reg(insn: &Insn, e: &mut dyn TierOneEmitter, op: AluOp) {
    e.ld(S32, T0, Field::X(insn.rs1));
    e.ld(S32, T2, Field::X(insn.rs2));
    e.alu32_imm(And, T2, 0x1f);
    e.alu32(op, T2, T0);
    e.st(S32, T0, Field::X(insn.rd));
}

fn set_less_imm(insn: &Insn, e: &mut dyn TierOneEmitter, cond: Cond) {
    e.ld(S32, T0, Field::X(insn.rs1));
    e.cmp_imm(T0, insn.imm);
    set_less_tail(insn, e, cond);
}

fn set_less_reg(insn: &Insn, e: &mut dyn TierOneEmitter, cond: Cond) {
    e.ld(S32, T0, Field::X(insn.rs1));
    e.ld(S32, T1, Field::X(insn.rs2));
    e.cmp(T1, T0);
    set_less_tail(insn, e, cond);
}

fn set_less_tail(insn: &Insn, e: &mut dyn TierOneEmitter, cond: Cond) {
    e.st_imm(S32, Field::X(insn.rd), 1);
    e.set_jmp_off();
    e.jcc(cond);
    e.st_imm(S32, Field::X(insn.rd), 0);
    e.jmp_off();
}

fn mul(insn: &Insn, e: &mut dyn TierOneEmitter, kind: MulKind) {
    e.ld(S32, T0, Field::X(insn.rs1));
    e.ld(S32, T1, Field::X(insn.rs2));
    e.mul(kind, T1, T0);
    e.st(S32, T0, Field::X(insn.rd));
}
