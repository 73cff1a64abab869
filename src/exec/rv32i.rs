//! RV32I semantics
//!
//! The compressed instructions that expand to these operations are
//! routed here by the dispatcher with their fields already normalized
//! by the decoder (rd = rs1 for the read-modify-write forms, rs1 = sp
//! for the stack-relative forms).

use super::{misaligned_insn, resolve_edge, resolve_indirect, Step};
use crate::instr::{Insn, Opcode};
use crate::machine::{Machine, MachineState, MisalignKind, SystemIo, Trap};
use crate::utils::sign_extend;

type Exec = Result<Step, Trap>;

pub(super) fn addi(s: &mut MachineState, insn: &Insn) -> Exec {
    let value = s.x(insn.rs1).wrapping_add(insn.imm as u32);
    s.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn slti(s: &mut MachineState, insn: &Insn) -> Exec {
    let value = ((s.x(insn.rs1) as i32) < insn.imm) as u32;
    s.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn sltiu(s: &mut MachineState, insn: &Insn) -> Exec {
    let value = (s.x(insn.rs1) < insn.imm as u32) as u32;
    s.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn xori(s: &mut MachineState, insn: &Insn) -> Exec {
    let value = s.x(insn.rs1) ^ insn.imm as u32;
    s.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn ori(s: &mut MachineState, insn: &Insn) -> Exec {
    let value = s.x(insn.rs1) | insn.imm as u32;
    s.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn andi(s: &mut MachineState, insn: &Insn) -> Exec {
    let value = s.x(insn.rs1) & insn.imm as u32;
    s.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn slli(s: &mut MachineState, insn: &Insn) -> Exec {
    let value = s.x(insn.rs1) << (insn.shamt & 0x1f);
    s.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn srli(s: &mut MachineState, insn: &Insn) -> Exec {
    let value = s.x(insn.rs1) >> (insn.shamt & 0x1f);
    s.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn srai(s: &mut MachineState, insn: &Insn) -> Exec {
    let value = (s.x(insn.rs1) as i32) >> (insn.shamt & 0x1f);
    s.set_x(insn.rd, value as u32);
    Ok(Step::Next)
}

pub(super) fn add(s: &mut MachineState, insn: &Insn) -> Exec {
    let value = s.x(insn.rs1).wrapping_add(s.x(insn.rs2));
    s.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn sub(s: &mut MachineState, insn: &Insn) -> Exec {
    let value = s.x(insn.rs1).wrapping_sub(s.x(insn.rs2));
    s.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn sll(s: &mut MachineState, insn: &Insn) -> Exec {
    let value = s.x(insn.rs1) << (s.x(insn.rs2) & 0x1f);
    s.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn slt(s: &mut MachineState, insn: &Insn) -> Exec {
    let value = ((s.x(insn.rs1) as i32) < s.x(insn.rs2) as i32) as u32;
    s.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn sltu(s: &mut MachineState, insn: &Insn) -> Exec {
    let value = (s.x(insn.rs1) < s.x(insn.rs2)) as u32;
    s.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn xor(s: &mut MachineState, insn: &Insn) -> Exec {
    let value = s.x(insn.rs1) ^ s.x(insn.rs2);
    s.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn srl(s: &mut MachineState, insn: &Insn) -> Exec {
    let value = s.x(insn.rs1) >> (s.x(insn.rs2) & 0x1f);
    s.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn sra(s: &mut MachineState, insn: &Insn) -> Exec {
    let value = (s.x(insn.rs1) as i32) >> (s.x(insn.rs2) & 0x1f);
    s.set_x(insn.rd, value as u32);
    Ok(Step::Next)
}

pub(super) fn or(s: &mut MachineState, insn: &Insn) -> Exec {
    let value = s.x(insn.rs1) | s.x(insn.rs2);
    s.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn and(s: &mut MachineState, insn: &Insn) -> Exec {
    let value = s.x(insn.rs1) & s.x(insn.rs2);
    s.set_x(insn.rd, value);
    Ok(Step::Next)
}

fn effective_address(s: &MachineState, insn: &Insn) -> u32 {
    s.x(insn.rs1).wrapping_add(insn.imm as u32)
}

/// Alignment gate for loads and stores. The memory callback must not
/// be invoked for a misaligned access, so this runs first.
fn check_aligned(insn: &Insn, addr: u32, width: u32, kind: MisalignKind) -> Result<(), Trap> {
    if addr & (width - 1) != 0 {
        Err(Trap::Misaligned {
            pc: insn.pc,
            kind,
            target: addr,
        })
    } else {
        Ok(())
    }
}

pub(super) fn lb<IO: SystemIo>(m: &mut Machine<IO>, insn: &Insn) -> Exec {
    let addr = effective_address(&m.state, insn);
    let value = sign_extend(m.io.read_b(addr).into(), 7);
    m.state.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn lh<IO: SystemIo>(m: &mut Machine<IO>, insn: &Insn) -> Exec {
    let addr = effective_address(&m.state, insn);
    check_aligned(insn, addr, 2, MisalignKind::Load)?;
    let value = sign_extend(m.io.read_s(addr).into(), 15);
    m.state.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn lw<IO: SystemIo>(m: &mut Machine<IO>, insn: &Insn) -> Exec {
    let addr = effective_address(&m.state, insn);
    check_aligned(insn, addr, 4, MisalignKind::Load)?;
    let value = m.io.read_w(addr);
    m.state.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn lbu<IO: SystemIo>(m: &mut Machine<IO>, insn: &Insn) -> Exec {
    let addr = effective_address(&m.state, insn);
    let value = m.io.read_b(addr).into();
    m.state.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn lhu<IO: SystemIo>(m: &mut Machine<IO>, insn: &Insn) -> Exec {
    let addr = effective_address(&m.state, insn);
    check_aligned(insn, addr, 2, MisalignKind::Load)?;
    let value = m.io.read_s(addr).into();
    m.state.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn sb<IO: SystemIo>(m: &mut Machine<IO>, insn: &Insn) -> Exec {
    let addr = effective_address(&m.state, insn);
    m.io.write_b(addr, m.state.x(insn.rs2) as u8);
    Ok(Step::Next)
}

pub(super) fn sh<IO: SystemIo>(m: &mut Machine<IO>, insn: &Insn) -> Exec {
    let addr = effective_address(&m.state, insn);
    check_aligned(insn, addr, 2, MisalignKind::Store)?;
    m.io.write_s(addr, m.state.x(insn.rs2) as u16);
    Ok(Step::Next)
}

pub(super) fn sw<IO: SystemIo>(m: &mut Machine<IO>, insn: &Insn) -> Exec {
    let addr = effective_address(&m.state, insn);
    check_aligned(insn, addr, 4, MisalignKind::Store)?;
    m.io.write_w(addr, m.state.x(insn.rs2));
    Ok(Step::Next)
}

/// JAL, C.JAL and C.J: transfer to pc + imm, linking. A misaligned
/// target faults at the jump itself, before the link register or the
/// pc is touched.
pub(super) fn jal<IO: SystemIo>(m: &mut Machine<IO>, insn: &Insn, pc: &mut u32) -> Exec {
    let link = pc.wrapping_add(insn.len.into());
    let target = pc.wrapping_add(insn.imm as u32);
    if target & 1 != 0 {
        return Err(misaligned_insn(insn, target));
    }
    m.state.set_x(insn.rd, link);
    *pc = target;
    Ok(resolve_edge(m, &insn.branch_taken, target))
}

/// JALR: the target drops its least-significant bit, so it can never
/// be misaligned while C is implemented. The base register is read
/// before the link is written (rd may alias rs1).
pub(super) fn jalr<IO: SystemIo>(m: &mut Machine<IO>, insn: &Insn, pc: &mut u32) -> Exec {
    let target = m.state.x(insn.rs1).wrapping_add(insn.imm as u32) & !1;
    let link = pc.wrapping_add(insn.len.into());
    m.state.set_x(insn.rd, link);
    *pc = target;
    Ok(resolve_indirect(m, insn, target))
}

/// C.JR and C.JALR: indirect through rs1 with no immediate and no bit
/// clearing, so an odd target faults here, with nothing committed.
pub(super) fn cjr<IO: SystemIo>(m: &mut Machine<IO>, insn: &Insn, pc: &mut u32) -> Exec {
    let target = m.state.x(insn.rs1);
    if target & 1 != 0 {
        return Err(misaligned_insn(insn, target));
    }
    if insn.opcode == Opcode::CJalr {
        let link = pc.wrapping_add(2);
        m.state.set_x(insn.rd, link);
    }
    *pc = target;
    Ok(resolve_indirect(m, insn, target))
}

/// Shared tail of every conditional branch. The predicate was already
/// evaluated by the dispatcher.
pub(super) fn branch<IO: SystemIo>(
    m: &mut Machine<IO>,
    insn: &Insn,
    pc: &mut u32,
    taken: bool,
) -> Exec {
    if !taken {
        let target = insn.next_pc();
        *pc = target;
        return Ok(resolve_edge(m, &insn.branch_untaken, target));
    }
    let target = pc.wrapping_add(insn.imm as u32);
    if target & 1 != 0 {
        return Err(misaligned_insn(insn, target));
    }
    *pc = target;
    Ok(resolve_edge(m, &insn.branch_taken, target))
}
