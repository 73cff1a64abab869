//! M extension semantics
//!
//! The MULH family widens to 64 bits with per-operand signedness and
//! keeps the high word. Division follows the ISA's fully defined edge
//! cases: no traps, division by zero and signed overflow produce the
//! table in section 7.2 of the unprivileged spec.

use super::Step;
use crate::instr::Insn;
use crate::machine::{MachineState, Trap};

type Exec = Result<Step, Trap>;

pub(super) fn mul(s: &mut MachineState, insn: &Insn) -> Exec {
    let value = (s.x(insn.rs1) as i32).wrapping_mul(s.x(insn.rs2) as i32);
    s.set_x(insn.rd, value as u32);
    Ok(Step::Next)
}

pub(super) fn mulh(s: &mut MachineState, insn: &Insn) -> Exec {
    let a = i64::from(s.x(insn.rs1) as i32);
    let b = i64::from(s.x(insn.rs2) as i32);
    s.set_x(insn.rd, ((a * b) >> 32) as u32);
    Ok(Step::Next)
}

pub(super) fn mulhsu(s: &mut MachineState, insn: &Insn) -> Exec {
    let a = i64::from(s.x(insn.rs1) as i32);
    let b = i64::from(s.x(insn.rs2));
    s.set_x(insn.rd, ((a * b) >> 32) as u32);
    Ok(Step::Next)
}

pub(super) fn mulhu(s: &mut MachineState, insn: &Insn) -> Exec {
    let a = u64::from(s.x(insn.rs1));
    let b = u64::from(s.x(insn.rs2));
    s.set_x(insn.rd, ((a * b) >> 32) as u32);
    Ok(Step::Next)
}

pub(super) fn div(s: &mut MachineState, insn: &Insn) -> Exec {
    let dividend = s.x(insn.rs1) as i32;
    let divisor = s.x(insn.rs2) as i32;
    let value = if divisor == 0 {
        !0u32
    } else if dividend == i32::MIN && divisor == -1 {
        dividend as u32
    } else {
        (dividend / divisor) as u32
    };
    s.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn divu(s: &mut MachineState, insn: &Insn) -> Exec {
    let dividend = s.x(insn.rs1);
    let divisor = s.x(insn.rs2);
    let value = if divisor == 0 { !0 } else { dividend / divisor };
    s.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn rem(s: &mut MachineState, insn: &Insn) -> Exec {
    let dividend = s.x(insn.rs1) as i32;
    let divisor = s.x(insn.rs2) as i32;
    let value = if divisor == 0 {
        dividend as u32
    } else if dividend == i32::MIN && divisor == -1 {
        0
    } else {
        (dividend % divisor) as u32
    };
    s.set_x(insn.rd, value);
    Ok(Step::Next)
}

pub(super) fn remu(s: &mut MachineState, insn: &Insn) -> Exec {
    let dividend = s.x(insn.rs1);
    let divisor = s.x(insn.rs2);
    let value = if divisor == 0 { dividend } else { dividend % divisor };
    s.set_x(insn.rd, value);
    Ok(Step::Next)
}
