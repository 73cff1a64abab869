//! F extension semantics
//!
//! Sign injection, moves and classification are bit-exact and computed
//! here; everything that rounds goes through the machine's
//! [`FloatOracle`]. The rounding mode is read out of fcsr right before
//! each oracle call, and the sticky flags the call reports are OR-ed
//! back in. Without an installed oracle the arithmetic operations
//! raise an illegal instruction.

use super::Step;
use crate::instr::decode::IllegalInstruction;
use crate::instr::{Insn, Opcode};
use crate::machine::{Machine, MachineState, MisalignKind, SystemIo, Trap};
use crate::softfloat::{
    fclass, is_nan, is_signaling_nan, FloatOracle, FloatResult, RoundingMode, FFLAG_INVALID_OP,
    FMASK_SIGN, RV_NAN,
};

type Exec = Result<Step, Trap>;

fn illegal(insn: &Insn) -> Trap {
    Trap::IllegalInstruction(IllegalInstruction {
        pc: insn.pc,
        raw: insn.raw,
    })
}

fn rounding(s: &MachineState) -> RoundingMode {
    RoundingMode::from_frm(s.csr_fcsr >> 5)
}

fn oracle<'a>(
    float: &'a mut Option<Box<dyn FloatOracle>>,
    insn: &Insn,
) -> Result<&'a mut dyn FloatOracle, Trap> {
    match float.as_deref_mut() {
        Some(f) => Ok(f),
        None => Err(illegal(insn)),
    }
}

fn apply_float(s: &mut MachineState, rd: u8, result: FloatResult) {
    s.set_freg(rd, result.bits);
    s.csr_fcsr |= result.flags & 0x1f;
}

fn apply_int(s: &mut MachineState, rd: u8, result: FloatResult) {
    s.set_x(rd, result.bits);
    s.csr_fcsr |= result.flags & 0x1f;
}

pub(super) fn exec<IO: SystemIo>(m: &mut Machine<IO>, insn: &Insn) -> Exec {
    let (a, b, c) = (
        m.state.freg(insn.rs1),
        m.state.freg(insn.rs2),
        m.state.freg(insn.rs3),
    );
    let rm = rounding(&m.state);
    match insn.opcode {
        Opcode::Flw => {
            let addr = m.state.x(insn.rs1).wrapping_add(insn.imm as u32);
            if addr & 3 != 0 {
                return Err(Trap::Misaligned {
                    pc: insn.pc,
                    kind: MisalignKind::Load,
                    target: addr,
                });
            }
            let bits = m.io.read_w(addr);
            m.state.set_freg(insn.rd, bits);
        }
        Opcode::Fsw => {
            let addr = m.state.x(insn.rs1).wrapping_add(insn.imm as u32);
            if addr & 3 != 0 {
                return Err(Trap::Misaligned {
                    pc: insn.pc,
                    kind: MisalignKind::Store,
                    target: addr,
                });
            }
            m.io.write_w(addr, b);
        }

        Opcode::FsgnjS => {
            m.state.set_freg(insn.rd, (a & !FMASK_SIGN) | (b & FMASK_SIGN));
        }
        Opcode::FsgnjnS => {
            m.state.set_freg(insn.rd, (a & !FMASK_SIGN) | (!b & FMASK_SIGN));
        }
        Opcode::FsgnjxS => {
            m.state.set_freg(insn.rd, a ^ (b & FMASK_SIGN));
        }
        Opcode::FmvXW => m.state.set_x(insn.rd, a),
        Opcode::FmvWX => {
            let bits = m.state.x(insn.rs1);
            m.state.set_freg(insn.rd, bits);
        }
        Opcode::FclassS => m.state.set_x(insn.rd, fclass(a)),

        Opcode::FminS | Opcode::FmaxS => {
            if is_signaling_nan(a) || is_signaling_nan(b) {
                m.state.csr_fcsr |= FFLAG_INVALID_OP;
            }
            let o = oracle(&mut m.float, insn)?;
            let pick_a = if insn.opcode == Opcode::FminS {
                o.lt_quiet(a, b).bits != 0 || (o.eq_quiet(a, b).bits != 0 && a & FMASK_SIGN != 0)
            } else {
                o.lt_quiet(b, a).bits != 0 || (o.eq_quiet(a, b).bits != 0 && b & FMASK_SIGN != 0)
            };
            let bits = if is_nan(a) && is_nan(b) {
                RV_NAN
            } else if pick_a || is_nan(b) {
                a
            } else {
                b
            };
            m.state.set_freg(insn.rd, bits);
        }

        Opcode::FaddS => {
            let r = oracle(&mut m.float, insn)?.add(a, b, rm);
            apply_float(&mut m.state, insn.rd, r);
        }
        Opcode::FsubS => {
            let r = oracle(&mut m.float, insn)?.sub(a, b, rm);
            apply_float(&mut m.state, insn.rd, r);
        }
        Opcode::FmulS => {
            let r = oracle(&mut m.float, insn)?.mul(a, b, rm);
            apply_float(&mut m.state, insn.rd, r);
        }
        Opcode::FdivS => {
            let r = oracle(&mut m.float, insn)?.div(a, b, rm);
            apply_float(&mut m.state, insn.rd, r);
        }
        Opcode::FsqrtS => {
            let r = oracle(&mut m.float, insn)?.sqrt(a, rm);
            apply_float(&mut m.state, insn.rd, r);
        }
        Opcode::FmaddS => {
            let r = oracle(&mut m.float, insn)?.mul_add(a, b, c, rm);
            apply_float(&mut m.state, insn.rd, r);
        }
        Opcode::FmsubS => {
            let r = oracle(&mut m.float, insn)?.mul_add(a, b, c ^ FMASK_SIGN, rm);
            apply_float(&mut m.state, insn.rd, r);
        }
        Opcode::FnmsubS => {
            let r = oracle(&mut m.float, insn)?.mul_add(a ^ FMASK_SIGN, b, c, rm);
            apply_float(&mut m.state, insn.rd, r);
        }
        Opcode::FnmaddS => {
            let r = oracle(&mut m.float, insn)?
                .mul_add(a ^ FMASK_SIGN, b, c ^ FMASK_SIGN, rm);
            apply_float(&mut m.state, insn.rd, r);
        }

        Opcode::FcvtWS => {
            let r = oracle(&mut m.float, insn)?.to_i32(a, rm);
            apply_int(&mut m.state, insn.rd, r);
        }
        Opcode::FcvtWuS => {
            let r = oracle(&mut m.float, insn)?.to_u32(a, rm);
            apply_int(&mut m.state, insn.rd, r);
        }
        Opcode::FcvtSW => {
            let value = m.state.x(insn.rs1);
            let r = oracle(&mut m.float, insn)?.from_i32(value, rm);
            apply_float(&mut m.state, insn.rd, r);
        }
        Opcode::FcvtSWu => {
            let value = m.state.x(insn.rs1);
            let r = oracle(&mut m.float, insn)?.from_u32(value, rm);
            apply_float(&mut m.state, insn.rd, r);
        }

        Opcode::FeqS => {
            let r = oracle(&mut m.float, insn)?.eq_quiet(a, b);
            apply_int(&mut m.state, insn.rd, r);
        }
        Opcode::FltS => {
            let r = oracle(&mut m.float, insn)?.lt(a, b);
            apply_int(&mut m.state, insn.rd, r);
        }
        Opcode::FleS => {
            let r = oracle(&mut m.float, insn)?.le(a, b);
            apply_int(&mut m.state, insn.rd, r);
        }
        _ => return Err(illegal(insn)),
    }
    Ok(Step::Next)
}

#[cfg(test)]
mod tests {
    use crate::instr::encode;
    use crate::io::LinearMemory;
    use crate::machine::{Machine, SystemIo};
    use crate::softfloat::{FloatOracle, FloatResult, RoundingMode, RV_NAN};

    /// Host-f32 oracle, good enough for exact-result tests. Flags are
    /// reported only where the outcome is unambiguous.
    struct HostFloat;

    fn ok(bits: u32) -> FloatResult {
        FloatResult { bits, flags: 0 }
    }

    fn f(bits: u32) -> f32 {
        f32::from_bits(bits)
    }

    impl FloatOracle for HostFloat {
        fn add(&mut self, a: u32, b: u32, _rm: RoundingMode) -> FloatResult {
            ok((f(a) + f(b)).to_bits())
        }
        fn sub(&mut self, a: u32, b: u32, _rm: RoundingMode) -> FloatResult {
            ok((f(a) - f(b)).to_bits())
        }
        fn mul(&mut self, a: u32, b: u32, _rm: RoundingMode) -> FloatResult {
            ok((f(a) * f(b)).to_bits())
        }
        fn div(&mut self, a: u32, b: u32, _rm: RoundingMode) -> FloatResult {
            ok((f(a) / f(b)).to_bits())
        }
        fn sqrt(&mut self, a: u32, _rm: RoundingMode) -> FloatResult {
            ok(f(a).sqrt().to_bits())
        }
        fn mul_add(&mut self, a: u32, b: u32, c: u32, _rm: RoundingMode) -> FloatResult {
            ok(f(a).mul_add(f(b), f(c)).to_bits())
        }
        fn to_i32(&mut self, a: u32, _rm: RoundingMode) -> FloatResult {
            ok((f(a) as i32) as u32)
        }
        fn to_u32(&mut self, a: u32, _rm: RoundingMode) -> FloatResult {
            ok(f(a) as u32)
        }
        fn from_i32(&mut self, value: u32, _rm: RoundingMode) -> FloatResult {
            ok((value as i32 as f32).to_bits())
        }
        fn from_u32(&mut self, value: u32, _rm: RoundingMode) -> FloatResult {
            ok((value as f32).to_bits())
        }
        fn eq_quiet(&mut self, a: u32, b: u32) -> FloatResult {
            ok(u32::from(f(a) == f(b)))
        }
        fn lt(&mut self, a: u32, b: u32) -> FloatResult {
            ok(u32::from(f(a) < f(b)))
        }
        fn le(&mut self, a: u32, b: u32) -> FloatResult {
            ok(u32::from(f(a) <= f(b)))
        }
        fn lt_quiet(&mut self, a: u32, b: u32) -> FloatResult {
            ok(u32::from(f(a) < f(b)))
        }
    }

    fn float_machine(words: &[u32]) -> Machine<LinearMemory> {
        let mut mem = LinearMemory::new(0x10000);
        for (i, word) in words.iter().enumerate() {
            mem.write_w(4 * i as u32, *word);
        }
        let mut m = Machine::new(mem);
        m.set_float_oracle(Box::new(HostFloat));
        m
    }

    #[test]
    fn check_flw_fadd_fsw_round_trip() {
        let mut m = float_machine(&[
            encode::lui(1, 0x1), // x1 = 0x1000
            encode::flw(1, 1, 0),
            encode::flw(2, 1, 4),
            encode::fadd_s(3, 1, 2),
            encode::fsw(3, 1, 8),
            encode::wfi(),
        ]);
        m.io.write_w(0x1000, 1.5f32.to_bits());
        m.io.write_w(0x1004, 2.25f32.to_bits());
        m.run(10).unwrap();
        assert_eq!(f32::from_bits(m.io.read_w(0x1008)), 3.75);
    }

    #[test]
    fn check_sign_injection_is_bit_exact() {
        let mut m = float_machine(&[encode::fsgnjn_s(3, 1, 2), encode::fmv_x_w(5, 3), encode::wfi()]);
        m.state.set_freg(1, 0x3f80_0000); // 1.0
        m.state.set_freg(2, 0x3f80_0000); // positive source -> negated sign
        m.run(10).unwrap();
        assert_eq!(m.state.x(5), 0xbf80_0000);
    }

    #[test]
    fn check_fclass_of_nan() {
        let mut m = float_machine(&[encode::fclass_s(5, 1), encode::wfi()]);
        m.state.set_freg(1, RV_NAN);
        m.run(10).unwrap();
        assert_eq!(m.state.x(5), 1 << 9);
    }

    #[test]
    fn check_feq_writes_integer_register() {
        let mut m = float_machine(&[encode::feq_s(5, 1, 2), encode::wfi()]);
        m.state.set_freg(1, 2.0f32.to_bits());
        m.state.set_freg(2, 2.0f32.to_bits());
        m.run(10).unwrap();
        assert_eq!(m.state.x(5), 1);
    }

    #[test]
    fn check_float_arithmetic_without_oracle_is_illegal() {
        let mut mem = LinearMemory::new(0x1000);
        mem.write_w(0, encode::fadd_s(3, 1, 2));
        mem.write_w(4, encode::wfi());
        let mut m = Machine::new(mem);
        assert!(m.run(10).is_err());
    }
}
