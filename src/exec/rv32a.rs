//! A extension placeholders
//!
//! The single hart executes strictly sequentially, so these
//! read-modify-write sequences are architecturally atomic here without
//! a reservation set: LR.W is a plain load, SC.W is a plain store that
//! always succeeds, and the AMOs are load-op-store. aq/rl ordering
//! bits are ignored. A multi-hart port must replace this module with a
//! reservation set keyed by (hart, address).

use super::Step;
use crate::instr::{Insn, Opcode};
use crate::machine::{Machine, MisalignKind, SystemIo, Trap};

type Exec = Result<Step, Trap>;

pub(super) fn amo<IO: SystemIo>(m: &mut Machine<IO>, insn: &Insn) -> Exec {
    let addr = m.state.x(insn.rs1);
    if addr & 3 != 0 {
        let kind = match insn.opcode {
            Opcode::LrW => MisalignKind::Load,
            _ => MisalignKind::Store,
        };
        return Err(Trap::Misaligned {
            pc: insn.pc,
            kind,
            target: addr,
        });
    }
    match insn.opcode {
        Opcode::LrW => {
            let value = m.io.read_w(addr);
            m.state.set_x(insn.rd, value);
        }
        Opcode::ScW => {
            m.io.write_w(addr, m.state.x(insn.rs2));
            // Always succeeds: there is no competing writer.
            m.state.set_x(insn.rd, 0);
        }
        _ => {
            let loaded = m.io.read_w(addr);
            let src = m.state.x(insn.rs2);
            let stored = match insn.opcode {
                Opcode::AmoswapW => src,
                Opcode::AmoaddW => loaded.wrapping_add(src),
                Opcode::AmoxorW => loaded ^ src,
                Opcode::AmoandW => loaded & src,
                Opcode::AmoorW => loaded | src,
                Opcode::AmominW => (loaded as i32).min(src as i32) as u32,
                Opcode::AmomaxW => (loaded as i32).max(src as i32) as u32,
                Opcode::AmominuW => loaded.min(src),
                _ => loaded.max(src),
            };
            m.io.write_w(addr, stored);
            m.state.set_x(insn.rd, loaded);
        }
    }
    Ok(Step::Next)
}
