//! Interpreter dispatch
//!
//! Rust guarantees no sibling-call elimination, so instead of chaining
//! instruction handlers through tail calls, [`dispatch`] is a
//! trampoline: a tight loop that switches on the opcode tag, carrying
//! `pc` and the cycle count in locals and only writing them back to
//! the machine state when control leaves the loop. Per retired
//! instruction the overhead is one match and at most one successor
//! probe, and the loop never allocates.
//!
//! A [`Step`] tells the trampoline what an instruction did:
//! straight-line instructions fall through to the next record in the
//! same block; terminators either chain directly into a successor
//! block (pre-linked edge, branch history hit, or a block-cache/map
//! probe) or exit to the outer run loop.

use std::cell::RefCell;
use std::rc::Rc;

use crate::block::Block;
use crate::instr::{Insn, InsnRef};
use crate::machine::{Machine, MisalignKind, SystemIo, Trap};

mod rv32a;
mod rv32f;
mod rv32i;
mod rv32m;
mod system;

/// What the dispatch loop does after one instruction.
pub(crate) enum Step {
    /// Fall through to the next record in the same block.
    Next,
    /// Tail-chain into another block's record without leaving dispatch.
    Chain(Rc<Block>, usize),
    /// Write back pc and cycle and return to the outer loop.
    Exit,
    /// Persist state and invoke the host ecall hook.
    Ecall,
    /// Persist state and invoke the host ebreak hook.
    Ebreak,
    /// Intentional halt (WFI); the instruction does not retire.
    Halt,
}

/// How a block dispatch returned to the run loop.
pub(crate) enum BlockExit {
    Continue,
    Halt,
}

/// Execute from the head of `entry`, chaining across blocks until a
/// terminator fails to resolve its successor or the cycle budget is
/// spent. On both success and fault, `pc`, `cycle` and `csr_cycle` are
/// written back before returning.
pub(crate) fn dispatch<IO: SystemIo>(
    m: &mut Machine<IO>,
    entry: &Rc<Block>,
    cycle_limit: u64,
) -> Result<BlockExit, Trap> {
    let mut block = entry.clone();
    let mut idx = 0;
    let mut pc = m.state.pc;
    let mut cycle = m.state.cycle;

    loop {
        let cur = block.clone();
        let insn = &cur.insns[idx];
        match step(m, insn, &mut pc) {
            Ok(Step::Next) => {
                cycle += 1;
                pc = insn.next_pc();
                idx += 1;
                if idx == cur.insns.len() {
                    // Block was cut by the page boundary or length cap.
                    write_back(m, pc, cycle);
                    return Ok(BlockExit::Continue);
                }
            }
            Ok(Step::Chain(next_block, next_idx)) => {
                cycle += 1;
                if cycle >= cycle_limit {
                    write_back(m, pc, cycle);
                    return Ok(BlockExit::Continue);
                }
                block = next_block;
                idx = next_idx;
            }
            Ok(Step::Exit) => {
                cycle += 1;
                write_back(m, pc, cycle);
                return Ok(BlockExit::Continue);
            }
            Ok(Step::Ecall) => {
                cycle += 1;
                m.state.compressed = insn.len == 2;
                write_back(m, pc, cycle);
                m.io.on_ecall(&mut m.state);
                return Ok(BlockExit::Continue);
            }
            Ok(Step::Ebreak) => {
                cycle += 1;
                m.state.compressed = insn.len == 2;
                write_back(m, pc, cycle);
                m.io.on_ebreak(&mut m.state);
                return Ok(BlockExit::Continue);
            }
            Ok(Step::Halt) => {
                write_back(m, pc, cycle);
                return Ok(BlockExit::Halt);
            }
            Err(trap) => {
                // The faulting instruction does not retire.
                write_back(m, pc, cycle);
                return Err(trap);
            }
        }
    }
}

fn write_back<IO>(m: &mut Machine<IO>, pc: u32, cycle: u64) {
    m.state.pc = pc;
    m.state.cycle = cycle;
    m.state.csr_cycle = cycle;
}

/// Resolve a successor edge for a control transfer landing on `target`.
/// A live cached edge chains directly; a dead edge (evicted referent)
/// is nulled first. With no usable edge, fall back to the block cache
/// and then the block map, re-linking on a hit. A null result is never
/// an error: the outer loop will translate the target.
fn resolve_edge<IO: SystemIo>(
    m: &mut Machine<IO>,
    edge: &RefCell<Option<InsnRef>>,
    target: u32,
) -> Step {
    let cached = edge.borrow().clone();
    if let Some(r) = cached {
        match r.upgrade() {
            Some((block, index)) => return Step::Chain(block, index),
            None => *edge.borrow_mut() = None,
        }
    }
    match m.lookup_block(target) {
        Some(block) => {
            *edge.borrow_mut() = Some(InsnRef::head_of(&block));
            Step::Chain(block, 0)
        }
        None => Step::Exit,
    }
}

/// Chain through the branch history table of an indirect jump, falling
/// back to the block map and recording the target round-robin.
fn resolve_indirect<IO: SystemIo>(m: &mut Machine<IO>, insn: &Insn, target: u32) -> Step {
    let Some(history) = insn.history.as_ref() else {
        return Step::Exit;
    };
    if let Some((block, index)) = history.find(target) {
        return Step::Chain(block, index);
    }
    match m.lookup_block(target) {
        Some(block) => {
            history.record(target, &block);
            Step::Chain(block, 0)
        }
        None => Step::Exit,
    }
}

fn misaligned_insn(insn: &Insn, target: u32) -> Trap {
    Trap::Misaligned {
        pc: insn.pc,
        kind: MisalignKind::Insn,
        target,
    }
}

/// Execute one instruction against the machine state. On entry `*pc`
/// is the instruction's own address; control transfers overwrite it,
/// everything else leaves the advance to the trampoline.
fn step<IO: SystemIo>(m: &mut Machine<IO>, insn: &Insn, pc: &mut u32) -> Result<Step, Trap> {
    use crate::instr::Opcode::*;
    match insn.opcode {
        Nop | CNop | Fence => Ok(Step::Next),

        // The expansions of C.LI and C.LUI carry the finished value in
        // imm, exactly like LUI.
        Lui | CLi | CLui => {
            m.state.set_x(insn.rd, insn.imm as u32);
            Ok(Step::Next)
        }
        Auipc => {
            m.state.set_x(insn.rd, pc.wrapping_add(insn.imm as u32));
            Ok(Step::Next)
        }

        Addi | CAddi | CAddi16sp | CAddi4spn => rv32i::addi(&mut m.state, insn),
        Slti => rv32i::slti(&mut m.state, insn),
        Sltiu => rv32i::sltiu(&mut m.state, insn),
        Xori => rv32i::xori(&mut m.state, insn),
        Ori => rv32i::ori(&mut m.state, insn),
        Andi | CAndi => rv32i::andi(&mut m.state, insn),
        Slli | CSlli => rv32i::slli(&mut m.state, insn),
        Srli | CSrli => rv32i::srli(&mut m.state, insn),
        Srai | CSrai => rv32i::srai(&mut m.state, insn),

        Add | CAdd => rv32i::add(&mut m.state, insn),
        Sub | CSub => rv32i::sub(&mut m.state, insn),
        Sll => rv32i::sll(&mut m.state, insn),
        Slt => rv32i::slt(&mut m.state, insn),
        Sltu => rv32i::sltu(&mut m.state, insn),
        Xor | CXor => rv32i::xor(&mut m.state, insn),
        Srl => rv32i::srl(&mut m.state, insn),
        Sra => rv32i::sra(&mut m.state, insn),
        Or | COr => rv32i::or(&mut m.state, insn),
        And | CAnd => rv32i::and(&mut m.state, insn),
        CMv => {
            let value = m.state.x(insn.rs2);
            m.state.set_x(insn.rd, value);
            Ok(Step::Next)
        }

        Lb => rv32i::lb(m, insn),
        Lh => rv32i::lh(m, insn),
        Lw | CLw | CLwsp => rv32i::lw(m, insn),
        Lbu => rv32i::lbu(m, insn),
        Lhu => rv32i::lhu(m, insn),
        Sb => rv32i::sb(m, insn),
        Sh => rv32i::sh(m, insn),
        Sw | CSw | CSwsp => rv32i::sw(m, insn),

        Jal | CJal | CJ => rv32i::jal(m, insn, pc),
        Jalr => rv32i::jalr(m, insn, pc),
        CJr | CJalr => rv32i::cjr(m, insn, pc),

        Beq => {
            let taken = m.state.x(insn.rs1) == m.state.x(insn.rs2);
            rv32i::branch(m, insn, pc, taken)
        }
        Bne => {
            let taken = m.state.x(insn.rs1) != m.state.x(insn.rs2);
            rv32i::branch(m, insn, pc, taken)
        }
        Blt => {
            let taken = (m.state.x(insn.rs1) as i32) < m.state.x(insn.rs2) as i32;
            rv32i::branch(m, insn, pc, taken)
        }
        Bge => {
            let taken = m.state.x(insn.rs1) as i32 >= m.state.x(insn.rs2) as i32;
            rv32i::branch(m, insn, pc, taken)
        }
        Bltu => {
            let taken = m.state.x(insn.rs1) < m.state.x(insn.rs2);
            rv32i::branch(m, insn, pc, taken)
        }
        Bgeu => {
            let taken = m.state.x(insn.rs1) >= m.state.x(insn.rs2);
            rv32i::branch(m, insn, pc, taken)
        }
        CBeqz => {
            let taken = m.state.x(insn.rs1) == 0;
            rv32i::branch(m, insn, pc, taken)
        }
        CBnez => {
            let taken = m.state.x(insn.rs1) != 0;
            rv32i::branch(m, insn, pc, taken)
        }

        Mul => rv32m::mul(&mut m.state, insn),
        Mulh => rv32m::mulh(&mut m.state, insn),
        Mulhsu => rv32m::mulhsu(&mut m.state, insn),
        Mulhu => rv32m::mulhu(&mut m.state, insn),
        Div => rv32m::div(&mut m.state, insn),
        Divu => rv32m::divu(&mut m.state, insn),
        Rem => rv32m::rem(&mut m.state, insn),
        Remu => rv32m::remu(&mut m.state, insn),

        Ecall => Ok(Step::Ecall),
        Ebreak | CEbreak => Ok(Step::Ebreak),
        Wfi => Ok(Step::Halt),
        Mret => system::mret(&mut m.state, pc),
        FenceI => system::fence_i(m, insn, pc),
        Csrrw | Csrrs | Csrrc | Csrrwi | Csrrsi | Csrrci => system::csr(&mut m.state, insn),

        LrW | ScW | AmoswapW | AmoaddW | AmoxorW | AmoandW | AmoorW | AmominW | AmomaxW
        | AmominuW | AmomaxuW => rv32a::amo(m, insn),

        Flw | Fsw | FmaddS | FmsubS | FnmsubS | FnmaddS | FaddS | FsubS | FmulS | FdivS
        | FsqrtS | FsgnjS | FsgnjnS | FsgnjxS | FminS | FmaxS | FcvtWS | FcvtWuS | FmvXW
        | FeqS | FltS | FleS | FclassS | FcvtSW | FcvtSWu | FmvWX => rv32f::exec(m, insn),
    }
}

#[cfg(test)]
mod tests {
    use crate::instr::encode;
    use crate::io::LinearMemory;
    use crate::machine::{
        Machine, MachineConfig, MisalignKind, StopReason, SystemIo, Trap, MSTATUS_MPIE,
    };

    fn memory_with(words: &[u32]) -> LinearMemory {
        let mut mem = LinearMemory::new(0x10000);
        for (i, word) in words.iter().enumerate() {
            mem.write_w(4 * i as u32, *word);
        }
        mem
    }

    fn machine_with(words: &[u32]) -> Machine<LinearMemory> {
        Machine::new(memory_with(words))
    }

    fn machine_with_halfwords(halves: &[u16]) -> Machine<LinearMemory> {
        let mut mem = LinearMemory::new(0x10000);
        for (i, half) in halves.iter().enumerate() {
            mem.write_s(2 * i as u32, *half);
        }
        Machine::new(mem)
    }

    #[test]
    fn check_lui_addi_sequence() {
        let mut m = machine_with(&[
            encode::lui(1, 0xabcde),
            encode::addi(1, 1, -1),
            encode::wfi(),
        ]);
        let stop = m.run(10).unwrap();
        assert_eq!(stop, StopReason::Wfi);
        assert_eq!(m.state.x(1), 0xabcd_dfff);
        assert_eq!(m.state.pc, 8);
        assert_eq!(m.state.cycle, 2);
    }

    #[test]
    fn check_taken_branch_skips_instruction() {
        let mut m = machine_with(&[
            encode::addi(1, 0, 5),
            encode::addi(2, 0, 3),
            encode::blt(2, 1, 8),
            encode::addi(3, 0, 99),
            encode::addi(4, 0, 7),
            encode::wfi(),
        ]);
        m.run(10).unwrap();
        assert_eq!(m.state.x(3), 0);
        assert_eq!(m.state.x(4), 7);
        assert_eq!(m.state.pc, 20);
    }

    #[test]
    fn check_compressed_branch_not_taken() {
        // c.beqz takes a primed register, so the branch source is x10.
        let mut m = machine_with_halfwords(&[
            encode::c_li(5, 3),
            encode::c_li(6, 3),
            encode::c_beqz(10, 4),
            encode::c_li(7, 1),
            encode::c_li(8, 2),
            encode::c_ebreak(),
        ]);
        m.state.set_x(10, 3);
        m.run(10).unwrap();
        assert_eq!(m.state.x(5), 3);
        assert_eq!(m.state.x(7), 1);
        assert_eq!(m.state.x(8), 2);
        assert_eq!(m.state.pc, 10);
    }

    #[test]
    fn check_compressed_branch_taken() {
        let mut m = machine_with_halfwords(&[
            encode::c_beqz(10, 6),
            encode::c_li(7, 1),
            encode::c_li(8, 2),
            encode::c_ebreak(),
        ]);
        m.run(10).unwrap();
        // Both c.li instructions were jumped over.
        assert_eq!(m.state.x(7), 0);
        assert_eq!(m.state.x(8), 0);
        assert_eq!(m.state.pc, 6);
    }

    #[test]
    fn check_signed_division() {
        let mut m = machine_with(&[
            encode::addi(1, 0, -8),
            encode::addi(2, 0, 3),
            encode::div(3, 1, 2),
            encode::wfi(),
        ]);
        m.run(10).unwrap();
        assert_eq!(m.state.x(3), 0xffff_fffe);
    }

    #[test]
    fn check_division_by_zero() {
        let mut m = machine_with(&[
            encode::addi(1, 0, 0),
            encode::div(2, 1, 1),
            encode::wfi(),
        ]);
        m.run(10).unwrap();
        assert_eq!(m.state.x(2), 0xffff_ffff);
    }

    #[test]
    fn check_signed_division_overflow() {
        let mut m = machine_with(&[
            encode::lui(1, 0x80000),
            encode::addi(2, 0, -1),
            encode::div(3, 1, 2),
            encode::rem(4, 1, 2),
            encode::wfi(),
        ]);
        m.run(10).unwrap();
        assert_eq!(m.state.x(3), 0x8000_0000);
        assert_eq!(m.state.x(4), 0);
    }

    #[test]
    fn check_jalr_clears_low_bit() {
        let mut m = machine_with(&[encode::jalr(1, 2, 0)]);
        m.state.set_x(2, 0x1003);
        m.run(1).unwrap();
        assert_eq!(m.state.pc, 0x1002);
        assert_eq!(m.state.x(1), 4);
    }

    #[test]
    fn check_jal_links_return_address() {
        let mut m = machine_with(&[encode::jal(5, 8), encode::wfi(), encode::wfi()]);
        m.run(10).unwrap();
        assert_eq!(m.state.x(5), 4);
        assert_eq!(m.state.pc, 8);
    }

    #[test]
    fn check_writes_to_x0_are_dropped() {
        let mut m = machine_with(&[
            encode::addi(0, 0, 42),
            encode::lui(0, 0xfffff),
            encode::jal(0, 4),
            encode::add(0, 1, 1),
            encode::wfi(),
        ]);
        m.state.set_x(1, 7);
        m.run(10).unwrap();
        assert_eq!(m.state.x(0), 0);
        assert_eq!(m.state.pc, 16);
    }

    #[test]
    fn check_cycle_budget_stops_linked_loop() {
        // A three-instruction block that chains back into itself; only
        // the cycle budget can end the dispatch.
        let mut m = machine_with(&[
            encode::addi(1, 1, 1),
            encode::addi(2, 2, 1),
            encode::jal(0, -8),
        ]);
        let stop = m.run(30).unwrap();
        assert_eq!(stop, StopReason::CycleLimit);
        assert_eq!(m.state.cycle, 30);
        assert_eq!(m.state.csr_cycle, 30);
        assert_eq!(m.state.pc, 0);
    }

    #[test]
    fn check_misaligned_load_reports_and_skips_callback() {
        struct Recorder {
            inner: LinearMemory,
            data_reads: u32,
        }
        impl SystemIo for Recorder {
            fn read_b(&mut self, addr: u32) -> u8 {
                self.data_reads += 1;
                self.inner.read_b(addr)
            }
            fn read_s(&mut self, addr: u32) -> u16 {
                self.data_reads += 1;
                self.inner.read_s(addr)
            }
            fn read_w(&mut self, addr: u32) -> u32 {
                self.data_reads += 1;
                self.inner.read_w(addr)
            }
            fn fetch(&mut self, addr: u32) -> u32 {
                self.inner.read_w(addr)
            }
            fn write_b(&mut self, addr: u32, value: u8) {
                self.inner.write_b(addr, value)
            }
            fn write_s(&mut self, addr: u32, value: u16) {
                self.inner.write_s(addr, value)
            }
            fn write_w(&mut self, addr: u32, value: u32) {
                self.inner.write_w(addr, value)
            }
            fn on_ecall(&mut self, state: &mut crate::machine::MachineState) {
                self.inner.on_ecall(state)
            }
            fn on_ebreak(&mut self, state: &mut crate::machine::MachineState) {
                self.inner.on_ebreak(state)
            }
        }
        let mut m = Machine::new(Recorder {
            inner: memory_with(&[encode::lw(1, 2, 1), encode::wfi()]),
            data_reads: 0,
        });
        let err = m.run(10).unwrap_err();
        assert_eq!(
            err,
            Trap::Misaligned {
                pc: 0,
                kind: MisalignKind::Load,
                target: 1
            }
        );
        assert_eq!(m.io.data_reads, 0);
        let latch = m.state.misalign.unwrap();
        assert_eq!(latch.kind, MisalignKind::Load);
        assert_eq!(latch.target, 1);
        // The faulting instruction did not retire.
        assert_eq!(m.state.cycle, 0);
        assert_eq!(m.state.pc, 0);
    }

    #[test]
    fn check_misaligned_store_leaves_memory_untouched() {
        let mut m = machine_with(&[encode::sw(1, 2, 0), encode::wfi()]);
        m.state.set_x(1, 0xdead_beef);
        m.state.set_x(2, 0x102);
        let err = m.run(10).unwrap_err();
        assert_eq!(
            err,
            Trap::Misaligned {
                pc: 0,
                kind: MisalignKind::Store,
                target: 0x102
            }
        );
        assert_eq!(m.io.read_w(0x100), 0);
        assert_eq!(m.io.read_w(0x104), 0);
    }

    #[test]
    fn check_misaligned_branch_target_faults_at_branch() {
        // c.jalr to an odd address; the fault reports the jump's pc
        // and commits nothing: neither the link register nor the pc
        // moves, and the instruction does not retire.
        let mut m = machine_with_halfwords(&[encode::c_jalr(10)]);
        m.state.set_x(10, 0x203);
        let err = m.run(10).unwrap_err();
        assert_eq!(
            err,
            Trap::Misaligned {
                pc: 0,
                kind: MisalignKind::Insn,
                target: 0x203
            }
        );
        assert_eq!(m.state.pc, 0);
        assert_eq!(m.state.x(1), 0);
        assert_eq!(m.state.cycle, 0);
        let latch = m.state.misalign.unwrap();
        assert_eq!(latch.kind, MisalignKind::Insn);
        assert_eq!(latch.target, 0x203);
    }

    #[test]
    fn check_ecall_latches_width_and_persists_state() {
        let mut m = machine_with(&[
            encode::addi(17, 0, 93),
            encode::addi(10, 0, 3),
            encode::ecall(),
        ]);
        let stop = m.run(10).unwrap();
        assert_eq!(stop, StopReason::Halted);
        assert!(!m.state.compressed);
        assert_eq!(m.io.exit_code, Some(3));
        // The exit handler stepped the pc past the ecall.
        assert_eq!(m.state.pc, 12);
        assert_eq!(m.state.cycle, 3);
    }

    #[test]
    fn check_compressed_ebreak_latches_flag() {
        let mut m = machine_with_halfwords(&[encode::c_li(5, 1), encode::c_ebreak()]);
        let stop = m.run(10).unwrap();
        assert_eq!(stop, StopReason::Halted);
        assert!(m.state.compressed);
        assert_eq!(m.state.pc, 2);
    }

    #[test]
    fn check_wfi_halts_without_retiring() {
        let mut m = machine_with(&[encode::addi(1, 0, 1), encode::wfi()]);
        let stop = m.run(10).unwrap();
        assert_eq!(stop, StopReason::Wfi);
        assert_eq!(m.state.pc, 4);
        assert_eq!(m.state.cycle, 1);
    }

    #[test]
    fn check_mret_restores_mepc() {
        let mut m = machine_with(&[encode::mret(), encode::addi(1, 0, 9), encode::wfi()]);
        m.state.csr_mepc = 4;
        m.run(10).unwrap();
        assert_eq!(m.state.x(1), 9);
        assert_eq!(m.state.csr_mstatus, MSTATUS_MPIE);
        assert_eq!(m.state.pc, 8);
    }

    #[test]
    fn check_branch_history_accelerates_indirect_loop() {
        let mut m = machine_with(&[
            encode::addi(1, 0, 6),  // 0:  counter
            encode::addi(2, 0, 12), // 4:  loop head address
            encode::jal(0, 4),      // 8:  -> 12
            encode::addi(1, 1, -1), // 12: loop head: decrement
            encode::beq(1, 0, 12),  // 16: counter zero -> 28
            encode::jalr(0, 2, 0),  // 20: indirect back edge -> 12
            encode::wfi(),          // 24: unreachable
            encode::wfi(),          // 28: exit
        ]);
        let stop = m.run(100).unwrap();
        assert_eq!(stop, StopReason::Wfi);
        assert_eq!(m.state.x(1), 0);
        assert_eq!(m.state.pc, 28);
    }

    #[test]
    fn check_block_execution_matches_single_stepping() {
        let program = [
            encode::addi(1, 0, 5),
            encode::slli(2, 1, 3),
            encode::sub(3, 2, 1),
            encode::xori(4, 3, 0x55),
            encode::sltu(5, 1, 2),
            encode::jal(6, 8),
        ];
        let mut whole = machine_with(&program);
        whole.run(6).unwrap();

        // Blocks of one instruction force a fresh lookup per step.
        let stepped_config = MachineConfig {
            max_block_len: 1,
            ..MachineConfig::default()
        };
        let mut stepped = Machine::with_config(memory_with(&program), stepped_config);
        stepped.run(6).unwrap();

        assert_eq!(stepped.state.pc, whole.state.pc);
        assert_eq!(stepped.state.cycle, whole.state.cycle);
        for reg in 0..32 {
            assert_eq!(stepped.state.x(reg), whole.state.x(reg));
        }
    }

    #[test]
    fn check_tiny_block_map_still_executes_correctly() {
        // Three blocks in a loop with a map that holds only two, so
        // every iteration evicts and re-translates; stale successor
        // edges must be detected dead and nulled, never followed.
        let config = MachineConfig {
            block_map_capacity: 2,
            block_cache_capacity: 2,
            ..MachineConfig::default()
        };
        let mut m = Machine::with_config(
            memory_with(&[
                encode::addi(1, 1, 1),  // 0:  block A
                encode::jal(0, 8),      // 4:  -> 12
                encode::wfi(),          // 8:  pad
                encode::addi(2, 2, 1),  // 12: block B
                encode::jal(0, 12),     // 16: -> 28
                encode::wfi(),          // 20: pad
                encode::wfi(),          // 24: pad
                encode::addi(3, 0, 10), // 28: block C
                encode::bne(1, 3, -32), // 32: loop while x1 != 10
                encode::wfi(),          // 36: exit
            ]),
            config,
        );
        let stop = m.run(1000).unwrap();
        assert_eq!(stop, StopReason::Wfi);
        assert_eq!(m.state.x(1), 10);
        assert_eq!(m.state.x(2), 10);
        assert_eq!(m.state.pc, 36);
    }

    #[test]
    fn check_fence_i_flushes_stale_decode() {
        // The first pass decodes the routine at 24 ending in a return
        // through x6. The program then overwrites that return with a
        // jump to the exit stub and issues fence.i; the second pass
        // must see the patched instruction, not the cached decode.
        let mut m = machine_with(&[
            encode::jal(6, 24),     // 0:  first visit, x6 = 4
            encode::lui(1, 0x1),    // 4:  x1 = 0x1000
            encode::lw(2, 1, 0),    // 8:  x2 = patch word
            encode::sw(2, 0, 28),   // 12: overwrite the return at 28
            encode::fence_i(),      // 16
            encode::jal(0, 4),      // 20: -> 24
            encode::addi(5, 5, 1),  // 24: routine head
            encode::jalr(0, 6, 0),  // 28: return to 4 (patched later)
            encode::wfi(),          // 32: pad
            encode::wfi(),          // 36: exit
        ]);
        // The patch word: jal x0, +8 (28 -> 36).
        m.io.write_w(0x1000, encode::jal(0, 8));
        let stop = m.run(100).unwrap();
        assert_eq!(stop, StopReason::Wfi);
        assert_eq!(m.state.x(5), 2);
        assert_eq!(m.state.pc, 36);
    }

    #[test]
    fn check_csr_reads_stale_cycle_mid_block() {
        // csr_cycle is only refreshed at block exits, so a read in the
        // middle of the first block still sees zero.
        let mut m = machine_with(&[
            encode::addi(1, 0, 1),
            encode::csrrs(5, 0xc00, 0),
            encode::wfi(),
        ]);
        m.run(10).unwrap();
        assert_eq!(m.state.x(5), 0);
        assert_eq!(m.state.cycle, 2);
    }

    #[test]
    fn check_amoadd_returns_old_value() {
        let mut m = machine_with(&[
            encode::lui(1, 0x1), // x1 = 0x1000
            encode::amoadd_w(3, 1, 2),
            encode::wfi(),
        ]);
        m.io.write_w(0x1000, 40);
        m.state.set_x(2, 2);
        m.run(10).unwrap();
        assert_eq!(m.state.x(3), 40);
        assert_eq!(m.io.read_w(0x1000), 42);
    }

    #[test]
    fn check_lr_sc_pair() {
        let mut m = machine_with(&[
            encode::lui(1, 0x1),
            encode::lr_w(3, 1),
            encode::addi(3, 3, 1),
            encode::sc_w(4, 1, 3),
            encode::wfi(),
        ]);
        m.io.write_w(0x1000, 10);
        m.run(10).unwrap();
        assert_eq!(m.io.read_w(0x1000), 11);
        // SC always succeeds on the single hart.
        assert_eq!(m.state.x(4), 0);
    }
}
