//! Blocks, the block map and the block cache
//!
//! A block is a maximal straight-line run of decoded instructions
//! starting at one entry PC and ending at a control transfer, the end
//! of the guest page, or a length cap. The [`BlockMap`] owns every
//! decoded block, keyed by exact entry PC; the bounded [`BlockCache`]
//! sits in front of it to answer hot lookups and accumulate the usage
//! counter behind [`BlockCache::hot`].
//!
//! Successor edges between blocks hold [`Weak`] references, so evicting
//! a block from the map invalidates every edge into it: the next
//! dispatch fails the upgrade and nulls the edge instead of chasing a
//! stale pointer.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use log::debug;

use crate::instr::decode::{decode, IllegalInstruction};
use crate::instr::{Insn, InsnRef, Opcode};
use crate::machine::SystemIo;

/// Guest page size; a block never spans two pages.
pub const PAGE_SIZE: u32 = 4096;

const PAGE_MASK: u32 = !(PAGE_SIZE - 1);

/// An owned, contiguous run of decoded instructions. The first record
/// is the block's entry point.
#[derive(Debug)]
pub struct Block {
    pub start: u32,
    pub insns: Box<[Insn]>,
    pub(crate) last_dispatch: Cell<u64>,
}

/// Decode one block starting at `start`, reading instruction words
/// through the host fetch callback.
pub fn translate<IO: SystemIo>(
    io: &mut IO,
    start: u32,
    max_len: usize,
) -> Result<Block, IllegalInstruction> {
    let mut insns = Vec::new();
    let mut pc = start;
    loop {
        let insn = decode(io.fetch(pc), pc)?;
        let next = insn.next_pc();
        let stop = insn.opcode.is_terminator()
            || insns.len() + 1 >= max_len
            || next & PAGE_MASK != start & PAGE_MASK;
        insns.push(insn);
        if stop {
            break;
        }
        pc = next;
    }
    Ok(Block {
        start,
        insns: insns.into_boxed_slice(),
        last_dispatch: Cell::new(0),
    })
}

/// Pre-link the terminator of a freshly decoded block against blocks
/// already in the map. Only statically known targets can be linked
/// here: direct jump and branch targets, and the branch fall-through.
/// Everything else resolves lazily at dispatch; a null edge is a hint
/// to fall back to the cache and map, never an error.
pub fn link_block(block: &Block, map: &BlockMap) {
    let Some(insn) = block.insns.last() else {
        return;
    };
    let link_to = |edge: &std::cell::RefCell<Option<InsnRef>>, target: u32| {
        if let Some(target_block) = map.peek(target) {
            *edge.borrow_mut() = Some(InsnRef::head_of(target_block));
        }
    };
    match insn.opcode {
        Opcode::Jal | Opcode::CJal | Opcode::CJ => {
            link_to(&insn.branch_taken, insn.pc.wrapping_add(insn.imm as u32));
        }
        Opcode::Beq
        | Opcode::Bne
        | Opcode::Blt
        | Opcode::Bge
        | Opcode::Bltu
        | Opcode::Bgeu
        | Opcode::CBeqz
        | Opcode::CBnez => {
            link_to(&insn.branch_taken, insn.pc.wrapping_add(insn.imm as u32));
            link_to(&insn.branch_untaken, insn.next_pc());
        }
        _ => {}
    }
}

/// The persistent mapping from entry PC to decoded block. Bounded;
/// eviction is LRU by last dispatch.
pub struct BlockMap {
    blocks: HashMap<u32, Rc<Block>>,
    capacity: usize,
    tick: u64,
}

impl BlockMap {
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: HashMap::new(),
            capacity,
            tick: 0,
        }
    }

    /// Look up the block entered at `pc`, marking it dispatched.
    pub fn find(&mut self, pc: u32) -> Option<Rc<Block>> {
        self.tick += 1;
        let block = self.blocks.get(&pc)?;
        block.last_dispatch.set(self.tick);
        Some(block.clone())
    }

    /// Look up without touching recency (used by the linker).
    pub fn peek(&self, pc: u32) -> Option<&Rc<Block>> {
        self.blocks.get(&pc)
    }

    /// Take ownership of a freshly translated block. At capacity the
    /// least-recently-dispatched block is evicted first; weak successor
    /// edges into it die with it.
    pub fn insert(&mut self, block: Block) -> Rc<Block> {
        if self.blocks.len() >= self.capacity {
            if let Some(victim) = self
                .blocks
                .iter()
                .min_by_key(|(_, b)| b.last_dispatch.get())
                .map(|(pc, _)| *pc)
            {
                debug!("block map full, evicting block at {victim:#010x}");
                self.blocks.remove(&victim);
            }
        }
        self.tick += 1;
        block.last_dispatch.set(self.tick);
        let block = Rc::new(block);
        self.blocks.insert(block.start, block.clone());
        block
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

struct CacheEntry {
    block: Rc<Block>,
    uses: u32,
    last: u64,
}

/// Bounded hot-index over the block map. `get` bumps a per-entry usage
/// counter; `hot` compares it against the promotion threshold. Evicting
/// a cache entry does not evict the block from the map.
pub struct BlockCache {
    entries: HashMap<u32, CacheEntry>,
    capacity: usize,
    hot_threshold: u32,
    tick: u64,
}

impl BlockCache {
    pub fn new(capacity: usize, hot_threshold: u32) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            hot_threshold,
            tick: 0,
        }
    }

    pub fn get(&mut self, pc: u32) -> Option<Rc<Block>> {
        self.tick += 1;
        let entry = self.entries.get_mut(&pc)?;
        entry.uses = entry.uses.saturating_add(1);
        entry.last = self.tick;
        Some(entry.block.clone())
    }

    /// True once the entry's usage counter has crossed the threshold.
    pub fn hot(&self, pc: u32) -> bool {
        self.entries
            .get(&pc)
            .is_some_and(|e| e.uses >= self.hot_threshold)
    }

    pub fn insert(&mut self, pc: u32, block: Rc<Block>) {
        self.tick += 1;
        if let Some(entry) = self.entries.get_mut(&pc) {
            entry.block = block;
            entry.last = self.tick;
            return;
        }
        if self.entries.len() >= self.capacity {
            if let Some(victim) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last)
                .map(|(pc, _)| *pc)
            {
                self.entries.remove(&victim);
            }
        }
        self.entries.insert(
            pc,
            CacheEntry {
                block,
                uses: 1,
                last: self.tick,
            },
        );
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::encode;
    use crate::io::LinearMemory;
    use crate::machine::SystemIo;

    fn memory_with(words: &[u32]) -> LinearMemory {
        let mut mem = LinearMemory::new(2 * PAGE_SIZE as usize);
        for (i, word) in words.iter().enumerate() {
            mem.write_w(4 * i as u32, *word);
        }
        mem
    }

    #[test]
    fn check_block_ends_at_terminator() {
        let mut mem = memory_with(&[
            encode::addi(1, 0, 1),
            encode::addi(2, 0, 2),
            encode::jal(0, -8),
            encode::addi(3, 0, 3),
        ]);
        let block = translate(&mut mem, 0, 64).unwrap();
        assert_eq!(block.insns.len(), 3);
        assert_eq!(block.insns[2].opcode, Opcode::Jal);
    }

    #[test]
    fn check_block_respects_max_len() {
        let mut mem = memory_with(&[encode::addi(1, 1, 1); 16]);
        let block = translate(&mut mem, 0, 4).unwrap();
        assert_eq!(block.insns.len(), 4);
    }

    #[test]
    fn check_block_stops_at_page_boundary() {
        let mut mem = LinearMemory::new(2 * PAGE_SIZE as usize);
        for i in 0..PAGE_SIZE / 4 + 8 {
            mem.write_w(4 * i, encode::addi(1, 1, 1));
        }
        let start = PAGE_SIZE - 8;
        let block = translate(&mut mem, start, 64).unwrap();
        // Two instructions fit before the next page.
        assert_eq!(block.insns.len(), 2);
        assert_eq!(block.insns[1].next_pc(), PAGE_SIZE);
    }

    #[test]
    fn check_linker_links_known_targets() {
        let mut mem = memory_with(&[
            // target block at 0
            encode::addi(1, 0, 1),
            encode::ecall(),
            // branch block at 8: beq x0, x0, -8
            encode::beq(0, 0, -8),
        ]);
        let mut map = BlockMap::new(16);
        let target = translate(&mut mem, 0, 64).unwrap();
        let target = map.insert(target);
        let branch = translate(&mut mem, 8, 64).unwrap();
        link_block(&branch, &map);
        let taken = branch.insns[0].branch_taken.borrow();
        let (resolved, index) = taken.as_ref().unwrap().upgrade().unwrap();
        assert!(Rc::ptr_eq(&resolved, &target));
        assert_eq!(index, 0);
        // Fall-through block at 12 does not exist yet, so no edge.
        assert!(branch.insns[0].branch_untaken.borrow().is_none());
    }

    #[test]
    fn check_eviction_invalidates_weak_edges() {
        let mut mem = memory_with(&[encode::jal(0, 0)]);
        let mut map = BlockMap::new(1);
        let first = map.insert(translate(&mut mem, 0, 64).unwrap());
        let edge = InsnRef::head_of(&first);
        drop(first);
        // Inserting a second block evicts the first (capacity 1).
        mem.write_w(8, encode::jal(0, 0));
        map.insert(translate(&mut mem, 8, 64).unwrap());
        assert!(edge.upgrade().is_none());
    }

    #[test]
    fn check_cache_hotness() {
        let mut mem = memory_with(&[encode::jal(0, 0)]);
        let mut map = BlockMap::new(4);
        let block = map.insert(translate(&mut mem, 0, 64).unwrap());
        let mut cache = BlockCache::new(4, 3);
        cache.insert(0, block);
        assert!(!cache.hot(0));
        cache.get(0);
        cache.get(0);
        assert!(cache.hot(0));
        assert!(!cache.hot(4));
    }

    #[test]
    fn check_cache_eviction_keeps_map_entry() {
        let mut mem = memory_with(&[encode::jal(0, 0)]);
        mem.write_w(8, encode::jal(0, 0));
        let mut map = BlockMap::new(4);
        let a = map.insert(translate(&mut mem, 0, 64).unwrap());
        let b = map.insert(translate(&mut mem, 8, 64).unwrap());
        let mut cache = BlockCache::new(1, 2);
        cache.insert(0, a);
        cache.insert(8, b);
        assert!(cache.get(0).is_none());
        assert!(cache.get(8).is_some());
        // The map still owns both.
        assert!(map.find(0).is_some());
        assert!(map.find(8).is_some());
    }
}
