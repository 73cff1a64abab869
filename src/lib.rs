//! Block-caching user-mode RV32-IMC emulator core
//!
//! Guest bytes are decoded into blocks of instruction records (one block
//! per entry PC, ending at a control transfer, a page boundary or a
//! length cap). Blocks live in a persistent [`block::BlockMap`] fronted
//! by a bounded [`block::BlockCache`] that tracks hotness. The
//! interpreter trampolines through a block, chaining into pre-linked
//! successor blocks without returning to the outer loop; indirect jumps
//! are accelerated by a small per-site branch history table.
//!
//! Each decoded record doubles as the input to a tier-1 code generator:
//! [`jit::emit`] lowers it to the abstract instruction set in [`jit`],
//! which a backend consumes to produce host code with the same
//! observable effect as the interpreter.
//!
//! Memory and environment calls are serviced by host callbacks behind
//! [`machine::SystemIo`]; [`io::LinearMemory`] is a ready-made flat-RAM
//! implementation suitable for freestanding images.

#![forbid(unsafe_code)]

pub mod block;
pub mod elf_utils;
pub mod exec;
pub mod instr;
pub mod io;
pub mod jit;
pub mod machine;
pub mod softfloat;
pub mod utils;
