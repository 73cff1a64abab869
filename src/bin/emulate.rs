use clap::Parser;
use clap_num::maybe_hex;

use rv32vm::elf_utils::load_elf;
use rv32vm::io::LinearMemory;
use rv32vm::machine::{Machine, StopReason};

/// Emulate a user-mode RV32-IMC processor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Args {
    /// Path to input executable file
    input: String,

    /// Guest memory size in bytes (use 0x prefix for hexadecimal)
    #[arg(short, long, value_parser=maybe_hex::<u32>, default_value="0x1000000")]
    memory: u32,

    /// Stop after this many retired instructions
    #[arg(short, long, default_value_t = u64::MAX)]
    cycles: u64,

    /// Override the entry point (use 0x prefix for hexadecimal)
    #[arg(short, long, value_parser=maybe_hex::<u32>)]
    entry: Option<u32>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut memory = LinearMemory::new(args.memory as usize);
    let entry = match load_elf(&mut memory, &args.input) {
        Ok(entry) => entry,
        Err(e) => {
            eprintln!("error loading {}: {e}", args.input);
            std::process::exit(1);
        }
    };

    let mut machine = Machine::new(memory);
    machine.state.pc = args.entry.unwrap_or(entry);

    let result = machine.run(args.cycles);
    print!("{}", machine.io.flush_stdout());
    match result {
        Ok(StopReason::Halted) => {
            let code = machine.io.exit_code.unwrap_or(0);
            std::process::exit(code as i32);
        }
        Ok(StopReason::Wfi) => {
            eprintln!("machine stopped in wfi at pc={:#010x}", machine.state.pc);
        }
        Ok(StopReason::CycleLimit) => {
            eprintln!(
                "cycle limit reached at pc={:#010x}, cycle={}",
                machine.state.pc, machine.state.cycle
            );
        }
        Err(trap) => {
            eprintln!(
                "trap: {trap} (pc={:#010x}, cycle={})",
                machine.state.pc, machine.state.cycle
            );
            std::process::exit(2);
        }
    }
}
