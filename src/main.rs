use clap::Parser;
use clap_num::maybe_hex;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use imps::hart::{Hart, Outcome};
use imps::loader;

/// Emulate the IMPS 32-bit register machine
///
/// Runs a raw program image loaded at guest address 0. Programs may
/// contain JIT meta-instructions requesting that a range of their own
/// code be translated to native machine code and executed.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Args {
    /// Path to the raw program image
    program: PathBuf,

    /// Print each executed instruction to stdout
    #[arg(short, long)]
    debug: bool,

    /// Single step through each instruction and print state
    #[arg(short, long)]
    step: bool,

    /// Print the 8-word memory region starting from this address
    /// after each step (use 0x prefix for hexadecimal)
    #[arg(short, long, value_parser=maybe_hex::<u32>)]
    memory: Option<u32>,
}

fn press_enter_to_continue() {
    let mut stdin = io::stdin();
    let mut stdout = io::stdout();

    write!(stdout, "Press enter to continue...").unwrap();
    stdout.flush().unwrap();

    // Read a single byte and discard
    let _ = stdin.read(&mut [0u8]).unwrap();
}

fn print_memory(hart: &Hart, base: u32) {
    for n in 0..8 {
        let addr = base.wrapping_add(4 * n);
        match hart.memory.read_word(addr) {
            Ok(word) => println!("{addr:x}: {word:x}"),
            Err(_) => println!("{addr:x}: <out of range>"),
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let image = match loader::read_image(&args.program) {
        Ok(image) => image,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let mut hart = Hart::new();
    hart.load_image(&image);
    hart.set_trace(args.debug || args.step);

    loop {
        match hart.step() {
            Ok(Outcome::Halted) => {
                print!("{hart}");
                return ExitCode::SUCCESS;
            }
            Ok(Outcome::Running) => {}
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::FAILURE;
            }
        }

        if args.debug || args.step {
            if let Some(base) = args.memory {
                println!("Memory:");
                print_memory(&hart, base);
            }
        }
        if args.step {
            press_enter_to_continue();
        }
    }
}
