//! MSP430 Simulator - CLI Entry Point
//!
//! Commands:
//! - `msp430-sim run <firmware>` - Run a firmware image
//! - `msp430-sim disasm <firmware>` - Disassemble part of a firmware image

use clap::{Args, Parser, Subcommand};
use msp430::cpu::execute::RESET_VECTOR;
use msp430::{Cpu, Instruction, Scheduler, SchedulerConfig, Tick};
use std::io::BufRead;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "msp430-sim")]
#[command(version = "0.1.0")]
#[command(about = "An instruction-set simulator for the MSP430 microcontroller")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a firmware image and run it from the reset vector
    Run(RunArgs),
    /// Disassemble words of a firmware image
    Disasm {
        /// Path to the raw firmware image
        firmware: String,
        /// First address to disassemble (default: reset vector target)
        #[arg(short, long, value_parser = parse_u16)]
        start: Option<u16>,
        /// Number of instructions to show
        #[arg(short, long, default_value = "32")]
        count: usize,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Path to the raw firmware image
    firmware: String,
    /// Timer interval in milliseconds
    #[arg(short, long, default_value = "50")]
    interval_ms: u64,
    /// Break into step-by-step mode at this address (repeatable)
    #[arg(short, long = "breakpoint", value_parser = parse_u16)]
    breakpoints: Vec<u16>,
    /// Overwrite a memory word before starting, as ADDR=VALUE (repeatable)
    #[arg(short, long = "patch", value_parser = parse_patch)]
    patches: Vec<(u16, u16)>,
    /// Print the byte at this memory-mapped port after every instruction (repeatable)
    #[arg(short, long = "watch", value_parser = parse_u16)]
    watches: Vec<u16>,
    /// Start in verbose (step-by-step) mode
    #[arg(short, long)]
    verbose: bool,
    /// Stop after this many ticks, without waiting for the timer interval
    #[arg(short, long)]
    max_ticks: Option<u64>,
    /// Read commands from stdin: `x` quits, `b` stops the timer and steps, `c` restarts it, anything else steps
    #[arg(long)]
    interactive: bool,
    /// Write the final machine state as JSON
    #[arg(long)]
    dump_state: Option<String>,
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse::<u16>(),
    };
    parsed.map_err(|e| format!("invalid 16-bit value '{}': {}", s, e))
}

fn parse_patch(s: &str) -> Result<(u16, u16), String> {
    let (addr, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ADDR=VALUE, got '{}'", s))?;
    Ok((parse_u16(addr)?, parse_u16(value)?))
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_firmware(args),
        Commands::Disasm { firmware, start, count } => disassemble_firmware(&firmware, start, count),
    }
}

fn load_cpu(path: &str) -> Cpu {
    let mut cpu = Cpu::new();
    if !cpu.load_flash_from_path(path) {
        eprintln!("❌ Failed to load firmware: {}", path);
        std::process::exit(1);
    }
    cpu
}

fn run_firmware(args: RunArgs) {
    println!("🔧 Running: {}", args.firmware);

    let mut cpu = load_cpu(&args.firmware);
    cpu.init();
    for &(addr, value) in &args.patches {
        log::info!("patching 0x{:04X} = 0x{:04X}", addr, value);
        cpu.mem.write_word(addr, value);
    }

    let scheduler = Arc::new(Scheduler::new(cpu, SchedulerConfig {
        interval: Duration::from_millis(args.interval_ms),
        verbose: args.verbose,
    }));

    for &addr in &args.breakpoints {
        scheduler.set_breakpoint(addr);
    }
    for &port in &args.watches {
        scheduler.add_observer(move |cpu| {
            println!("port 0x{:04X} state: {:08b}", port, cpu.mem.read_byte(port));
        });
    }

    if args.interactive {
        run_interactive(&scheduler);
    } else if let Some(max_ticks) = args.max_ticks {
        let executed = scheduler.run_for(max_ticks);
        println!("Executed {} instructions", executed);
    } else if let Err(e) = scheduler.spawn().join() {
        eprintln!("❌ Timer thread panicked: {:?}", e);
        std::process::exit(1);
    }

    let cpu = scheduler.snapshot();
    println!();
    println!("━━━ Result ━━━");
    println!("{}", cpu.regs);

    if let Some(path) = args.dump_state {
        let json = match serde_json::to_string_pretty(&cpu) {
            Ok(json) => json,
            Err(e) => {
                eprintln!("❌ Failed to serialize state: {}", e);
                std::process::exit(1);
            }
        };
        if let Err(e) = std::fs::write(&path, json) {
            eprintln!("❌ Failed to write {}: {}", path, e);
            std::process::exit(1);
        }
        println!("✓ State written to {}", path);
    }
}

fn run_interactive(scheduler: &Arc<Scheduler>) {
    let mut timer = Some(scheduler.spawn());

    for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        if interactive_command(scheduler, line.trim(), &mut timer).is_break() {
            break;
        }
    }

    scheduler.stop();
    if let Some(handle) = timer {
        let _ = handle.join();
    }
}

/// Apply one interactive command: `x` quits, `b` stops the timer and steps,
/// `c` restarts the timer, anything else steps.
fn interactive_command(
    scheduler: &Arc<Scheduler>,
    command: &str,
    timer: &mut Option<JoinHandle<()>>,
) -> ControlFlow<()> {
    match command {
        "x" => return ControlFlow::Break(()),
        "b" => {
            scheduler.stop();
            manual_tick(scheduler);
        }
        "c" => {
            if !scheduler.is_running() {
                if let Some(handle) = timer.take() {
                    let _ = handle.join();
                }
                *timer = Some(scheduler.spawn());
            }
        }
        _ => manual_tick(scheduler),
    }
    ControlFlow::Continue(())
}

fn manual_tick(scheduler: &Scheduler) {
    if let Tick::Faulted(e) = scheduler.tick() {
        eprintln!("❌ {}", e);
    }
}

fn disassemble_firmware(path: &str, start: Option<u16>, count: usize) {
    let cpu = load_cpu(path);
    let mut addr = start.unwrap_or_else(|| cpu.mem.read_word(RESET_VECTOR));

    println!("📖 Disassembling: {} from 0x{:04X}", path, addr);
    println!();

    for _ in 0..count {
        let word = cpu.mem.read_word(addr);
        let mut line = format!("{:04X}: {:04X}", addr, word);
        let mut next = addr.wrapping_add(2);

        match Instruction::classify(word).decode() {
            Ok(op) => {
                for _ in 0..op.extension_words() {
                    line.push_str(&format!(" {:04X}", cpu.mem.read_word(next)));
                    next = next.wrapping_add(2);
                }
                println!("{:<22} {}", line, op);
            }
            Err(e) => println!("{:<22} ; {}", line, e),
        }

        if next < addr {
            break;
        }
        addr = next;
    }
}
