//! `sysemu`: CLI driver for the chip core.
//!
//! This binary is the external driver living outside the core's scope
//! (ELF loading glue, argument parsing, dump-file writing); all
//! architectural behavior lives in `et_sysemu_core`.

use clap::Parser;
use et_sysemu_core::chip::{Chip, StopReason};
use et_sysemu_core::config::{CheckerConfig, DramSize, EmulatorConfig};
use et_sysemu_core::devices::uart::UART_BASE;
use et_sysemu_core::loader;
use et_sysemu_core::memory::Region;
use et_sysemu_core::topology::HartId;
use std::fs;
use std::path::PathBuf;

/// Functional emulator core driver for the chip.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// ELF kernel to load (program headers placed at their physical addrs).
    #[arg(long)]
    kernel: Option<PathBuf>,

    /// Raw (headerless) binary to load.
    #[arg(long)]
    raw: Option<PathBuf>,

    /// Physical address for --raw.
    #[arg(long)]
    raw_addr: Option<u64>,

    /// Preload a single 64-bit word, repeatable: --preload 0x80000000=0x1
    #[arg(long = "preload")]
    preloads: Vec<String>,

    /// Override the reset PC every initially-running hart starts at.
    #[arg(long)]
    reset_pc: Option<u64>,

    /// Disable thread 1 of the given minion hart id at boot, repeatable.
    #[arg(long = "disable-hart")]
    disable_harts: Vec<u32>,

    /// Feed this file's bytes into the I/O shire UART's RX FIFO before running.
    #[arg(long)]
    uart_in: Option<PathBuf>,

    /// Write bytes the guest sends to UART TX here (in addition to stdout).
    #[arg(long)]
    uart_out: Option<PathBuf>,

    /// Dump a physical address range after the run, repeatable:
    /// --dump 0x80000000:0x80001000
    #[arg(long = "dump")]
    dumps: Vec<String>,

    /// Leave a hook point for a GDB stub to attach (wire protocol is an
    /// external collaborator, not implemented by this core).
    #[arg(long)]
    gdb: bool,

    /// Enable the scratchpad-row-lock coherency checker.
    #[arg(long)]
    check_coherency: bool,

    /// Enable the scratchpad checker.
    #[arg(long)]
    check_scratchpad: bool,

    /// Enable the tensor-store checker.
    #[arg(long)]
    check_tensor_store: bool,

    /// Ceiling on the scheduler's cycle counter.
    #[arg(long)]
    max_cycles: Option<u64>,

    /// Installed DRAM size in GiB (8, 16, 24, or 32).
    #[arg(long, default_value_t = 8)]
    dram_gib: u64,

    /// Number of compute shires.
    #[arg(long, default_value_t = 1)]
    compute_shires: u32,

    /// Number of memory shires.
    #[arg(long, default_value_t = 1)]
    memory_shires: u32,
}

fn parse_addr(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| e.to_string())
    } else {
        s.parse::<u64>().map_err(|e| e.to_string())
    }
}

fn parse_preload(s: &str) -> Result<(u64, u64), String> {
    let (addr, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected addr=value, got {s}"))?;
    Ok((parse_addr(addr)?, parse_addr(value)?))
}

fn parse_range(s: &str) -> Result<(u64, u64), String> {
    let (lo, hi) = s
        .split_once(':')
        .ok_or_else(|| format!("expected lo:hi, got {s}"))?;
    Ok((parse_addr(lo)?, parse_addr(hi)?))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let kernel_bytes = args.kernel.as_ref().map(fs::read).transpose()?;
    let raw_bytes = args.raw.as_ref().map(fs::read).transpose()?;

    let dram_size = DramSize::from_gib(args.dram_gib)
        .ok_or_else(|| format!("--dram-gib must be one of 8, 16, 24, 32 (got {})", args.dram_gib))?;

    let mut config = EmulatorConfig::new(args.compute_shires, args.memory_shires);
    config.dram_size = dram_size;
    config.max_cycles = args.max_cycles.unwrap_or(u64::MAX);
    config.enable_gdb = args.gdb;
    config.checkers = CheckerConfig {
        coherency: args.check_coherency,
        scratchpad: args.check_scratchpad,
        tensor_store: args.check_tensor_store,
    };

    if let Some(pc) = args.reset_pc {
        config.reset_pc = pc;
    } else if let Some(ref buf) = kernel_bytes {
        if let Ok(elf) = goblin::elf::Elf::parse(buf) {
            config.reset_pc = elf.entry;
        }
    } else if let Some(addr) = args.raw_addr {
        config.reset_pc = addr;
    }

    let mut chip = Chip::new(config);

    if let Some(buf) = &kernel_bytes {
        let entry = loader::load_elf(buf, &mut chip.mem)?;
        log::info!("ELF loaded, entry={entry:#x}");
    }
    if let Some(buf) = &raw_bytes {
        let addr = args
            .raw_addr
            .ok_or("--raw requires --raw-addr")?;
        loader::load_raw(buf, addr, &mut chip.mem)?;
        log::info!("raw image loaded at {addr:#x}");
    }
    for p in &args.preloads {
        let (addr, value) = parse_preload(p)?;
        loader::preload_word(addr, value, &mut chip.mem)?;
    }
    for hart in &args.disable_harts {
        chip.set_hart_enabled(HartId(*hart), false);
    }
    if let Some(path) = &args.uart_in {
        let bytes = fs::read(path)?;
        if let Some(Region::Uart(uart)) = chip.mem.region_mut(UART_BASE) {
            uart.push_input(&bytes);
        }
    }

    let reason = chip.run();

    let mut tx = Vec::new();
    if let Some(Region::Uart(uart)) = chip.mem.region_mut(UART_BASE) {
        tx = uart.drain_output();
    }
    use std::io::Write;
    std::io::stdout().write_all(&tx)?;
    if let Some(path) = &args.uart_out {
        fs::write(path, &tx)?;
    }

    for d in &args.dumps {
        let (lo, hi) = parse_range(d)?;
        if let Some(region) = chip.mem.region(lo) {
            let bytes = region.dump(lo, hi);
            println!("dump {lo:#x}..{hi:#x}: {}", hex::encode(&bytes));
        }
    }

    eprintln!(
        "stopped: {reason:?} at cycle {} ({} active, {} sleeping)",
        chip.scheduler.cycle,
        chip.scheduler.has_active(),
        chip.scheduler.has_sleeping()
    );

    std::process::exit(match reason {
        StopReason::Pass => 0,
        other => other.exit_code(),
    });
}
