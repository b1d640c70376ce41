// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

use std::{
    error::Error,
    fs,
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
};

use clap::Parser;
use lanes::{
    arch::{mask, Address},
    asm::{
        token::{parse_number, Number},
        Assembler, AssemblerConfig, DebugSymbols, FsLoader,
    },
    memory::Memory,
    vm::{VmConfig, VM},
};
use tracing::Level;

/// Bytes per row of a memory dump.
const DUMP_ROW: usize = 16;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Assembly source file
    source: PathBuf,

    /// Search directories for imported files
    #[arg(short = 'I', long)]
    include: Vec<PathBuf>,

    /// Most instructions to execute; 0 only assembles
    #[arg(short, long, default_value_t = 1_000_000)]
    steps: u64,

    /// Log every executed instruction at `TRACE` level
    #[arg(long)]
    trace: bool,

    /// Log every macro expansion at `TRACE` level
    #[arg(long)]
    trace_macros: bool,

    /// Print every label and its address
    #[arg(long)]
    symbols: bool,

    /// Print the assembled listing
    #[arg(long)]
    listing: bool,

    /// Fail on untyped operands instead of treating them as `i64`
    #[arg(long)]
    strict_types: bool,

    /// Fail unless the program defines the constant pool label
    #[arg(long)]
    pool_anchor: bool,

    /// Memory to print after running (repeatable)
    #[arg(long, value_name = "ADDR:LEN", value_parser = parse_dump)]
    dump: Vec<(Address, usize)>,

    /// One of `TRACE`, `DEBUG`, `INFO`, `WARN`, or `ERROR`
    #[arg(short, long, default_value_t = Level::WARN)]
    log_level: Level,
}

fn parse_dump(text: &str) -> Result<(Address, usize), String> {
    let (address, length) = text
        .split_once(':')
        .ok_or_else(|| format!("expected ADDR:LEN, found `{text}`"))?;
    let number = |part: &str| match parse_number(part.trim()) {
        Some(Number::Int(value)) if value >= 0 => Ok(value as u64),
        _ => Err(format!("`{part}` is not a non-negative integer")),
    };
    Ok((mask(number(address)?), number(length)? as usize))
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_writer(io::stderr)
        .init();

    if let Err(e) = main_real(args) {
        tracing::error!("{e}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn main_real(args: Args) -> Result<(), Box<dyn Error>> {
    let text = fs::read_to_string(&args.source)
        .map_err(|e| format!("cant open {}: {e}", args.source.display()))?;
    let name = args.source.display().to_string();

    let config = AssemblerConfig {
        default_type: if args.strict_types {
            None
        } else {
            AssemblerConfig::default().default_type
        },
        require_pool_anchor: args.pool_anchor,
        trace_expansion: args.trace_macros,
        ..AssemblerConfig::default()
    };
    let loader = Box::new(FsLoader::new(args.include));
    let mut assembler = Assembler::with_loader(config, loader);
    let mut vm = VM::new(VmConfig {
        trace: args.trace,
        ..VmConfig::default()
    });
    let symbols = assembler.assemble(&name, &text, vm.memory_mut())?;

    let mut out = io::stdout().lock();
    if args.symbols {
        for symbol in symbols.labels() {
            writeln!(out, "{:06x} {}", symbol.address, symbol.name)?;
        }
    }
    if args.listing {
        write!(out, "{}", symbols.listing())?;
    }

    let taken = vm.run(args.steps);
    for line in vm.take_debug_output() {
        writeln!(out, "{line}")?;
    }
    tracing::info!(
        steps = taken,
        halted = vm.is_halted(),
        "stopped at {}",
        location(&symbols, vm.pc())
    );

    for (address, length) in args.dump {
        dump(&mut out, &mut vm, address, length)?;
    }
    Ok(())
}

/// `label+offset` for an address, or the bare address.
fn location(symbols: &DebugSymbols, address: Address) -> String {
    match symbols.label_before(address) {
        Some(symbol) if symbol.address == address => {
            format!("{} ({address:#08x})", symbol.name)
        }
        Some(symbol) => format!(
            "{}+{:#x} ({address:#08x})",
            symbol.name,
            address - symbol.address
        ),
        None => format!("{address:#08x}"),
    }
}

fn dump(
    out: &mut impl Write,
    vm: &mut VM,
    address: Address,
    length: usize,
) -> io::Result<()> {
    let mut bytes = vec![0; length];
    vm.memory_mut().read(address, &mut bytes);
    for (row, chunk) in bytes.chunks(DUMP_ROW).enumerate() {
        let hex = chunk
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        let start = mask(address as u64 + (row * DUMP_ROW) as u64);
        writeln!(out, "{start:06x}  {hex}")?;
    }
    Ok(())
}
