//! usi CLI - コマンドラインインターフェース
//!
//! 実行中のプロセスにアタッチして1つの操作を行い、デタッチして終了します。

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use usi_core::{Instrumenter, Protection, SessionConfig};
use usi_target::registers;

/// usi - User-space instrumentation for running processes
#[derive(Parser)]
#[command(name = "usi")]
#[command(version = "0.1.0")]
#[command(about = "Attach to a running process and inspect or call into it", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    session: SessionArgs,

    #[command(subcommand)]
    command: UsiCommand,
}

/// セッション設定の上書き（未指定なら環境変数と既定値）
#[derive(Args)]
struct SessionArgs {
    /// Maximum number of attach rounds
    #[arg(long, global = true)]
    attach_retries: Option<usize>,

    /// Timeout for each thread to reach a stop, in milliseconds
    #[arg(long, global = true)]
    stop_timeout_ms: Option<u64>,

    /// Timeout for a remote call to return, in milliseconds
    #[arg(long, global = true)]
    call_timeout_ms: Option<u64>,
}

#[derive(Subcommand)]
enum UsiCommand {
    /// List the threads of a process
    Threads {
        #[arg(short, long)]
        pid: i32,
    },

    /// Show the registers of a thread
    Regs {
        #[arg(short, long)]
        pid: i32,

        /// Thread ID (defaults to the main thread)
        #[arg(short, long)]
        tid: Option<i32>,
    },

    /// Dump memory as hex
    Peek {
        #[arg(short, long)]
        pid: i32,

        #[arg(short, long, value_parser = parse_number)]
        address: u64,

        #[arg(short, long, default_value_t = 64)]
        length: usize,
    },

    /// Write hex-encoded bytes to memory
    Poke {
        #[arg(short, long)]
        pid: i32,

        #[arg(short, long, value_parser = parse_number)]
        address: u64,

        /// Bytes to write, e.g. "90c3"
        #[arg(long)]
        hex: String,
    },

    /// Call a function inside the process
    Call {
        #[arg(short, long)]
        pid: i32,

        #[arg(short, long, value_parser = parse_number)]
        address: u64,

        /// Thread ID (defaults to the main thread)
        #[arg(short, long)]
        tid: Option<i32>,

        /// Integer arguments
        #[arg(value_parser = parse_number)]
        args: Vec<u64>,
    },

    /// Allocate a region, write a pattern, read it back and free it
    AllocProbe {
        #[arg(short, long)]
        pid: i32,

        #[arg(short, long, default_value_t = 4096)]
        size: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = session_config(&cli.session);
    debug!(?config, "session configuration");

    match cli.command {
        UsiCommand::Threads { pid } => threads(pid, config),
        UsiCommand::Regs { pid, tid } => regs(pid, tid, config),
        UsiCommand::Peek { pid, address, length } => peek(pid, address, length, config),
        UsiCommand::Poke { pid, address, hex } => poke(pid, address, &hex, config),
        UsiCommand::Call { pid, address, tid, args } => call(pid, address, tid, &args, config),
        UsiCommand::AllocProbe { pid, size } => alloc_probe(pid, size, config),
    }
}

/// RUST_LOG を読み、--verbose なら debug にする
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn session_config(args: &SessionArgs) -> SessionConfig {
    let mut config = SessionConfig::from_env();
    if let Some(rounds) = args.attach_retries {
        config = config.with_attach_retry_budget(rounds);
    }
    if let Some(ms) = args.stop_timeout_ms {
        config = config.with_stop_timeout(Duration::from_millis(ms));
    }
    if let Some(ms) = args.call_timeout_ms {
        config = config.with_call_timeout(Duration::from_millis(ms));
    }
    config
}

/// "0x" 付きなら16進数、それ以外は10進数
fn parse_number(s: &str) -> std::result::Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn attach(pid: i32, config: SessionConfig) -> Result<Instrumenter> {
    Instrumenter::attach(pid, config).with_context(|| format!("Failed to attach to process {}", pid))
}

fn threads(pid: i32, config: SessionConfig) -> Result<()> {
    let instrumenter = attach(pid, config)?;
    for thread in instrumenter.session().threads() {
        match thread.pending_signal() {
            Some(signal) => println!("{} (pending {:?})", thread.tid(), signal),
            None => println!("{}", thread.tid()),
        }
    }
    instrumenter.detach();
    Ok(())
}

fn regs(pid: i32, tid: Option<i32>, config: SessionConfig) -> Result<()> {
    let instrumenter = attach(pid, config)?;
    let tid = tid.unwrap_or(pid);
    let set = registers::capture(instrumenter.session(), tid)?;
    let gpr = set.gpr();

    let rows = [
        ("rip", gpr.rip),
        ("rsp", gpr.rsp),
        ("rbp", gpr.rbp),
        ("rax", gpr.rax),
        ("rbx", gpr.rbx),
        ("rcx", gpr.rcx),
        ("rdx", gpr.rdx),
        ("rsi", gpr.rsi),
        ("rdi", gpr.rdi),
        ("r8", gpr.r8),
        ("r9", gpr.r9),
        ("r10", gpr.r10),
        ("r11", gpr.r11),
        ("r12", gpr.r12),
        ("r13", gpr.r13),
        ("r14", gpr.r14),
        ("r15", gpr.r15),
        ("eflags", gpr.eflags),
        ("orig_rax", gpr.orig_rax),
        ("fs_base", gpr.fs_base),
    ];
    println!("Thread {}:", tid);
    for (name, value) in rows {
        println!("  {:<8} 0x{:016x}", name, value);
    }
    match set.xstate() {
        Some(xstate) => println!("  xstate   {} bytes", xstate.len()),
        None => println!("  xstate   unavailable"),
    }

    instrumenter.detach();
    Ok(())
}

fn peek(pid: i32, address: u64, length: usize, config: SessionConfig) -> Result<()> {
    let instrumenter = attach(pid, config)?;
    let bytes = instrumenter.read(address, length)?;
    print_hex_dump(address, &bytes);
    instrumenter.detach();
    Ok(())
}

fn poke(pid: i32, address: u64, hex_bytes: &str, config: SessionConfig) -> Result<()> {
    let bytes = hex::decode(hex_bytes).context("Invalid hex string")?;
    if bytes.is_empty() {
        bail!("Nothing to write");
    }
    let instrumenter = attach(pid, config)?;
    instrumenter.write(address, &bytes)?;
    println!("Wrote {} bytes at 0x{:x}", bytes.len(), address);
    instrumenter.detach();
    Ok(())
}

fn call(pid: i32, address: u64, tid: Option<i32>, args: &[u64], config: SessionConfig) -> Result<()> {
    let mut instrumenter = attach(pid, config)?;
    let result = match tid {
        Some(tid) => instrumenter.execute(tid, address, args),
        None => instrumenter.execute_on_main(address, args),
    };
    let report = instrumenter.detach();
    let value = result?;
    println!("0x{:x} ({})", value, value);
    debug!(outcome = ?report.outcome, "detached");
    Ok(())
}

fn alloc_probe(pid: i32, size: u64, config: SessionConfig) -> Result<()> {
    let mut instrumenter = attach(pid, config)?;
    let region = instrumenter.allocate(size, Protection::READ_WRITE)?;
    println!("Allocated 0x{:x}..0x{:x}", region.base, region.end());

    let pattern: Vec<u8> = (0..region.len).map(|i| (i % 251) as u8).collect();
    instrumenter.write(region.base, &pattern)?;
    let readback = instrumenter.read(region.base, pattern.len())?;
    let matched = readback == pattern;
    println!("Read back {} bytes: {}", readback.len(), if matched { "match" } else { "MISMATCH" });

    instrumenter.free(region.base)?;
    println!("Freed 0x{:x}", region.base);

    let report = instrumenter.detach();
    if !matched {
        bail!("Read back data differs from the written pattern");
    }
    debug!(outcome = ?report.outcome, "detached");
    Ok(())
}

/// 16バイトごとにアドレス付きで表示する
fn print_hex_dump(address: u64, bytes: &[u8]) {
    for (i, chunk) in bytes.chunks(16).enumerate() {
        println!("0x{:016x}: {}", address + (i * 16) as u64, hex::encode(chunk));
    }
}
