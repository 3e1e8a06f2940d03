use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use synacor_core::{
    load_snapshot, CoreError, ExecMode, HostSignals, InputRecorder, Machine, RunConfig, Session,
    StopReason, StreamConsole, TraceEncoding, TraceWriter,
};
use tracing_subscriber::{fmt, EnvFilter};

const LOG_ENV: &str = "SYNACOR_LOG";

#[derive(Parser, Debug)]
#[command(name = "synacor", about = "Run or disassemble a Synacor program image")]
struct Args {
    /// Trace output, disassembled.
    #[arg(short = 'd', conflicts_with = "hex")]
    disasm: bool,
    /// Disassemble the image to stdout instead of running it.
    #[arg(short = 'D')]
    disassemble_only: bool,
    /// Trace output, hex words.
    #[arg(short = 'x')]
    hex: bool,
    /// Stop after N instructions.
    #[arg(short = 'l', value_name = "N")]
    limit: Option<u64>,
    /// Treat IMAGE as a snapshot file.
    #[arg(short = 'r')]
    restore: bool,
    /// Initial value of r7.
    #[arg(short = 's', value_name = "N")]
    r7: Option<u16>,
    /// Emit an instruction trace to PATH.
    #[arg(short = 't', value_name = "PATH")]
    trace: Option<PathBuf>,
    /// Where a save request (SIGUSR1) writes the snapshot.
    #[arg(long, value_name = "PATH", default_value = synacor_core::session::DEFAULT_SNAPSHOT_PATH)]
    snapshot_path: PathBuf,
    /// Write the input log to PATH at exit.
    #[arg(long, value_name = "PATH")]
    record: Option<PathBuf>,
    /// Replay input from a log written by --record.
    #[arg(long, value_name = "PATH")]
    replay: Option<PathBuf>,
    /// Replay while fewer than N instructions have run.
    #[arg(long, value_name = "N", requires = "replay")]
    replay_limit: Option<u64>,
    /// Diagnostic verbosity (error, warn, info, debug, trace).
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
    /// Program image (or snapshot with -r).
    image: PathBuf,
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    let use_ansi = std::env::var_os("NO_COLOR").is_none() && io::stderr().is_terminal();
    let subscriber = fmt::fmt()
        .with_env_filter(filter)
        .with_ansi(use_ansi)
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn trace_encoding(args: &Args) -> TraceEncoding {
    if args.disasm || args.disassemble_only {
        TraceEncoding::Disasm
    } else if args.hex {
        TraceEncoding::Hex
    } else {
        TraceEncoding::Binary
    }
}

fn open_trace(args: &Args) -> Result<Option<TraceWriter>> {
    if args.disassemble_only {
        let stdout = TraceWriter::new(io::stdout(), TraceEncoding::Disasm).with_address(true);
        return Ok(Some(stdout));
    }
    let Some(path) = &args.trace else {
        return Ok(None);
    };
    let trace = TraceWriter::create(path, trace_encoding(args))
        .with_context(|| format!("failed to open tracefile `{}'", path.display()))?;
    Ok(Some(trace))
}

fn load_machine(args: &Args, mode: ExecMode) -> Result<Machine> {
    let mut machine = Machine::new(mode);
    if args.restore {
        let snapshot = load_snapshot(&args.image)
            .with_context(|| format!("couldn't read restore file {}", args.image.display()))?;
        machine.restore(snapshot);
        println!("Loaded save file successfully.");
    } else {
        let blob = fs::read(&args.image)
            .with_context(|| format!("couldn't read image {}", args.image.display()))?;
        let words = machine.state_mut().load_image(&blob)?;
        println!("Loaded {words} words from image.");
    }
    if mode == ExecMode::Disassemble {
        machine.state_mut().pc = 0;
    }
    Ok(machine)
}

fn exit_code(err: &CoreError) -> i32 {
    if err.is_guest_fault() {
        1
    } else if err.is_internal() {
        3
    } else {
        2
    }
}

fn run(args: &Args) -> Result<i32> {
    let mode = if args.disassemble_only {
        ExecMode::Disassemble
    } else {
        ExecMode::Execute
    };
    let machine = load_machine(args, mode)?;
    let config = RunConfig {
        r7: args.r7,
        insn_limit: args.limit,
        mode,
        replay_limit: args.replay_limit,
        snapshot_path: args.snapshot_path.clone(),
    };
    let console = StreamConsole::new(io::stdin().lock(), io::stdout());
    let mut session = Session::new(machine, console, config)
        .with_signals(HostSignals::install().context("failed to install signal handlers")?);
    if let Some(trace) = open_trace(args)? {
        session = session.with_trace(trace);
    }
    if let Some(path) = &args.replay {
        let recorder = InputRecorder::load(path)
            .with_context(|| format!("couldn't read input log {}", path.display()))?;
        session = session.with_replay(recorder);
    }

    println!("{}", session.initial_report());
    let code = match session.run() {
        Ok(StopReason::Halted) => {
            println!("Got HALT, stopped.");
            0
        }
        Ok(StopReason::LimitReached) => {
            println!("\nXXX Hit insn limit, halting XXX");
            0
        }
        Ok(StopReason::Cancelled) => {
            println!("Got ^C, stopping...");
            130
        }
        Err(CoreError::Fault(fault)) => {
            println!("{fault}");
            1
        }
        Err(err) => {
            eprintln!("fatal: {err}");
            exit_code(&err)
        }
    };
    println!("{}", session.final_report());

    let code = match session.take_snapshot_failure() {
        Some(err) => {
            eprintln!("Failed to write {}: {err}", args.snapshot_path.display());
            if code == 0 {
                2
            } else {
                code
            }
        }
        None => code,
    };

    if let Some(path) = &args.record {
        session
            .recorder()
            .save(path)
            .with_context(|| format!("failed to write input log {}", path.display()))?;
    }
    Ok(code)
}

fn main() {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());
    let code = match run(&args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("fatal: {err:#}");
            err.downcast_ref::<CoreError>().map_or(2, exit_code)
        }
    };
    std::process::exit(code);
}
