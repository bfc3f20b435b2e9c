// src/main.rs

// lox: run a script file, or start an interactive session.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser as ClapParser;
use tracing_subscriber::EnvFilter;

use lox_vm::{InterpretResult, Vm, VmConfig};

// Status for a script file that cannot be read.
const EXIT_IO_ERROR: u8 = 74;

#[derive(ClapParser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// The script file to run. If not provided, launches the REPL.
    file: Option<PathBuf>,

    /// Collect garbage before every allocation.
    #[arg(long)]
    gc_stress: bool,

    /// Log every executed instruction (shown with RUST_LOG=trace).
    #[arg(long)]
    trace: bool,

    /// Bytes allocated before the first collection.
    #[arg(long, value_name = "BYTES")]
    gc_threshold: Option<usize>,
}

impl Cli {
    fn config(&self) -> VmConfig {
        let mut config = VmConfig::default()
            .with_gc_stress(self.gc_stress)
            .with_trace_execution(self.trace);
        if let Some(bytes) = self.gc_threshold {
            config = config.with_gc_threshold(bytes);
        }
        config
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut vm = Vm::new(cli.config());

    let code = match &cli.file {
        Some(path) => run_script(&mut vm, path),
        None => repl(&mut vm),
    };
    vm.teardown();
    code
}

/// Runs the interpreter on a given script file.
fn run_script(vm: &mut Vm, path: &Path) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Could not read file \"{}\": {}", path.display(), e);
            return ExitCode::from(EXIT_IO_ERROR);
        }
    };
    exit_code(vm.interpret(&source))
}

// Each line is compiled and run on its own; globals carry over between lines.
fn repl(vm: &mut Vm) -> ExitCode {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        if io::stdout().flush().is_err() {
            return ExitCode::from(EXIT_IO_ERROR);
        }
        let line = match lines.next() {
            Some(Ok(line)) => line,
            Some(Err(_)) => return ExitCode::from(EXIT_IO_ERROR),
            None => {
                println!();
                return ExitCode::SUCCESS;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match vm.interpret(&line) {
            result @ (InterpretResult::ExitOk | InterpretResult::Exit(_)) => return exit_code(result),
            // Errors were already reported; keep the session going.
            InterpretResult::Ok | InterpretResult::CompileError | InterpretResult::RuntimeError => {}
        }
    }
}

// Process statuses are a byte; exit(-1) ends up as 255 like in a shell.
// A nonzero code that wraps to 0 (exit(256)) must not read as success.
fn exit_code(result: InterpretResult) -> ExitCode {
    ExitCode::from(process_status(result.exit_code()))
}

fn process_status(code: i32) -> u8 {
    match code as u8 {
        0 if code != 0 => 1,
        status => status,
    }
}
