//! Reed language runtime entry point.
//!
//! Behavior summary:
//! - With **no args**, start an interactive REPL.
//! - With `-h/--help`, print usage.
//! - With `-v/--version`, print version.
//! - With `--trace`, enable opcode tracing to stderr for whichever mode
//!   follows (REPL or file run).
//! - With a script path, compile and run it.
//!
//! Exit codes follow the conventional sysexits subset this interpreter
//! uses: `0` success, `64` usage error, `65` compile error, `70` runtime
//! error, `74` file open error.

use std::env;
use std::fs;
use std::io;
use std::process::ExitCode;

use reed::error::InterpretResult;
use reed::repl;
use reed::vm::Vm;

const VERSION: &str = "0.1.0";

const EX_USAGE: u8 = 64;
const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;
const EX_NOINPUT: u8 = 74;

fn usage() -> String {
    format!(
        r#"reed v{0}

Usage:
    reed [options] [script]

Arguments:
    <script>
        Path to a reed source file to compile and run. If omitted, starts
        an interactive REPL.

Options:
    -h, --help
        Show this help message and exit.
    -v, --version
        Show the runtime version.
    --trace
        Print each executed instruction and the operand stack to stderr."#,
        VERSION
    )
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    let mut trace = false;
    let mut script: Option<String> = None;

    for arg in &args[1..] {
        match arg.as_str() {
            "-h" | "--help" => {
                println!("{}", usage());
                return ExitCode::SUCCESS;
            }
            "-v" | "--version" => {
                println!("reed {}", VERSION);
                return ExitCode::SUCCESS;
            }
            "--trace" => trace = true,
            other if script.is_none() => script = Some(other.to_string()),
            other => {
                eprintln!("reed: unexpected argument '{}'", other);
                eprintln!("{}", usage());
                return ExitCode::from(EX_USAGE);
            }
        }
    }

    match script {
        None => {
            repl::run(trace);
            ExitCode::SUCCESS
        }
        Some(path) => run_file(&path, trace),
    }
}

fn run_file(path: &str, trace: bool) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("reed: can't open file '{}': {}", path, e);
            return ExitCode::from(EX_NOINPUT);
        }
    };

    let stdout = io::stdout();
    let mut vm = Vm::new(stdout.lock()).with_trace(trace);
    match vm.interpret(&source) {
        InterpretResult::Ok => ExitCode::SUCCESS,
        InterpretResult::CompileError => ExitCode::from(EX_DATAERR),
        InterpretResult::RuntimeError => ExitCode::from(EX_SOFTWARE),
    }
}
