//! # Interactive REPL
//!
//! Reads one balanced block of source at a time — tracking brace depth so
//! multi-line `fun`/`class`/`if`/`while` bodies can be typed across several
//! lines before anything runs — and interprets it immediately.
//!
//! Unlike the teacher's REPL, which spawned a subprocess per line against
//! a temp file to keep parity with its bytecode-file execution path, this
//! REPL runs entirely in-process: a fresh [`Vm`] is cheap to build here and
//! there's no separate bytecode artifact to shell out to. Each block gets
//! its own fresh `Vm`, so globals don't persist from one block to the
//! next — acceptable for an interactive scratchpad, and far simpler than
//! threading shared state through the brace-tracking loop below.

use std::io::{self, Write};

use crate::vm::Vm;

/// Runs the REPL until EOF (Ctrl+D) or the user types `exit`/`quit`.
pub fn run(trace: bool) {
    println!("reed — type `exit` or `quit` to leave.");

    let mut buffer: Vec<String> = Vec::new();
    let mut brace_depth: i32 = 0;

    loop {
        let prompt = if buffer.is_empty() { "> " } else { "... " };
        print!("{}", prompt);
        io::stdout().flush().expect("flush stdout");

        let mut line = String::new();
        if io::stdin().read_line(&mut line).expect("read stdin") == 0 {
            println!();
            break;
        }

        let trimmed = line.trim();
        if buffer.is_empty() && (trimmed == "exit" || trimmed == "quit") {
            break;
        }

        brace_depth += count_braces(&line);
        buffer.push(line);

        if brace_depth > 0 {
            continue;
        }

        let block = buffer.join("");
        buffer.clear();
        brace_depth = 0;

        if block.trim().is_empty() {
            continue;
        }

        let stdout = io::stdout();
        let mut vm = Vm::new(stdout.lock()).with_trace(trace);
        vm.interpret(&block);
    }
}

/// Counts `{`/`}` net depth for one line, ignoring braces inside string
/// literals and escaped characters, so a block like `fun f() { "{" }` isn't
/// mistaken for unbalanced input.
fn count_braces(line: &str) -> i32 {
    let mut depth = 0;
    let mut string_char: Option<char> = None;
    let mut escape = false;
    for ch in line.chars() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' => escape = true,
            '"' | '\'' => {
                if string_char == Some(ch) {
                    string_char = None;
                } else if string_char.is_none() {
                    string_char = Some(ch);
                }
            }
            '{' if string_char.is_none() => depth += 1,
            '}' if string_char.is_none() => depth -= 1,
            _ => {}
        }
    }
    depth
}
