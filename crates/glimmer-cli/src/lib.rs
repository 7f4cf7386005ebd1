//! `glimmer` subcommands: `run` a script, `repl`, or `disasm` its compiled
//! chunks. Kept separate from `main.rs` so the command logic is unit
//! testable without going through a real process.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Context, Result};
use glimmer_core::chunk::disassemble_chunk;
use glimmer_core::object::{Handle, Heap};
use glimmer_vm::{DefaultHost, InterpretResult, Vm, VmOptions};

#[derive(Parser, Debug)]
#[command(name = "glimmer", version, about = "Glimmer language tool")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run a script file.
    Run {
        file: PathBuf,
        /// Print each instruction as it executes.
        #[arg(long)]
        trace: bool,
    },
    /// Start an interactive read-eval-print loop.
    Repl {
        #[arg(long)]
        trace: bool,
    },
    /// Compile a script and print its disassembled bytecode.
    Disasm { file: PathBuf },
}

/// The exit codes clox itself uses (`main.c`, following BSD sysexits.h).
mod exit_code {
    pub const DATA_ERROR: i32 = 65;
    pub const SOFTWARE_ERROR: i32 = 70;
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Run { file, trace } => cmd_run(file, trace),
        Cmd::Repl { trace } => cmd_repl(trace),
        Cmd::Disasm { file } => cmd_disasm(file),
    }
}

fn cmd_run(file: PathBuf, trace: bool) -> Result<()> {
    let source = std::fs::read_to_string(&file)
        .with_context(|| format!("reading {}", file.display()))?;
    let options = VmOptions { trace_execution: trace, ..VmOptions::default() };
    let mut vm: Vm<DefaultHost> = Vm::new(options);
    match vm.interpret(&source) {
        InterpretResult::Ok => Ok(()),
        InterpretResult::CompileError => std::process::exit(exit_code::DATA_ERROR),
        InterpretResult::RuntimeError => std::process::exit(exit_code::SOFTWARE_ERROR),
    }
}

fn cmd_repl(trace: bool) -> Result<()> {
    let options = VmOptions { trace_execution: trace, ..VmOptions::default() };
    let mut vm: Vm<DefaultHost> = Vm::new(options);
    let mut editor = rustyline::DefaultEditor::new()?;
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                vm.interpret(&line);
            }
            Err(rustyline::error::ReadlineError::Eof | rustyline::error::ReadlineError::Interrupted) => break,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn cmd_disasm(file: PathBuf) -> Result<()> {
    let source = std::fs::read_to_string(&file)
        .with_context(|| format!("reading {}", file.display()))?;
    let mut heap = Heap::new();
    let mut extra = glimmer_compiler::NoExtraRoots;
    let (function, diagnostics) = glimmer_compiler::compile(&source, &mut heap, &mut extra);
    let Some(function) = function else {
        diagnostics.report_to_stderr();
        std::process::exit(exit_code::DATA_ERROR);
    };
    let title = file.file_name().and_then(|n| n.to_str()).unwrap_or("script");
    print_chunk_recursive(&heap, function, title);
    Ok(())
}

fn print_chunk_recursive(heap: &Heap, function: Handle, title: &str) {
    let obj = heap.get(function).as_function().expect("function constant");
    println!("{}", disassemble_chunk(&obj.chunk, title, heap));
    for constant in obj.chunk.constants() {
        if let Some(nested) = constant.as_object() {
            if let Some(nested_fn) = heap.get(nested).as_function() {
                let name = nested_fn
                    .name
                    .map(|n| heap.get(n).as_string().unwrap().chars.to_string())
                    .unwrap_or_else(|| "<anonymous>".to_string());
                print_chunk_recursive(heap, nested, &name);
            }
        }
    }
}
