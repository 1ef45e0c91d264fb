// File: src/main.rs
//
// Command-line entry point for the Pluto language.
// `pluto run file.pluto` compiles and executes a script; `pluto repl`
// starts the interactive shell.

mod ast;
mod builtins;
mod bytecode;
mod compiler;
mod errors;
mod lexer;
mod module;
mod parser;
mod repl;
mod store;
mod value;
mod vm;

use clap::{Parser as ClapParser, Subcommand};
use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;

#[derive(ClapParser)]
#[command(
    name = "pluto",
    about = "Pluto: a pattern-dispatched scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Run a Pluto script file
    Run {
        /// Path to the .pluto file
        file: PathBuf,

        /// Dump the parse tree and the decoded bytecode
        #[arg(long)]
        tree: bool,

        /// Parse and compile only, without executing
        #[arg(long)]
        no_eval: bool,

        /// Skip importing the standard prelude packages
        #[arg(long)]
        no_prelude: bool,

        /// Disable colored output
        #[arg(long)]
        no_color: bool,

        /// Drop into the REPL after the file, keeping its scope
        #[arg(short, long)]
        interactive: bool,
    },

    /// Launch the interactive Pluto shell
    Repl {
        /// Disable colored output
        #[arg(long)]
        no_color: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, tree, no_eval, no_prelude, no_color, interactive } => {
            if no_color {
                colored::control::set_override(false);
            }

            run_file(&file, tree, no_eval, no_prelude, interactive)
        }

        Commands::Repl { no_color } => {
            if no_color {
                colored::control::set_override(false);
            }

            match repl::Repl::new() {
                Ok(mut repl) => match repl.run() {
                    Ok(()) => ExitCode::SUCCESS,
                    Err(err) => {
                        eprintln!("repl error: {}", err);
                        ExitCode::FAILURE
                    }
                },
                Err(err) => {
                    eprintln!("failed to start the repl: {}", err);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn run_file(
    file: &PathBuf,
    tree: bool,
    no_eval: bool,
    no_prelude: bool,
    interactive: bool,
) -> ExitCode {
    let source = match fs::read_to_string(file) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("failed to read {}: {}", file.display(), err);
            return ExitCode::FAILURE;
        }
    };

    let filename = file.to_string_lossy().to_string();
    let tokens = lexer::tokenize(&source);
    let mut parser = parser::Parser::new(tokens).with_file(filename);
    let program = parser.parse();

    if !parser.errors.is_empty() {
        for error in &parser.errors {
            eprintln!("{}", error);
        }
        return ExitCode::FAILURE;
    }

    if tree {
        println!("{:#?}", program);
    }

    let mut compiler = compiler::Compiler::new();

    if let Err(error) = compiler.compile_program(&program) {
        eprintln!("{}", error);
        return ExitCode::FAILURE;
    }

    let code = match bytecode::read(&compiler.bytes) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("{}", error);
            return ExitCode::FAILURE;
        }
    };

    if tree {
        print!("{}", bytecode::disassemble(&code));
    }

    if no_eval {
        return ExitCode::SUCCESS;
    }

    let store = Rc::new(RefCell::new(store::Store::new()));
    compiler.install(&mut store.borrow_mut());

    let mut machine = vm::Vm::new();
    machine.run(Rc::new(code), Rc::clone(&store), Rc::new(compiler.constants), !no_prelude);

    if let Some(error) = machine.error {
        eprintln!("{}", error);
        return ExitCode::FAILURE;
    }

    if interactive {
        match repl::Repl::with_store(store) {
            Ok(mut repl) => {
                if let Err(err) = repl.run() {
                    eprintln!("repl error: {}", err);
                    return ExitCode::FAILURE;
                }
            }
            Err(err) => {
                eprintln!("failed to start the repl: {}", err);
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}
