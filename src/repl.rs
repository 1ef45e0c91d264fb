// File: src/repl.rs
//
// Interactive REPL for the Pluto language.
// Keeps one store alive across inputs so definitions persist, buffers
// multi-line input until braces balance, and echoes the value left on
// the stack after each evaluation.

use crate::compiler::Compiler;
use crate::lexer::tokenize;
use crate::parser::Parser;
use crate::store::Store;
use crate::vm::{ImportCache, Vm};
use crate::bytecode;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::cell::RefCell;
use std::rc::Rc;

/// REPL session holding the persistent store and import cache
pub struct Repl {
    editor: DefaultEditor,
    store: Rc<RefCell<Store>>,
    imports: Rc<RefCell<ImportCache>>,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Self::with_store(Rc::new(RefCell::new(Store::new())))
    }

    /// A REPL continuing from an existing store — used by
    /// `pluto run --interactive`
    pub fn with_store(store: Rc<RefCell<Store>>) -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { editor, store, imports: Rc::new(RefCell::new(ImportCache::default())) })
    }

    fn show_banner(&self) {
        println!("{}", format!("Pluto {} — interactive shell", env!("CARGO_PKG_VERSION")).cyan());
        println!("  type {} for commands, {} to leave", ":help".yellow(), ":quit".yellow());
        println!();
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();

        let mut buffer = String::new();

        loop {
            let prompt = if buffer.is_empty() {
                "pluto> ".green().to_string()
            } else {
                "  ...> ".blue().to_string()
            };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if buffer.is_empty() && line.trim_start().starts_with(':') {
                        if !self.handle_command(line.trim()) {
                            break;
                        }
                        continue;
                    }

                    buffer.push_str(&line);
                    buffer.push('\n');

                    if input_complete(&buffer) {
                        self.eval_input(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    break;
                }
                Err(err) => {
                    eprintln!("{} {}", "error:".red(), err);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Returns false when the REPL should exit
    fn handle_command(&mut self, command: &str) -> bool {
        match command {
            ":help" | ":h" => {
                println!("  {}  show this help", ":help".yellow());
                println!("  {} list the bindings in scope", ":names".yellow());
                println!("  {}  leave the shell", ":quit".yellow());
                true
            }
            ":names" => {
                for binding in &self.store.borrow().data {
                    println!("  {} = {}", binding.name, binding.value);
                }
                true
            }
            ":quit" | ":q" | ":exit" => false,
            other => {
                println!("unknown command {}; try {}", other.red(), ":help".yellow());
                true
            }
        }
    }

    fn eval_input(&mut self, source: &str) {
        let mut parser = Parser::new(tokenize(source));
        let program = parser.parse();

        if !parser.errors.is_empty() {
            for error in &parser.errors {
                eprintln!("{}", error);
            }
            return;
        }

        let mut compiler = Compiler::new();

        if let Err(error) = compiler.compile_program(&program) {
            eprintln!("{}", error);
            return;
        }

        let code = match bytecode::read(&compiler.bytes) {
            Ok(code) => code,
            Err(error) => {
                eprintln!("{}", error);
                return;
            }
        };

        compiler.install(&mut self.store.borrow_mut());

        let mut vm = Vm::with_imports(Rc::clone(&self.imports));
        vm.run(
            Rc::new(code),
            Rc::clone(&self.store),
            Rc::new(compiler.constants),
            false,
        );

        if let Some(error) = vm.error {
            eprintln!("  {}", error);
        } else if let Some(value) = vm.extract_value() {
            println!("  {}", format!("{}", value).cyan());
        }
    }
}

/// Input is complete when every brace, bracket, and paren is balanced
/// outside of string and char literals
fn input_complete(source: &str) -> bool {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut in_char = false;
    let mut escaped = false;

    for c in source.chars() {
        if escaped {
            escaped = false;
            continue;
        }

        match c {
            '\\' if in_string || in_char => escaped = true,
            '"' if !in_char => in_string = !in_string,
            '\'' if !in_string => in_char = !in_char,
            '{' | '(' | '[' if !in_string && !in_char => depth += 1,
            '}' | ')' | ']' if !in_string && !in_char => depth -= 1,
            _ => {}
        }
    }

    depth <= 0 && !in_string
}
