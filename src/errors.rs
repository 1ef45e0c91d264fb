// File: src/errors.rs
//
// Error handling and reporting for the Pluto language.
// Covers the whole pipeline: lexing/parsing, compilation, and the
// runtime error kinds captured by the virtual machine.

use colored::Colorize;
use std::fmt;

/// Source location information for tracking where code appears in a file
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
    pub file: Option<String>,
}

impl SourceLocation {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column, file: None }
    }

    pub fn unknown() -> Self {
        Self { line: 0, column: 0, file: None }
    }

    pub fn with_file(mut self, file: String) -> Self {
        self.file = Some(file);
        self
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(ref file) = self.file {
            write!(f, "{}:{}:{}", file, self.line, self.column)
        } else {
            write!(f, "{}:{}", self.line, self.column)
        }
    }
}

/// Every kind of error Pluto can produce.
///
/// The first two arise before the VM runs; the rest are the runtime
/// kinds written to `vm.error` by instruction effectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Tokenizer or parser rejected the source
    ParseError,
    /// The compiler could not lower an AST node
    CompileError,
    /// Invariant violation inside the VM itself
    Internal,
    /// Name, function pattern, or method not resolvable
    NotFound,
    /// Operator applied to an unsupported type combination
    WrongType,
    /// Operator recognized but not defined for these operands
    NoOp,
    /// Structural constraint the compiler did not catch (e.g. stray break)
    Syntax,
    /// Opcode dispatched with no effector
    NoInstruction,
    /// Wrapped I/O or filesystem failure during `use`
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorKind::ParseError => "Parse Error",
            ErrorKind::CompileError => "Compile Error",
            ErrorKind::Internal => "Internal",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::WrongType => "WrongType",
            ErrorKind::NoOp => "NoOp",
            ErrorKind::Syntax => "Syntax",
            ErrorKind::NoInstruction => "NoInstruction",
            ErrorKind::Unknown => "Unknown",
        };
        write!(f, "{}", name)
    }
}

/// A structured error with optional location and context
#[derive(Debug, Clone)]
pub struct PlutoError {
    pub kind: ErrorKind,
    pub message: String,
    pub location: Option<SourceLocation>,
    pub suggestion: Option<String>,
}

impl PlutoError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), location: None, suggestion: None }
    }

    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_suggestion(mut self, suggestion: String) -> Self {
        self.suggestion = Some(suggestion);
        self
    }

    pub fn parse(message: impl Into<String>, location: SourceLocation) -> Self {
        Self::new(ErrorKind::ParseError, message).at(location)
    }

    pub fn compile(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CompileError, message)
    }
}

impl fmt::Display for PlutoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind_str = format!("{}", self.kind);
        write!(f, "{}: {}", kind_str.red().bold(), self.message.bold())?;

        if let Some(ref location) = self.location {
            let location_str = format!("\n  --> {}", location);
            write!(f, "{}", location_str.bright_blue())?;
        }

        if let Some(ref suggestion) = self.suggestion {
            write!(
                f,
                "\n   {} {}",
                "=".bright_green(),
                format!("did you mean '{}'?", suggestion).bright_green()
            )?;
        }

        Ok(())
    }
}

impl std::error::Error for PlutoError {}

/// Edit distance between two strings, computed with two rolling rows.
/// Used for "did you mean?" suggestions on unresolved names.
pub fn levenshtein_distance(from: &str, to: &str) -> usize {
    let target: Vec<char> = to.chars().collect();

    // previous[j] is the distance from the prefix of `from` seen so far
    // to the first j characters of `to`
    let mut previous: Vec<usize> = (0..=target.len()).collect();
    let mut current = vec![0; target.len() + 1];

    for (i, source_char) in from.chars().enumerate() {
        current[0] = i + 1;

        for (j, target_char) in target.iter().enumerate() {
            let replace = previous[j] + usize::from(source_char != *target_char);
            let delete = previous[j + 1] + 1;
            let insert = current[j] + 1;

            current[j + 1] = replace.min(delete).min(insert);
        }

        std::mem::swap(&mut previous, &mut current);
    }

    previous[target.len()]
}

/// Find the closest match from a list of candidates.
/// Returns None if no candidate is within distance 3.
pub fn find_closest_match<'a>(target: &str, candidates: &'a [String]) -> Option<&'a str> {
    candidates
        .iter()
        .map(|candidate| (levenshtein_distance(target, candidate), candidate.as_str()))
        .filter(|&(distance, _)| distance <= 3)
        .min_by_key(|&(distance, _)| distance)
        .map(|(_, candidate)| candidate)
}
