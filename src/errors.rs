// File: src/errors.rs
//
// Structured diagnostics for both compile-time and run-time failures.
// Mirrors clox's three-way `InterpretResult` split (ok / compile error /
// runtime error), which is what main.rs maps onto process exit codes.

use colored::Colorize;
use std::fmt;

/// One syntax error, anchored to the token the parser was looking at when
/// it gave up. `lexeme` is `None` for a scanner-level error token (the
/// diagnostic message itself lives in `message` already).
#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: usize,
    pub lexeme: Option<String>,
    pub at_eof: bool,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let where_str = if self.at_eof {
            " at end".to_string()
        } else if let Some(lexeme) = &self.lexeme {
            format!(" at '{lexeme}'")
        } else {
            String::new()
        };
        write!(
            f,
            "{} {}",
            format!("[line {}] Error{}:", self.line, where_str).red().bold(),
            self.message
        )
    }
}

impl std::error::Error for CompileError {}

/// A failure the VM hit while executing already-compiled bytecode: a type
/// mismatch, an undefined global, an arity mismatch, a stack overflow.
/// `stack_trace` is innermost-frame-first, matching the order clox prints
/// its `runtimeError` call stack in.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub line: usize,
    pub stack_trace: Vec<String>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, line: usize) -> Self {
        Self { message: message.into(), line, stack_trace: Vec::new() }
    }

    pub fn with_stack_trace(mut self, stack_trace: Vec<String>) -> Self {
        self.stack_trace = stack_trace;
        self
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message.red().bold())?;
        for frame in &self.stack_trace {
            writeln!(f, "{}", frame.bright_blue())?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// What a source-to-result interpretation attempt ended in. `Ok` carries no
/// payload because `print` statements do their own output as they execute;
/// a script's "result" is its side effects, not a return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

impl InterpretResult {
    /// Process exit code, per the CLI contract: 0 clean, 65 a compile-time
    /// (syntax) error, 70 a run-time error.
    pub fn exit_code(&self) -> i32 {
        match self {
            InterpretResult::Ok => 0,
            InterpretResult::CompileError => 65,
            InterpretResult::RuntimeError => 70,
        }
    }
}

/// Levenshtein edit distance, used to power "did you mean ...?" suggestions
/// on undefined-global errors.
pub fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let len1 = s1.chars().count();
    let len2 = s2.chars().count();

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    let mut matrix = vec![vec![0; len2 + 1]; len1 + 1];
    for (i, row) in matrix.iter_mut().enumerate().take(len1 + 1) {
        row[0] = i;
    }
    for j in 0..=len2 {
        matrix[0][j] = j;
    }

    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();

    for i in 1..=len1 {
        for j in 1..=len2 {
            let cost = if s1_chars[i - 1] == s2_chars[j - 1] { 0 } else { 1 };
            matrix[i][j] = std::cmp::min(
                std::cmp::min(matrix[i - 1][j] + 1, matrix[i][j - 1] + 1),
                matrix[i - 1][j - 1] + cost,
            );
        }
    }

    matrix[len1][len2]
}

/// Finds the closest candidate to `target`, if any is within edit distance 3.
pub fn find_closest_match<'a>(target: &str, candidates: &'a [String]) -> Option<&'a str> {
    let mut best_match = None;
    let mut best_distance = usize::MAX;

    for candidate in candidates {
        let distance = levenshtein_distance(target, candidate);
        if distance <= 3 && distance < best_distance {
            best_distance = distance;
            best_match = Some(candidate.as_str());
        }
    }

    best_match
}
