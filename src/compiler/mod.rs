#[allow(clippy::module_inception)]
mod compiler;
pub mod lexer;

pub use compiler::compile;
pub use lexer::{Lexer, Token, TokenKind};

use std::fmt;
use std::fs;
use std::path::Path;

use crate::config::RuntimeConfig;
use crate::vm::{Chunk, VM};

/// An error raised during scanning or compilation, carrying the source
/// line of the offending token. A script with any compile error never
/// reaches the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub message: String,
    pub line: u32,
}

impl CompileError {
    pub fn new(message: impl Into<String>, line: u32) -> Self {
        Self {
            message: message.into(),
            line,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "compile error: {} [line {}]", self.message, self.line)
    }
}

impl std::error::Error for CompileError {}

/// Scan and compile a source string into one merged chunk, collecting
/// every error the single pass can report.
pub fn compile_source(source: &str) -> Result<Chunk, Vec<CompileError>> {
    let tokens = Lexer::new(source).scan_tokens().map_err(|e| vec![e])?;
    compile(tokens)
}

/// Format collected compile errors, one per line.
pub fn format_errors(errors: &[CompileError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Compile and run source text against a prepared VM.
pub fn run_source(vm: &mut VM, source: &str) -> Result<(), String> {
    let chunk = compile_source(source).map_err(|errors| format_errors(&errors))?;
    vm.run(&chunk).map_err(|e| e.to_string())
}

/// Compile and run a script file with the default natives registered.
pub fn run_file(path: &Path, config: &RuntimeConfig) -> Result<(), String> {
    let source =
        fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let mut vm = VM::new(config);
    crate::stdlib::register_default_natives(&mut vm).map_err(|e| e.to_string())?;
    let result = run_source(&mut vm, &source);
    if config.gc_stats {
        let stats = vm.gc_stats();
        eprintln!(
            "[GC] cycles: {}, slots reclaimed: {}",
            stats.cycles, stats.reclaimed
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_source_ok() {
        let chunk = compile_source("var x = 1 + 2;").unwrap();
        assert!(!chunk.code.is_empty());
    }

    #[test]
    fn test_compile_source_lex_error() {
        let errors = compile_source("var x = @;").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("unexpected character"));
    }

    #[test]
    fn test_format_errors_one_per_line() {
        let errors = compile_source("var 1;\nvar 2;").unwrap_err();
        let text = format_errors(&errors);
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("[line 1]"));
        assert!(text.contains("[line 2]"));
    }

    #[test]
    fn test_run_source_reports_runtime_error() {
        let mut vm = VM::new(&RuntimeConfig::default());
        let err = run_source(&mut vm, "1 / 0;").unwrap_err();
        assert!(err.contains("runtime error"));
        assert!(err.contains("division by zero"));
    }
}
