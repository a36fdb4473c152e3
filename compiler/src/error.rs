use std::fmt;

use colored::Colorize;
use lexer::Token;

/// A single accumulated compile-time diagnostic. The compiler keeps parsing
/// after the first one (suppressing cascades via its panic flag) so a
/// source file can be reported against in one pass.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: u32,
    pub message: String,
}

impl CompileError {
    pub fn at(token: &Token, message: impl Into<String>) -> Self {
        Self {
            line: token.line,
            message: message.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            format!("[line {}] Error:", self.line).red(),
            self.message
        )
    }
}

impl std::error::Error for CompileError {}

/// One call frame's contribution to a runtime stack trace: the function
/// name (`None` for the top-level script) and the source line active when
/// the error was raised.
#[derive(Debug, Clone)]
pub struct BacktraceFrame {
    pub name: Option<String>,
    pub line: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Backtrace {
    frames: Vec<BacktraceFrame>,
}

impl Backtrace {
    pub fn push(&mut self, name: Option<String>, line: u32) {
        self.frames.push(BacktraceFrame { name, line });
    }
}

impl fmt::Display for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in self.frames.iter().rev() {
            match &frame.name {
                Some(name) => writeln!(f, "[line {}] in {name}()", frame.line)?,
                None => writeln!(f, "[line {}] in script", frame.line)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum RuntimeError {
    TypeMismatch {
        expected: &'static str,
        got: &'static str,
        line: u32,
        backtrace: Backtrace,
    },
    UndefinedVariable {
        name: String,
        line: u32,
        backtrace: Backtrace,
    },
    NotAnInstance {
        line: u32,
        backtrace: Backtrace,
    },
    UndefinedProperty {
        name: String,
        line: u32,
        backtrace: Backtrace,
    },
    NotCallable {
        line: u32,
        backtrace: Backtrace,
    },
    ArityMismatch {
        expected: u8,
        got: usize,
        line: u32,
        backtrace: Backtrace,
    },
    StackOverflow {
        line: u32,
        backtrace: Backtrace,
    },
    SuperclassNotAClass {
        line: u32,
        backtrace: Backtrace,
    },
    /// Surfaces an `Err(String)` returned by a native function call; not
    /// named in spec.md's taxonomy (§7 only enumerates errors the VM itself
    /// raises) but natives need a way to report their own failures.
    Native {
        message: String,
        line: u32,
        backtrace: Backtrace,
    },
}

impl RuntimeError {
    pub fn message(&self) -> String {
        match self {
            Self::TypeMismatch { expected, got, .. } => {
                format!("expected {expected}, got {got}")
            }
            Self::UndefinedVariable { name, .. } => format!("undefined variable '{name}'"),
            Self::NotAnInstance { .. } => "only instances have properties".to_string(),
            Self::UndefinedProperty { name, .. } => format!("undefined property '{name}'"),
            Self::NotCallable { .. } => "can only call functions, methods, or classes".to_string(),
            Self::ArityMismatch { expected, got, .. } => {
                format!("expected {expected} arguments but got {got}")
            }
            Self::StackOverflow { .. } => "stack overflow".to_string(),
            Self::SuperclassNotAClass { .. } => "superclass must be a class".to_string(),
            Self::Native { message, .. } => message.clone(),
        }
    }

    pub fn backtrace(&self) -> &Backtrace {
        match self {
            Self::TypeMismatch { backtrace, .. }
            | Self::UndefinedVariable { backtrace, .. }
            | Self::NotAnInstance { backtrace, .. }
            | Self::UndefinedProperty { backtrace, .. }
            | Self::NotCallable { backtrace, .. }
            | Self::ArityMismatch { backtrace, .. }
            | Self::StackOverflow { backtrace, .. }
            | Self::SuperclassNotAClass { backtrace, .. }
            | Self::Native { backtrace, .. } => backtrace,
        }
    }

    pub fn line(&self) -> u32 {
        match self {
            Self::TypeMismatch { line, .. }
            | Self::UndefinedVariable { line, .. }
            | Self::NotAnInstance { line, .. }
            | Self::UndefinedProperty { line, .. }
            | Self::NotCallable { line, .. }
            | Self::ArityMismatch { line, .. }
            | Self::StackOverflow { line, .. }
            | Self::SuperclassNotAClass { line, .. }
            | Self::Native { line, .. } => *line,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {}",
            format!("[line {}] Runtime error:", self.line()).red(),
            self.message()
        )?;
        write!(f, "{}", self.backtrace())
    }
}

impl std::error::Error for RuntimeError {}
