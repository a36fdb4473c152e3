use std::path::PathBuf;
use std::{env, fmt};

#[derive(Debug, Clone)]
enum Setting {
    Disassemble,
    Unknown(String),
}

const DISASSEMBLE: &str = "--disassemble";

impl From<String> for Setting {
    fn from(value: String) -> Self {
        match value.as_str() {
            DISASSEMBLE => Self::Disassemble,
            other => Self::Unknown(other.to_owned()),
        }
    }
}

#[derive(Debug, Clone)]
enum Token {
    Setting(Setting),
    Path(PathBuf),
}

fn lex(iter: env::Args) -> Vec<Token> {
    iter.skip(1)
        .map(|arg| {
            if let Some(rest) = arg.strip_prefix("--") {
                Token::Setting(Setting::from(format!("--{rest}")))
            } else {
                Token::Path(PathBuf::from(arg))
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub enum Action {
    Repl,
    RunFile { path: PathBuf, disassemble: bool },
}

#[derive(Debug, Clone)]
pub enum ArgsError {
    UnknownOption(String),
    TooManyFiles(usize),
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOption(opt) => write!(f, "unknown option '{opt}'"),
            Self::TooManyFiles(n) => write!(f, "expected at most one file argument, got {n}"),
        }
    }
}

/// Parses `env::args()` into an `Action` per spec.md §6: no path arguments
/// starts the REPL, one starts that file, more than one is a usage error.
pub fn get_action() -> Result<Action, ArgsError> {
    let tokens = lex(env::args());
    let mut disassemble = false;
    let mut paths = Vec::new();
    for token in tokens {
        match token {
            Token::Setting(Setting::Disassemble) => disassemble = true,
            Token::Setting(Setting::Unknown(opt)) => return Err(ArgsError::UnknownOption(opt)),
            Token::Path(path) => paths.push(path),
        }
    }
    match paths.len() {
        0 => Ok(Action::Repl),
        1 => Ok(Action::RunFile {
            path: paths.remove(0),
            disassemble,
        }),
        n => Err(ArgsError::TooManyFiles(n)),
    }
}
