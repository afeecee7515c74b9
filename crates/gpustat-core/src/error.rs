use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Row-level failure inside `nvidia-smi` output. Never escapes the parser:
/// offending rows are skipped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("expected at least {expected} fields, found {found}")]
    TooFewFields { expected: usize, found: usize },

    #[error("invalid number in field '{field}': '{value}'")]
    InvalidNumber { field: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
