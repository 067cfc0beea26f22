//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Run-state document load, parse, or write failure.
    State(String),
    /// Advisory lock could not be acquired within its timeout.
    LockTimeout(String),
    /// Action ledger read or append failure.
    Ledger(String),
    /// Session driver spawn or communication failure.
    Driver(String),
    /// Host API invocation failure.
    Host(String),
    /// Plan input parsing or validation failure.
    Plan(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::State(msg) => write!(f, "state: {msg}"),
            Self::LockTimeout(msg) => write!(f, "lock timeout: {msg}"),
            Self::Ledger(msg) => write!(f, "ledger: {msg}"),
            Self::Driver(msg) => write!(f, "driver: {msg}"),
            Self::Host(msg) => write!(f, "host: {msg}"),
            Self::Plan(msg) => write!(f, "plan: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
