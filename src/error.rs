use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Cinder errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// On-disk index corruption that cannot be skipped: a corrupt entry on a
    /// block boundary, or more corrupt entries than the configured maximum.
    /// The base must be repaired offline before it can be indexed again.
    Corrupt(String),
    /// A lookup kept racing against base invalidation and exceeded its retry
    /// budget. Indicates pathological base churn.
    Deadlock,
    /// Invalid data, typically decoding errors or unexpected internal values.
    InvalidData(String),
    /// An IO error.
    IO(String),
    /// An allocation for the block table or bloom filter failed.
    NoMemory,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Corrupt(msg) => write!(f, "fatal index corruption: {msg}"),
            Error::Deadlock => write!(f, "lookup exceeded invalidation retry budget"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::NoMemory => write!(f, "allocation failure"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// A Cinder Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
