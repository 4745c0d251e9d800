use std::error;
use std::fmt;
use std::io;

use crate::topology::Face;

#[derive(Debug)]

/**
 * Error to represent a fatal configuration, communication-contract, or I/O
 * failure. Physical degeneracies (a bond breaking, two shapes that do not
 * overlap) are not errors and never show up here.
 */
pub enum Error {
    MissingParameter(String),
    InvalidParameter { key: String, value: String },
    Topology(String),
    RequestOutstanding { face: Face, iteration: usize },
    NoPendingRequest { face: Face, iteration: usize },
    PhaseOrder { from: &'static str, to: &'static str },
    Encode(String),
    Decode(String),
    Io { path: String, source: io::Error },
    ParticleCount { expected: usize, found: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn io<P: AsRef<std::path::Path>>(path: P, source: io::Error) -> Self {
        Error::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;

        match self {
            MissingParameter(key) => write!(fmt, "missing required parameter: {}", key),
            InvalidParameter { key, value } => {
                write!(fmt, "invalid value for parameter {}: {}", key, value)
            }
            Topology(msg) => write!(fmt, "malformed process topology: {}", msg),
            RequestOutstanding { face, iteration } => write!(
                fmt,
                "exchange on face {:?} issued at iteration {} while a request is outstanding",
                face, iteration
            ),
            NoPendingRequest { face, iteration } => write!(
                fmt,
                "wait on face {:?} at iteration {} without an issued request",
                face, iteration
            ),
            PhaseOrder { from, to } => {
                write!(fmt, "patch cannot move from phase {} to {}", from, to)
            }
            Encode(msg) => write!(fmt, "failed to encode message: {}", msg),
            Decode(msg) => write!(fmt, "failed to decode message: {}", msg),
            Io { path, source } => write!(fmt, "{}: {}", path, source),
            ParticleCount { expected, found } => write!(
                fmt,
                "particle count mismatch: expected {}, found {}",
                expected, found
            ),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
