use std::io;

use thiserror::Error;

use crate::race_clock::ClockState;

/// Errors surfaced by the timing core.
#[derive(Debug, Error)]
pub enum Error {
    /// The serial link could not be opened or failed while polling.
    #[error("serial link {port} failed: {source}")]
    Connection {
        port: String,
        #[source]
        source: io::Error,
    },

    /// Invalid construction parameters, e.g. overlapping sensor bits.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A transition was requested on a clock that no longer accepts one.
    #[error("cannot {op} a {state:?} clock")]
    State { op: &'static str, state: ClockState },
}

impl Error {
    pub fn connection(port: impl Into<String>, source: impl Into<io::Error>) -> Self {
        Self::Connection {
            port: port.into(),
            source: source.into(),
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
