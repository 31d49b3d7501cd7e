use std::{error::Error as StdError, fmt, io};

/// Errors produced while leasing a connection from the pool.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The lease deadline or the connect timeout elapsed.
    Timeout,
    /// Address resolution or connection construction failed.
    Io(io::Error),
    /// The lease or its pending connect attempt was cancelled.
    Cancelled,
    /// The pool has been shut down.
    ShutDown,
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn is_shut_down(&self) -> bool {
        matches!(self, Error::ShutDown)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Timeout => f.write_str("lease timed out"),
            Error::Io(err) => write!(f, "connection failed: {err}"),
            Error::Cancelled => f.write_str("lease was cancelled"),
            Error::ShutDown => f.write_str("pool is shut down"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}
