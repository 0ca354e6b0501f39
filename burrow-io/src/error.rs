use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    /// Another base in this process already owns the signal table.
    SignalsClaimed,
    /// The base was created without signal handling.
    SignalsDisabled,
    /// The token does not name a live registry entry.
    UnknownToken,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO Error: {}", e),
            Error::SignalsClaimed => write!(f, "signal handling already claimed by another base"),
            Error::SignalsDisabled => write!(f, "base created without signal handling"),
            Error::UnknownToken => write!(f, "unknown event token"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
