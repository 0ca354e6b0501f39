use std::fmt;
use std::io;

#[derive(Debug)]
pub enum NetworkError {
    Io(io::Error),
    Event(burrow_io::Error),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Io(e) => write!(f, "IO Error: {}", e),
            NetworkError::Event(e) => write!(f, "Event Error: {}", e),
        }
    }
}

impl std::error::Error for NetworkError {}

impl From<io::Error> for NetworkError {
    fn from(err: io::Error) -> Self {
        NetworkError::Io(err)
    }
}

impl From<burrow_io::Error> for NetworkError {
    fn from(err: burrow_io::Error) -> Self {
        NetworkError::Event(err)
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;
