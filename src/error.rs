// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::fmt;

/// Errors that can occur while operating on a blob or its backing cache.
#[derive(Debug)]
pub enum Error {
    /// I/O error from the backing store.
    Io(std::io::Error),

    /// The buffer cache has no more free blocks to allocate.
    BlockIdsExhausted,

    /// The enclosing transaction was aborted before the operation completed.
    TransactionAborted,

    /// A caller-supplied reference or block failed a contract check.
    Corrupt(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::BlockIdsExhausted => write!(f, "buffer cache has no free blocks left"),
            Self::TransactionAborted => write!(f, "transaction was aborted"),
            Self::Corrupt(msg) => write!(f, "corrupt blob state: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Blob engine result.
pub type Result<T> = std::result::Result<T, Error>;
