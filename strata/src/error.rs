use std::fmt;
use std::io;

/// Errors surfaced by the storage engine.
#[derive(Debug)]
pub enum DbError {
    /// A logical or disk-state error: corrupted page category, deleting a
    /// tuple that does not exist, reading past the end of a file, or an
    /// unevictable buffer pool. Not transient.
    Db(String),
    /// A lock wait timed out. This is a signal, not a fault: the caller must
    /// complete the transaction with `commit = false` and may retry from the
    /// top.
    TransactionAborted,
}

pub type DbResult<T> = Result<T, DbError>;

impl DbError {
    pub fn db(msg: impl Into<String>) -> Self {
        DbError::Db(msg.into())
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::Db(msg) => write!(f, "{}", msg),
            DbError::TransactionAborted => write!(f, "transaction aborted"),
        }
    }
}

impl std::error::Error for DbError {}

impl From<io::Error> for DbError {
    fn from(err: io::Error) -> Self {
        DbError::Db(format!("io error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_becomes_db_error() {
        let err: DbError = io::Error::new(io::ErrorKind::UnexpectedEof, "short read").into();
        match err {
            DbError::Db(msg) => assert!(msg.contains("short read")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
