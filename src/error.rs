use std::io;

/// The set of all possible errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("block {0} failed authentication")]
    CorruptBlock(u64),
    #[error("container length {0} is not a whole number of blocks")]
    BadContainerSize(u64),
    #[error("block {0} is beyond the end of the container")]
    OutOfRange(u64),
    #[error("container is locked for reading, writing needs an exclusive lock")]
    WrongLockMode,
    #[error("not a directory")]
    NotADirectory,
    #[error("directory entry not found")]
    EntryNotFound,
    #[error("directory entry already exists")]
    EntryExists,
    #[error("extended attribute not found")]
    XattrNotFound,
    #[error("extended attribute already exists")]
    XattrExists,
    #[error("name is {0} bytes long, the limit is 256")]
    NameTooLong(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl PartialEq for Error {
    fn eq(&self, rhs: &Error) -> bool {
        match (self, rhs) {
            (&Error::CorruptBlock(a), &Error::CorruptBlock(b)) => a == b,
            (&Error::BadContainerSize(a), &Error::BadContainerSize(b)) => a == b,
            (&Error::OutOfRange(a), &Error::OutOfRange(b)) => a == b,
            (&Error::WrongLockMode, &Error::WrongLockMode) => true,
            (&Error::NotADirectory, &Error::NotADirectory) => true,
            (&Error::EntryNotFound, &Error::EntryNotFound) => true,
            (&Error::EntryExists, &Error::EntryExists) => true,
            (&Error::XattrNotFound, &Error::XattrNotFound) => true,
            (&Error::XattrExists, &Error::XattrExists) => true,
            (&Error::NameTooLong(a), &Error::NameTooLong(b)) => a == b,
            _ => false,
        }
    }
}
