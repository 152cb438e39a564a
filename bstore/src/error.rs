use std::io::{Error, ErrorKind};

use crate::key::Key128;

/// Insertion of a key that is already present. The payload for the failed
/// `Put` was still appended to the file before this error is raised; it
/// becomes dead space.
pub(crate) fn key_existed(key: Key128) -> Error {
    Error::new(ErrorKind::AlreadyExists, format!("key {key:?} already exists"))
}

/// Lookup miss.
pub(crate) fn key_not_found(key: Key128) -> Error {
    Error::new(ErrorKind::NotFound, format!("key {key:?} not found"))
}

/// The write syscall returned fewer bytes than were read from the source.
pub(crate) fn short_write(read: usize, written: usize) -> Error {
    Error::new(
        ErrorKind::WriteZero,
        format!("short write: read {read} bytes but wrote {written}"),
    )
}

/// The on-disk image did not decode into a well-formed record.
pub(crate) fn corrupt(what: &str) -> Error {
    Error::new(ErrorKind::InvalidData, format!("corrupt {what}"))
}
