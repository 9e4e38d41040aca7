use std::io;

use thiserror::Error;

use rmqtt_impexp_codec::{DecodeError, EncodeError};
use rmqtt_impexp_utils::Canceled;

/// Return codes of export/import requests and of the broker collaborators they drive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImpexpError {
    #[error("allocation failed")]
    AllocateError,
    #[error("file corrupt, {0}")]
    FileCorrupt(String),
    #[error("client id in use")]
    ClientIdInUse,
    #[error("non-durable resource cannot be imported")]
    NonDurableImport,
    #[error("too many active requests")]
    TooManyActiveRequests,
    #[error("not found")]
    NotFound,
    #[error("bad property value, {0}")]
    BadPropertyValue(String),
    #[error("file already exists")]
    FileAlreadyExists,
    #[error("invalid operation")]
    InvalidOperation,
    #[error("subscription already exists")]
    ExistingSubscription,
    #[error("key already exists")]
    ExistingKey,
    #[error("bad client id")]
    BadClientId,
    #[error("operation canceled")]
    Canceled,
    #[error("store error, {0}")]
    Store(String),
    #[error("policy error, {0}")]
    Policy(String),
    #[error("topic tree error, {0}")]
    TopicTree(String),
    #[error("io error, {0}")]
    Io(String),
    #[error("{0}")]
    Msg(String),
}

impl ImpexpError {
    /// Stable numeric code, reported as `RetCode` in status files.
    pub fn code(&self) -> i32 {
        match self {
            ImpexpError::AllocateError => 103,
            ImpexpError::NotFound => 113,
            ImpexpError::ExistingKey => 114,
            ImpexpError::BadPropertyValue(_) => 115,
            ImpexpError::InvalidOperation => 117,
            ImpexpError::ExistingSubscription => 119,
            ImpexpError::BadClientId => 132,
            ImpexpError::Canceled => 133,
            ImpexpError::FileCorrupt(_) => 168,
            ImpexpError::FileAlreadyExists => 169,
            ImpexpError::ClientIdInUse => 170,
            ImpexpError::NonDurableImport => 171,
            ImpexpError::TooManyActiveRequests => 172,
            ImpexpError::Store(_) => 500,
            ImpexpError::Policy(_) => 501,
            ImpexpError::TopicTree(_) => 502,
            ImpexpError::Io(_) => 503,
            ImpexpError::Msg(_) => 100,
        }
    }

    #[inline]
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        ImpexpError::FileCorrupt(msg.into())
    }
}

impl From<String> for ImpexpError {
    #[inline]
    fn from(e: String) -> Self {
        ImpexpError::Msg(e)
    }
}

impl From<&str> for ImpexpError {
    #[inline]
    fn from(e: &str) -> Self {
        ImpexpError::Msg(e.to_string())
    }
}

impl From<io::Error> for ImpexpError {
    #[inline]
    fn from(e: io::Error) -> Self {
        ImpexpError::Io(e.to_string())
    }
}

impl From<Canceled> for ImpexpError {
    #[inline]
    fn from(_: Canceled) -> Self {
        ImpexpError::Canceled
    }
}

/// Anything wrong with the bytes of a container is reported as a corrupt file.
impl From<DecodeError> for ImpexpError {
    #[inline]
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::Io(e) => ImpexpError::Io(e.to_string()),
            e => ImpexpError::FileCorrupt(e.to_string()),
        }
    }
}

impl From<EncodeError> for ImpexpError {
    #[inline]
    fn from(e: EncodeError) -> Self {
        match e {
            EncodeError::Io(e) => ImpexpError::Io(e.to_string()),
            e => ImpexpError::Msg(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_errors_are_corrupt() {
        let e: ImpexpError = DecodeError::Crypto.into();
        assert!(matches!(e, ImpexpError::FileCorrupt(_)));
        let e: ImpexpError = DecodeError::UnsupportedVersion { kind: "Header", version: 9 }.into();
        assert_eq!(e.code(), ImpexpError::corrupt("").code());
        let e: ImpexpError = Canceled.into();
        assert_eq!(e, ImpexpError::Canceled);
    }
}
