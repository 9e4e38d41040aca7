use std::io;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid length")]
    InvalidLength,
    #[error("Malformed record")]
    MalformedRecord,
    #[error("Unsupported {kind} version {version}")]
    UnsupportedVersion { kind: &'static str, version: u32 },
    #[error("Unknown record type {0}")]
    UnknownRecordType(u8),
    #[error("Record too large, {0} bytes")]
    RecordTooLarge(u32),
    #[error("Not a resource container file")]
    BadMagic,
    #[error("Invalid key derivation parameters")]
    InvalidKdfParams,
    #[error("Decryption failed")]
    Crypto,
    #[error("Container is truncated")]
    Truncated,
    #[error("Data after final chunk")]
    TrailingData,
    #[error("utf8 error")]
    Utf8Error,
    #[error("io error, {:?}", _0)]
    Io(io::Error),
}

impl From<io::Error> for DecodeError {
    fn from(e: io::Error) -> DecodeError {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => DecodeError::Truncated,
            _ => DecodeError::Io(e),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("Invalid length")]
    InvalidLength,
    #[error("Record too large, {0} bytes")]
    RecordTooLarge(usize),
    #[error("Invalid key derivation parameters")]
    InvalidKdfParams,
    #[error("Encryption failed")]
    Crypto,
    #[error("Container already finished")]
    Finished,
    #[error("io error, {:?}", _0)]
    Io(io::Error),
}

impl From<io::Error> for EncodeError {
    fn from(e: io::Error) -> EncodeError {
        EncodeError::Io(e)
    }
}
