use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytestring::ByteString;

use crate::error::{DecodeError, EncodeError};

macro_rules! ensure {
    ($cond:expr, $e:expr) => {
        if !($cond) {
            return Err($e);
        }
    };
}

macro_rules! prim_enum {
    (
        $( #[$enum_attr:meta] )*
        pub enum $name:ident {
            $(
                $( #[$enum_item_attr:meta] )*
                $var:ident=$val:expr
            ),+
        }) => {
        $( #[$enum_attr] )*
        #[repr(u8)]
        #[derive(Debug, Eq, PartialEq, Copy, Clone, Hash)]
        pub enum $name {
            $(
                $( #[$enum_item_attr] )*
                $var = $val
            ),+
        }
        impl std::convert::TryFrom<u8> for $name {
            type Error = $crate::error::DecodeError;
            fn try_from(v: u8) -> Result<Self, Self::Error> {
                match v {
                    $($val => Ok($name::$var)),+
                    ,_ => Err($crate::error::DecodeError::MalformedRecord)
                }
            }
        }
        impl From<$name> for u8 {
            fn from(v: $name) -> Self {
                v as u8
            }
        }
    };
}

pub trait Decode: Sized {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError>;
}

impl Decode for bool {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure!(src.has_remaining(), DecodeError::InvalidLength); // expected more data within the field
        let v = src.get_u8();
        ensure!(v <= 0x1, DecodeError::MalformedRecord); // value is invalid
        Ok(v == 0x1)
    }
}

impl Decode for u8 {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure!(src.has_remaining(), DecodeError::InvalidLength);
        Ok(src.get_u8())
    }
}

impl Decode for u16 {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure!(src.remaining() >= 2, DecodeError::InvalidLength);
        Ok(src.get_u16())
    }
}

impl Decode for u32 {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure!(src.remaining() >= 4, DecodeError::InvalidLength); // expected more data within the field
        Ok(src.get_u32())
    }
}

impl Decode for u64 {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure!(src.remaining() >= 8, DecodeError::InvalidLength);
        Ok(src.get_u64())
    }
}

impl Decode for i64 {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure!(src.remaining() >= 8, DecodeError::InvalidLength);
        Ok(src.get_i64())
    }
}

/// u16 length prefixed bytes.
impl Decode for Bytes {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let len = u16::decode(src)? as usize;
        ensure!(src.remaining() >= len, DecodeError::InvalidLength);
        Ok(src.split_to(len))
    }
}

impl Decode for ByteString {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ByteString::try_from(Bytes::decode(src)?).map_err(|_| DecodeError::Utf8Error)
    }
}

/// Reads a u32 length prefixed, NUL terminated string. Length 0 means absent and the
/// length includes the terminator.
pub fn decode_cstr(src: &mut Bytes) -> Result<Option<ByteString>, DecodeError> {
    let len = u32::decode(src)? as usize;
    if len == 0 {
        return Ok(None);
    }
    ensure!(src.remaining() >= len, DecodeError::InvalidLength);
    let mut raw = src.split_to(len);
    ensure!(raw[len - 1] == 0, DecodeError::MalformedRecord);
    raw.truncate(len - 1);
    ByteString::try_from(raw).map(Some).map_err(|_| DecodeError::Utf8Error)
}

/// Like [`decode_cstr`] but absent is an error.
pub fn decode_required_cstr(src: &mut Bytes) -> Result<ByteString, DecodeError> {
    decode_cstr(src)?.ok_or(DecodeError::MalformedRecord)
}

pub(crate) fn decode_length_prefixed(src: &mut Bytes) -> Result<Bytes, DecodeError> {
    let len = u32::decode(src)? as usize;
    ensure!(src.remaining() >= len, DecodeError::InvalidLength);
    Ok(src.split_to(len))
}

pub(crate) fn check_version(kind: &'static str, version: u32, current: u32) -> Result<(), DecodeError> {
    ensure!(version >= 1 && version <= current, DecodeError::UnsupportedVersion { kind, version });
    Ok(())
}

/// A logical record assembled from several buffers.
///
/// Fixed-size fields are accumulated in a scratch buffer, while larger values (payloads,
/// identifiers) are appended as their own `Bytes` without being copied.
#[derive(Debug, Default)]
pub struct Fragments {
    parts: Vec<Bytes>,
    cur: BytesMut,
}

impl Fragments {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn buf(&mut self) -> &mut BytesMut {
        &mut self.cur
    }

    #[inline]
    pub fn push(&mut self, b: Bytes) {
        if !self.cur.is_empty() {
            self.parts.push(self.cur.split().freeze());
        }
        if !b.is_empty() {
            self.parts.push(b);
        }
    }

    /// Appends a u32 length prefixed, NUL terminated string.
    pub fn push_cstr(&mut self, s: Option<&ByteString>) -> Result<(), EncodeError> {
        match s {
            None => self.cur.put_u32(0),
            Some(s) => {
                let len = u32::try_from(s.len() + 1).map_err(|_| EncodeError::InvalidLength)?;
                self.cur.put_u32(len);
                self.push(s.as_bytes().clone());
                self.cur.put_u8(0);
            }
        }
        Ok(())
    }

    /// Appends a u16 length prefixed string.
    pub fn push_short_str(&mut self, s: &ByteString) -> Result<(), EncodeError> {
        let len = u16::try_from(s.len()).map_err(|_| EncodeError::InvalidLength)?;
        self.cur.put_u16(len);
        self.push(s.as_bytes().clone());
        Ok(())
    }

    /// Appends a u32 length prefixed blob.
    pub fn push_blob(&mut self, b: &Bytes) -> Result<(), EncodeError> {
        let len = u32::try_from(b.len()).map_err(|_| EncodeError::InvalidLength)?;
        self.cur.put_u32(len);
        self.push(b.clone());
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.parts.iter().map(|p| p.len()).sum::<usize>() + self.cur.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_parts(mut self) -> Vec<Bytes> {
        if !self.cur.is_empty() {
            self.parts.push(self.cur.split().freeze());
        }
        self.parts
    }
}

/// Implemented by every record payload.
pub trait Encode {
    fn encode(&self, frags: &mut Fragments) -> Result<(), EncodeError>;

    fn to_fragments(&self) -> Result<Fragments, EncodeError> {
        let mut frags = Fragments::new();
        self.encode(&mut frags)?;
        Ok(frags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cstr() {
        let mut frags = Fragments::new();
        frags.push_cstr(Some(&ByteString::from_static("abc"))).unwrap();
        frags.push_cstr(None).unwrap();
        assert_eq!(frags.len(), 4 + 4 + 4);
        let parts = frags.into_parts();
        assert_eq!(parts.len(), 3);
        let joined: Vec<u8> = parts.iter().flat_map(|p| p.iter().copied()).collect();
        let mut src = Bytes::from(joined);
        assert_eq!(decode_cstr(&mut src).unwrap().as_deref(), Some("abc"));
        assert_eq!(decode_cstr(&mut src).unwrap(), None);
        assert!(!src.has_remaining());
    }

    #[test]
    fn test_cstr_missing_terminator() {
        let mut src = Bytes::from_static(b"\x00\x00\x00\x02ab");
        assert!(matches!(decode_cstr(&mut src), Err(DecodeError::MalformedRecord)));
        let mut src = Bytes::from_static(b"\x00\x00\x00\x09ab");
        assert!(matches!(decode_cstr(&mut src), Err(DecodeError::InvalidLength)));
    }

    #[test]
    fn test_check_version() {
        assert!(check_version("Header", 1, 1).is_ok());
        assert!(matches!(
            check_version("Header", 2, 1),
            Err(DecodeError::UnsupportedVersion { kind: "Header", version: 2 })
        ));
        assert!(check_version("Header", 0, 1).is_err());
    }
}
