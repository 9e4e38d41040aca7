//! Encrypted container holding a stream of framed records.
//!
//! Layout: a plaintext preamble (magic, salt, argon2id cost parameters, nonce prefix) followed by
//! AES-256-GCM sealed chunks `flags u8 | len u32 | ciphertext`. The last chunk carries
//! [`FINAL_CHUNK`] so truncation at a chunk boundary is detected. Records are framed as
//! `type u8 | dataId u64 | len u32 | payload` inside the decrypted stream and may span chunks.

use std::io::{self, Read, Write};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;

use crate::error::{DecodeError, EncodeError};
use crate::types::{RawRecord, RecordType, MAX_RECORD_LEN, RECORD_FRAME_LEN};

pub const MAGIC: &[u8; 8] = b"RMQTTIX1";
pub const CHUNK_SIZE: usize = 64 * 1024;
pub const FINAL_CHUNK: u8 = 0x01;

const SALT_LEN: usize = 16;
const NONCE_PREFIX_LEN: usize = 4;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const PREAMBLE_LEN: usize = MAGIC.len() + SALT_LEN + 4 + 4 + NONCE_PREFIX_LEN;

/// Argon2id cost parameters, stored in the preamble so readers derive the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
}

impl KdfParams {
    pub const MIN_MEMORY_KIB: u32 = 8;
    pub const MAX_MEMORY_KIB: u32 = 1024 * 1024;
    pub const MAX_ITERATIONS: u32 = 64;

    #[inline]
    pub fn is_valid(&self) -> bool {
        (Self::MIN_MEMORY_KIB..=Self::MAX_MEMORY_KIB).contains(&self.memory_kib)
            && (1..=Self::MAX_ITERATIONS).contains(&self.iterations)
    }

    fn derive(&self, password: &[u8], salt: &[u8]) -> Option<Aes256Gcm> {
        if !self.is_valid() {
            return None;
        }
        let params = Params::new(self.memory_kib, self.iterations, 1, Some(KEY_LEN)).ok()?;
        let mut key = [0u8; KEY_LEN];
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(password, salt, &mut key)
            .ok()?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        key.fill(0);
        Some(cipher)
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        KdfParams { memory_kib: 19 * 1024, iterations: 2 }
    }
}

fn nonce_for(prefix: &[u8; NONCE_PREFIX_LEN], counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn aad_for(flags: u8, counter: u64) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[0] = flags;
    aad[1..].copy_from_slice(&counter.to_be_bytes());
    aad
}

/// Append-only writer. Must be closed with [`ContainerWriter::finish`].
pub struct ContainerWriter<W: Write> {
    inner: W,
    cipher: Aes256Gcm,
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
    counter: u64,
    plain: Vec<u8>,
    records: u64,
    finished: bool,
}

impl<W: Write> ContainerWriter<W> {
    pub fn new(mut inner: W, password: &[u8], kdf: KdfParams) -> Result<Self, EncodeError> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        let mut rng = rand::rng();
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut nonce_prefix);
        let cipher = kdf.derive(password, &salt).ok_or(EncodeError::InvalidKdfParams)?;

        let mut preamble = BytesMut::with_capacity(PREAMBLE_LEN);
        preamble.put_slice(MAGIC);
        preamble.put_slice(&salt);
        preamble.put_u32(kdf.memory_kib);
        preamble.put_u32(kdf.iterations);
        preamble.put_slice(&nonce_prefix);
        inner.write_all(&preamble)?;

        Ok(ContainerWriter {
            inner,
            cipher,
            nonce_prefix,
            counter: 0,
            plain: Vec::with_capacity(CHUNK_SIZE),
            records: 0,
            finished: false,
        })
    }

    /// Writes one logical record assembled from `fragments` in order.
    pub fn write_record(&mut self, rtype: RecordType, data_id: u64, fragments: &[Bytes]) -> Result<(), EncodeError> {
        if self.finished {
            return Err(EncodeError::Finished);
        }
        let len: usize = fragments.iter().map(|f| f.len()).sum();
        if len > MAX_RECORD_LEN as usize {
            return Err(EncodeError::RecordTooLarge(len));
        }
        let mut frame = [0u8; RECORD_FRAME_LEN];
        frame[0] = rtype.into();
        frame[1..9].copy_from_slice(&data_id.to_be_bytes());
        frame[9..].copy_from_slice(&(len as u32).to_be_bytes());
        self.write_plain(&frame)?;
        for frag in fragments {
            self.write_plain(frag)?;
        }
        self.records += 1;
        Ok(())
    }

    /// Records written so far.
    #[inline]
    pub fn records(&self) -> u64 {
        self.records
    }

    fn write_plain(&mut self, mut data: &[u8]) -> Result<(), EncodeError> {
        while !data.is_empty() {
            let n = (CHUNK_SIZE - self.plain.len()).min(data.len());
            self.plain.extend_from_slice(&data[..n]);
            data = &data[n..];
            if self.plain.len() == CHUNK_SIZE {
                self.seal_chunk(0)?;
            }
        }
        Ok(())
    }

    fn seal_chunk(&mut self, flags: u8) -> Result<(), EncodeError> {
        let nonce = nonce_for(&self.nonce_prefix, self.counter);
        let aad = aad_for(flags, self.counter);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: &self.plain, aad: &aad })
            .map_err(|_| EncodeError::Crypto)?;
        let mut head = [0u8; 5];
        head[0] = flags;
        head[1..].copy_from_slice(&(sealed.len() as u32).to_be_bytes());
        self.inner.write_all(&head)?;
        self.inner.write_all(&sealed)?;
        self.plain.clear();
        self.counter += 1;
        Ok(())
    }

    /// Seals the final chunk and flushes. Returns the underlying writer.
    pub fn finish(mut self) -> Result<W, EncodeError> {
        if self.finished {
            return Err(EncodeError::Finished);
        }
        self.seal_chunk(FINAL_CHUNK)?;
        self.finished = true;
        self.inner.flush()?;
        let ContainerWriter { inner, .. } = self;
        Ok(inner)
    }
}

/// Sequential record reader over a container.
pub struct ContainerReader<R: Read> {
    inner: R,
    cipher: Aes256Gcm,
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
    counter: u64,
    pending: BytesMut,
    final_seen: bool,
}

impl<R: Read> ContainerReader<R> {
    pub fn new(mut inner: R, password: &[u8]) -> Result<Self, DecodeError> {
        let mut preamble = [0u8; PREAMBLE_LEN];
        inner.read_exact(&mut preamble).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => DecodeError::BadMagic,
            _ => DecodeError::Io(e),
        })?;
        let mut src = &preamble[..];
        ensure!(&src[..MAGIC.len()] == MAGIC, DecodeError::BadMagic);
        src.advance(MAGIC.len());
        let salt = &src[..SALT_LEN];
        let mut rest = &src[SALT_LEN..];
        let kdf = KdfParams { memory_kib: rest.get_u32(), iterations: rest.get_u32() };
        ensure!(kdf.is_valid(), DecodeError::InvalidKdfParams);
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        nonce_prefix.copy_from_slice(&rest[..NONCE_PREFIX_LEN]);
        let cipher = kdf.derive(password, salt).ok_or(DecodeError::InvalidKdfParams)?;

        Ok(ContainerReader {
            inner,
            cipher,
            nonce_prefix,
            counter: 0,
            pending: BytesMut::with_capacity(CHUNK_SIZE),
            final_seen: false,
        })
    }

    /// Next record, or `None` at a clean end of the stream.
    pub fn read_record(&mut self) -> Result<Option<RawRecord>, DecodeError> {
        if !self.fill(1)? {
            return Ok(None);
        }
        ensure!(self.fill(RECORD_FRAME_LEN)?, DecodeError::Truncated);
        let rtype = self.pending.get_u8();
        let data_id = self.pending.get_u64();
        let len = self.pending.get_u32();
        ensure!(len <= MAX_RECORD_LEN, DecodeError::RecordTooLarge(len));
        ensure!(self.fill(len as usize)?, DecodeError::Truncated);
        let payload = self.pending.split_to(len as usize).freeze();
        Ok(Some(RawRecord { rtype, data_id, payload }))
    }

    /// Decrypts chunks until at least `n` plaintext bytes are buffered. Returns `false`
    /// if the stream ended first.
    fn fill(&mut self, n: usize) -> Result<bool, DecodeError> {
        while self.pending.len() < n {
            if self.final_seen {
                return Ok(false);
            }
            self.open_chunk()?;
        }
        Ok(true)
    }

    fn open_chunk(&mut self) -> Result<(), DecodeError> {
        let mut head = [0u8; 5];
        self.inner.read_exact(&mut head)?;
        let flags = head[0];
        ensure!(flags & !FINAL_CHUNK == 0, DecodeError::MalformedRecord);
        let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
        ensure!((TAG_LEN..=CHUNK_SIZE + TAG_LEN).contains(&len), DecodeError::MalformedRecord);
        let mut sealed = vec![0u8; len];
        self.inner.read_exact(&mut sealed)?;

        let nonce = nonce_for(&self.nonce_prefix, self.counter);
        let aad = aad_for(flags, self.counter);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: &sealed, aad: &aad })
            .map_err(|_| DecodeError::Crypto)?;
        self.pending.extend_from_slice(&plain);
        self.counter += 1;

        if flags & FINAL_CHUNK != 0 {
            self.final_seen = true;
            let mut extra = [0u8; 1];
            ensure!(self.inner.read(&mut extra)? == 0, DecodeError::TrailingData);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const TEST_KDF: KdfParams = KdfParams { memory_kib: 64, iterations: 1 };

    fn write_sample(records: &[(RecordType, u64, Vec<Bytes>)]) -> Vec<u8> {
        let mut w = ContainerWriter::new(Vec::new(), b"secret", TEST_KDF).unwrap();
        for (t, id, frags) in records {
            w.write_record(*t, *id, frags).unwrap();
        }
        w.finish().unwrap()
    }

    #[test]
    fn test_records_spanning_chunks() {
        let big = Bytes::from(vec![0xABu8; CHUNK_SIZE * 2 + 17]);
        let data = write_sample(&[
            (RecordType::Header, 1, vec![Bytes::from_static(b"hdr")]),
            (RecordType::Message, 2, vec![Bytes::from_static(b"head-"), big.clone(), Bytes::from_static(b"-tail")]),
            (RecordType::Footer, 1, vec![]),
        ]);
        let mut r = ContainerReader::new(Cursor::new(data), b"secret").unwrap();
        let hdr = r.read_record().unwrap().unwrap();
        assert_eq!(hdr.record_type().unwrap(), RecordType::Header);
        assert_eq!(&hdr.payload[..], b"hdr");
        let msg = r.read_record().unwrap().unwrap();
        assert_eq!(msg.data_id, 2);
        assert_eq!(msg.payload.len(), big.len() + 10);
        assert_eq!(&msg.payload[..5], b"head-");
        assert_eq!(&msg.payload[msg.payload.len() - 5..], b"-tail");
        let footer = r.read_record().unwrap().unwrap();
        assert_eq!(footer.record_type().unwrap(), RecordType::Footer);
        assert!(footer.payload.is_empty());
        assert!(r.read_record().unwrap().is_none());
    }

    #[test]
    fn test_wrong_password() {
        let data = write_sample(&[(RecordType::Header, 1, vec![Bytes::from_static(b"x")])]);
        let mut r = ContainerReader::new(Cursor::new(data), b"guess").unwrap();
        assert!(matches!(r.read_record(), Err(DecodeError::Crypto)));
    }

    #[test]
    fn test_truncated_before_final_chunk() {
        let big = Bytes::from(vec![1u8; CHUNK_SIZE + 10]);
        let mut data = write_sample(&[(RecordType::Message, 9, vec![big])]);
        //drop the final chunk entirely
        let final_len = 5 + RECORD_FRAME_LEN + 10 + TAG_LEN;
        data.truncate(data.len() - final_len);
        let mut r = ContainerReader::new(Cursor::new(data), b"secret").unwrap();
        assert!(matches!(r.read_record(), Err(DecodeError::Truncated)));
    }

    #[test]
    fn test_trailing_data_rejected() {
        let mut data = write_sample(&[(RecordType::Header, 1, vec![])]);
        data.push(0);
        let mut r = ContainerReader::new(Cursor::new(data), b"secret").unwrap();
        assert!(matches!(r.read_record(), Err(DecodeError::TrailingData)));
    }

    #[test]
    fn test_bad_magic_and_kdf() {
        assert!(matches!(ContainerReader::new(Cursor::new(b"short".to_vec()), b"p"), Err(DecodeError::BadMagic)));

        let mut data = write_sample(&[]);
        data[MAGIC.len() + SALT_LEN..MAGIC.len() + SALT_LEN + 4].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(ContainerReader::new(Cursor::new(data), b"secret"), Err(DecodeError::InvalidKdfParams)));
    }

    #[test]
    fn test_unknown_record_type_surfaces() {
        let mut w = ContainerWriter::new(Vec::new(), b"k", TEST_KDF).unwrap();
        w.write_record(RecordType::Header, 1, &[]).unwrap();
        assert_eq!(w.records(), 1);
        let data = w.finish().unwrap();
        let mut r = ContainerReader::new(Cursor::new(data), b"k").unwrap();
        let mut rec = r.read_record().unwrap().unwrap();
        rec.rtype = 200;
        assert!(matches!(rec.record_type(), Err(DecodeError::UnknownRecordType(200))));
    }
}
