//! Content identifiers.
//!
//! A `Cid` is the tuple `[version:u8][reserved:u8][digest:32]` where the
//! digest is BLAKE3-256 of a block's full bytes. The textual form is a
//! lowercase multibase prefix `b` followed by unpadded RFC 4648 base32 of
//! the 34-byte tuple, 56 characters total.

use std::fmt;

use base32::Alphabet;
use thiserror::Error;

/// Current CID version.
pub const CID_VERSION: u8 = 1;

/// Length of the binary CID tuple.
pub const CID_BYTES_LEN: usize = 34;

const BASE32: Alphabet = Alphabet::Rfc4648Lower { padding: false };

/// Errors from CID parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CidError {
    /// The binary form was not exactly 34 bytes.
    #[error("bad CID length: {0}")]
    BadLength(usize),

    /// The textual form was not valid multibase base32.
    #[error("bad CID encoding")]
    BadEncoding,
}

/// Content identifier for a block.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cid {
    /// Format version.
    pub version: u8,
    /// BLAKE3-256 digest of the block bytes.
    pub digest: [u8; 32],
}

impl Cid {
    /// Computes the CID of a byte sequence.
    pub fn of(bytes: &[u8]) -> Self {
        Self {
            version: CID_VERSION,
            digest: *blake3::hash(bytes).as_bytes(),
        }
    }

    /// Returns the 34-byte binary tuple. Byte 1 is reserved and zero.
    pub fn to_bytes(&self) -> [u8; CID_BYTES_LEN] {
        let mut buf = [0u8; CID_BYTES_LEN];
        buf[0] = self.version;
        buf[2..].copy_from_slice(&self.digest);
        buf
    }

    /// Parses a CID from its 34-byte binary tuple.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, CidError> {
        if raw.len() != CID_BYTES_LEN {
            return Err(CidError::BadLength(raw.len()));
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&raw[2..]);
        Ok(Self {
            version: raw[0],
            digest,
        })
    }

    /// Returns the 56-character textual form.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(56);
        out.push('b');
        out.push_str(&base32::encode(BASE32, &self.to_bytes()));
        out
    }

    /// Parses the textual form produced by [`Cid::encode`].
    pub fn decode(s: &str) -> Result<Self, CidError> {
        let rest = s
            .strip_prefix('b')
            .ok_or(CidError::BadEncoding)?
            .to_ascii_lowercase();
        let raw = base32::decode(BASE32, &rest).ok_or(CidError::BadEncoding)?;
        Self::from_bytes(&raw)
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", &self.encode()[..12])
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_of_bytes() {
        let c = Cid::of(b"hello");
        assert_eq!(c.version, CID_VERSION);
        assert_eq!(c.digest, *blake3::hash(b"hello").as_bytes());
    }

    #[test]
    fn test_binary_roundtrip() {
        let c = Cid::of(b"some block bytes");
        let raw = c.to_bytes();
        assert_eq!(raw[1], 0);
        assert_eq!(Cid::from_bytes(&raw).unwrap(), c);
    }

    #[test]
    fn test_text_roundtrip() {
        let c = Cid::of(b"payload");
        let text = c.encode();
        assert_eq!(text.len(), 56);
        assert!(text.starts_with('b'));
        assert_eq!(Cid::decode(&text).unwrap(), c);
    }

    #[test]
    fn test_text_case_insensitive() {
        let c = Cid::of(b"payload");
        let upper: String = c
            .encode()
            .chars()
            .enumerate()
            .map(|(i, ch)| if i == 0 { ch } else { ch.to_ascii_uppercase() })
            .collect();
        assert_eq!(Cid::decode(&upper).unwrap(), c);
    }

    #[test]
    fn test_bad_length() {
        assert_eq!(Cid::from_bytes(&[0u8; 33]), Err(CidError::BadLength(33)));
        assert_eq!(Cid::from_bytes(&[0u8; 35]), Err(CidError::BadLength(35)));
    }

    #[test]
    fn test_distinct_content_distinct_cid() {
        assert_ne!(Cid::of(b"a"), Cid::of(b"b"));
        assert_eq!(Cid::of(b"a"), Cid::of(b"a"));
    }
}
