//! Object identifiers for SHA-1 and SHA-256 repositories.
//!
//! Every git object is named by the digest of `"<kind> <len>\0<payload>"`. The gateway serves
//! both object formats, so an [`ObjectId`] carries its own [`HashKind`] instead of relying on
//! process-wide state: two sessions against repositories with different formats never share
//! anything but the code.

use std::{fmt::Display, io, str::FromStr};

use serde::{Deserialize, Serialize};
use sha1::Digest;

use crate::internal::object::ObjectKind;

/// Hash algorithm of a repository, as declared by `extensions.objectformat`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    #[default]
    Sha1,
    Sha256,
}

impl HashKind {
    /// Raw digest length in bytes.
    pub const fn size(&self) -> usize {
        match self {
            HashKind::Sha1 => 20,
            HashKind::Sha256 => 32,
        }
    }

    /// Length of the lowercase hex rendering.
    pub const fn hex_len(&self) -> usize {
        match self {
            HashKind::Sha1 => 40,
            HashKind::Sha256 => 64,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            HashKind::Sha1 => "sha1",
            HashKind::Sha256 => "sha256",
        }
    }

    /// Digest `data` with this algorithm.
    pub fn digest(&self, data: &[u8]) -> ObjectId {
        let mut hasher = Hasher::new(*self);
        hasher.update(data);
        hasher.finalize()
    }
}

impl Display for HashKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(HashKind::Sha1),
            "sha256" => Ok(HashKind::Sha256),
            _ => Err(format!("invalid object format `{s}`")),
        }
    }
}

/// The name of a git object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectId {
    Sha1([u8; 20]),
    Sha256([u8; 32]),
}

impl Default for ObjectId {
    fn default() -> Self {
        ObjectId::Sha1([0u8; 20])
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.as_ref()))
    }
}

impl AsRef<[u8]> for ObjectId {
    fn as_ref(&self) -> &[u8] {
        match self {
            ObjectId::Sha1(bytes) => bytes.as_slice(),
            ObjectId::Sha256(bytes) => bytes.as_slice(),
        }
    }
}

/// Parses a 40 (SHA-1) or 64 (SHA-256) character hex string.
impl FromStr for ObjectId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.len() {
            40 => HashKind::Sha1,
            64 => HashKind::Sha256,
            n => return Err(format!("invalid object id length {n}")),
        };
        let bytes = hex::decode(s).map_err(|e| e.to_string())?;
        ObjectId::from_bytes(kind, &bytes)
    }
}

impl ObjectId {
    /// The all-zero id used as the "no object" sentinel in ref updates.
    pub const fn zero(kind: HashKind) -> ObjectId {
        match kind {
            HashKind::Sha1 => ObjectId::Sha1([0u8; 20]),
            HashKind::Sha256 => ObjectId::Sha256([0u8; 32]),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.as_ref().iter().all(|b| *b == 0)
    }

    pub fn kind(&self) -> HashKind {
        match self {
            ObjectId::Sha1(_) => HashKind::Sha1,
            ObjectId::Sha256(_) => HashKind::Sha256,
        }
    }

    /// Build an id from raw digest bytes, checking the length against `kind`.
    pub fn from_bytes(kind: HashKind, bytes: &[u8]) -> Result<ObjectId, String> {
        if bytes.len() != kind.size() {
            return Err(format!(
                "invalid byte length: got {}, expected {}",
                bytes.len(),
                kind.size()
            ));
        }
        Ok(match kind {
            HashKind::Sha1 => {
                let mut h = [0u8; 20];
                h.copy_from_slice(bytes);
                ObjectId::Sha1(h)
            }
            HashKind::Sha256 => {
                let mut h = [0u8; 32];
                h.copy_from_slice(bytes);
                ObjectId::Sha256(h)
            }
        })
    }

    /// Read a raw digest of `kind` from a byte stream.
    pub fn from_stream(kind: HashKind, data: &mut impl io::Read) -> io::Result<ObjectId> {
        let mut buf = vec![0u8; kind.size()];
        data.read_exact(&mut buf)?;
        ObjectId::from_bytes(kind, &buf).map_err(io::Error::other)
    }

    /// Parse a hex id and insist it belongs to `kind`.
    pub fn from_hex(kind: HashKind, s: &str) -> Result<ObjectId, String> {
        let id = ObjectId::from_str(s)?;
        if id.kind() != kind {
            return Err(format!("object id `{s}` is not a {kind} id"));
        }
        Ok(id)
    }

    /// Name an object from its kind and payload.
    pub fn from_type_and_data(hash: HashKind, kind: ObjectKind, data: &[u8]) -> ObjectId {
        let mut hasher = Hasher::new(hash);
        hasher.update(kind.as_bytes());
        hasher.update(b" ");
        hasher.update(data.len().to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(data);
        hasher.finalize()
    }

    pub fn to_data(self) -> Vec<u8> {
        self.as_ref().to_vec()
    }
}

/// Streaming digest over either algorithm, used for pack trailers and object ids.
#[derive(Clone)]
pub enum Hasher {
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
}

impl Hasher {
    pub fn new(kind: HashKind) -> Self {
        match kind {
            HashKind::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
            HashKind::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha1(hasher) => hasher.update(data),
            Hasher::Sha256(hasher) => hasher.update(data),
        }
    }

    pub fn finalize(self) -> ObjectId {
        match self {
            Hasher::Sha1(hasher) => {
                let mut h = [0u8; 20];
                h.copy_from_slice(&hasher.finalize());
                ObjectId::Sha1(h)
            }
            Hasher::Sha256(hasher) => {
                let mut h = [0u8; 32];
                h.copy_from_slice(&hasher.finalize());
                ObjectId::Sha256(h)
            }
        }
    }
}

impl io::Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
