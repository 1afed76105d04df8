use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha1::{Digest, Sha1};

pub const ID_HASH_SIZE: usize = 20;

#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct IdHash(pub [u8; ID_HASH_SIZE]);

impl IdHash {
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(raw: &str) -> Option<IdHash> {
        let bytes = hex::decode(raw).ok()?;
        let hash: [u8; ID_HASH_SIZE] = bytes.try_into().ok()?;
        Some(IdHash(hash))
    }

    pub fn block_path(&self, root: &Path, index: u32) -> PathBuf {
        let hash = self.to_hex();
        root.join(&hash[0..1])
            .join(&hash[2..4])
            .join(format!("{hash}-{index:06}"))
    }
}

impl fmt::Debug for IdHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdHash({})", self.to_hex())
    }
}

/// Cache identity of an object: the origin-relative path plus its SHA-1,
/// which drives store keys and the on-disk layout.
#[derive(Clone)]
pub struct ObjectId {
    path: String,
    hash: IdHash,
}

impl ObjectId {
    pub fn new(path: &str) -> Self {
        let hash = sha1_hash(path.as_bytes());
        Self {
            path: path.to_string(),
            hash,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn hash(&self) -> IdHash {
        self.hash
    }

    pub fn hash_str(&self) -> String {
        self.hash.to_hex()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}:{}}}", self.hash.to_hex(), self.path)
    }
}

fn sha1_hash(input: &[u8]) -> IdHash {
    let mut hasher = Sha1::new();
    hasher.update(input);
    let result = hasher.finalize();
    let mut hash = [0u8; ID_HASH_SIZE];
    hash.copy_from_slice(&result[..]);
    IdHash(hash)
}

#[derive(Clone, Debug)]
pub struct ObjectMetadata {
    pub size: u64,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_md5: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub expires_at: Option<SystemTime>,
}

impl ObjectMetadata {
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        matches!(self.expires_at, Some(at) if at > now)
    }

    /// Identity comparison for deciding whether cached blocks are still
    /// valid after a re-probe: etag when both sides have one, size otherwise.
    pub fn same_identity(&self, other: &ObjectMetadata) -> bool {
        match (&self.etag, &other.etag) {
            (Some(a), Some(b)) => a == b,
            _ => self.size == other.size,
        }
    }
}
