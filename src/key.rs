//! Keys identifying one cacheable unit of work.
//!
//! A [CacheKey] compares by content, so two requests built separately for the same model, dimensions and pipeline
//! signature are the same key.  The disk store restricts keys to a filename-safe charset; [CacheKey::disk_key] maps any
//! key into it by hashing.
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// Longest key the disk store accepts.
pub const MAX_DISK_KEY_LEN: usize = 120;

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn new(key: impl Into<Arc<str>>) -> CacheKey {
        CacheKey(key.into())
    }

    /// Build the canonical key for a model rendered at a size through a pipeline.
    ///
    /// The model is length-prefixed so that no choice of model text can collide with a different
    /// model/dimension/signature split.
    pub fn from_parts(model: &str, width: u32, height: u32, signature: &str) -> CacheKey {
        CacheKey::new(format!(
            "{}:{}|{}x{}|{}",
            model.len(),
            model,
            width,
            height,
            signature
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn shared(&self) -> Arc<str> {
        self.0.clone()
    }

    /// The key to use for this entry in a [crate::DiskLruStore]: the lowercase hex SHA-256 of the key text.
    pub fn disk_key(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

/// Is `key` usable as a disk store key as-is?
pub fn is_valid_disk_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_DISK_KEY_LEN
        && key
            .bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-'))
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> CacheKey {
        CacheKey::new(key)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> CacheKey {
        CacheKey::new(key)
    }
}

impl From<Arc<str>> for CacheKey {
    fn from(key: Arc<str>) -> CacheKey {
        CacheKey(key)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({:?})", &*self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
