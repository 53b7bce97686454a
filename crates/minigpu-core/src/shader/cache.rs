//! Content-keyed cache of compiled shaders.
//!
//! Keys are SHA-256 digests of the full kernel source, so two distinct
//! sources never share a compiled kernel short of a digest collision.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use super::ComputeShader;

/// A compiled shader shared by every wrapper loaded with the same source.
pub(crate) type SharedShader = Arc<Mutex<ComputeShader>>;

/// Digest of kernel source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentKey([u8; 32]);

impl ContentKey {
    /// Computes the key for `source`.
    pub fn of(source: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());
        Self(digest)
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Canonical shader per content key. Owned by the context.
#[derive(Default)]
pub(crate) struct ShaderCache {
    entries: HashMap<ContentKey, SharedShader>,
}

impl ShaderCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, key: &ContentKey) -> Option<&SharedShader> {
        self.entries.get(key)
    }

    pub(crate) fn insert(&mut self, key: ContentKey, shader: SharedShader) {
        self.entries.insert(key, shader);
    }

    pub(crate) fn remove(&mut self, key: &ContentKey) -> Option<SharedShader> {
        self.entries.remove(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Removes every entry, handing them back for teardown.
    pub(crate) fn drain(&mut self) -> Vec<SharedShader> {
        self.entries.drain().map(|(_, shader)| shader).collect()
    }
}
