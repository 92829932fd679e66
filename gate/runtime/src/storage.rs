//! Content-addressed module storage.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha384};
use tokio::io::AsyncRead;

use crate::lock;

/// Module identity: the SHA-384 digest of its bytes, base64url without
/// padding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(String);

/// Length of an encoded SHA-384 digest.
const ENCODED_LEN: usize = 64;

impl ModuleId {
    pub fn of(bytes: &[u8]) -> Self {
        Self(URL_SAFE_NO_PAD.encode(Sha384::digest(bytes)))
    }

    /// Accept an id received from elsewhere if it is well-formed.
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == ENCODED_LEN
            && s
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        valid.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type ModuleReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait ModuleStorage: Send + Sync {
    /// Store a module. Storing the same bytes again returns the same id.
    async fn put_module(&self, bytes: Vec<u8>) -> io::Result<ModuleId>;

    async fn open_module(&self, id: &ModuleId) -> io::Result<Option<ModuleReader>>;

    async fn module_count(&self) -> io::Result<usize>;
}

/// Modules kept in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    modules: Mutex<HashMap<ModuleId, Arc<[u8]>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ModuleStorage for MemoryStorage {
    async fn put_module(&self, bytes: Vec<u8>) -> io::Result<ModuleId> {
        let id = ModuleId::of(&bytes);
        lock(&self.modules)
            .entry(id.clone())
            .or_insert_with(|| bytes.into());
        Ok(id)
    }

    async fn open_module(&self, id: &ModuleId) -> io::Result<Option<ModuleReader>> {
        let bytes = lock(&self.modules).get(id).cloned();
        Ok(bytes.map(|b| Box::new(io::Cursor::new(b)) as ModuleReader))
    }

    async fn module_count(&self) -> io::Result<usize> {
        Ok(lock(&self.modules).len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn id_is_sha384_base64url() {
        let id = ModuleId::of(b"");
        assert_eq!(
            id.as_str(),
            "OLBgp1GsljhM2TJ-sbHjaiH9txEUvgdDTAzHv2P24donTt6_529l-9Ua0vFImLlb"
        );
        assert_eq!(ModuleId::parse(id.as_str()), Some(id));
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(ModuleId::parse("").is_none());
        assert!(ModuleId::parse(&"+".repeat(64)).is_none());
        assert!(ModuleId::parse(&"a".repeat(63)).is_none());
    }

    #[tokio::test]
    async fn memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        let id = storage.put_module(b"\0asm".to_vec()).await.unwrap();
        assert_eq!(storage.put_module(b"\0asm".to_vec()).await.unwrap(), id);
        assert_eq!(storage.module_count().await.unwrap(), 1);

        let mut reader = storage.open_module(&id).await.unwrap().unwrap();
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await.unwrap();
        assert_eq!(bytes, b"\0asm");

        let missing = ModuleId::of(b"other");
        assert!(storage.open_module(&missing).await.unwrap().is_none());
    }
}
