//! SHA-256 content hashing
//!
//! The watcher hashes files as it records changes; the applier hashes them
//! to tell whether a server event's content is already on disk.

use std::path::Path;

use cirrus_core::domain::FileHash;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

/// Hashes an in-memory buffer
pub fn hash_bytes(data: &[u8]) -> FileHash {
    FileHash::from_digest(&Sha256::digest(data))
}

/// Reads a file and hashes its contents
#[instrument(fields(path = %path.display()))]
pub async fn hash_file(path: &Path) -> anyhow::Result<FileHash> {
    let data = tokio::fs::read(path).await?;
    let hash = hash_bytes(&data);
    debug!(bytes = data.len(), hash = %hash, "hash computed");
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        assert_eq!(
            hash_bytes(b"").as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn file_hash_matches_buffer_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        tokio::fs::write(&path, b"hello cirrus").await.unwrap();

        assert_eq!(hash_file(&path).await.unwrap(), hash_bytes(b"hello cirrus"));
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(hash_file(&dir.path().join("absent")).await.is_err());
    }
}
