//! Content hashing.
//!
//! Sources are content-addressed by the SHA-256 digest of their bytes. The
//! digest depends on nothing but the bytes: not the path, not the metadata,
//! not the modification time.

use crate::error::{ErrorKind, Result};
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::instrument;

const PREFIX: &str = "sha256:";
/// Default read buffer for streaming hashes.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A content identifier of the form `sha256:<64 lowercase hex chars>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(String);

impl ContentHash {
    fn from_digest(digest: &[u8]) -> Self {
        Self(format!("{PREFIX}{}", hex::encode(digest)))
    }

    /// The hex digest, without the algorithm prefix.
    pub fn digest(&self) -> &str {
        &self.0[PREFIX.len()..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse the `sha256:<hex>` form back into a hash.
    pub fn parse(s: &str) -> Option<Self> {
        let digest = s.strip_prefix(PREFIX)?;
        let well_formed =
            digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        well_formed.then(|| Self(s.to_string()))
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.0)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Hash an in-memory buffer.
pub fn hash_bytes(bytes: &[u8]) -> ContentHash {
    ContentHash::from_digest(&Sha256::digest(bytes))
}

/// Streaming file hasher.
///
/// Reads the file through a fixed-size buffer, so memory use does not grow
/// with file size.
///
/// # Concurrent modification
/// The file is **not** locked while it is being read. If something writes to
/// it mid-stream, the returned hash may describe a mix of old and new bytes (a
/// torn read). That is accepted behaviour: callers that care should compare
/// the modification time before and after, or re-hash on the next change
/// notification.
#[derive(Clone, Copy, Debug)]
pub struct Hasher {
    chunk_size: usize,
}

impl Default for Hasher {
    fn default() -> Self {
        Self { chunk_size: DEFAULT_CHUNK_SIZE }
    }
}

impl Hasher {
    /// Create a hasher reading `chunk_size` bytes at a time (minimum 1).
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size: chunk_size.max(1) }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Hash the contents of a regular file.
    ///
    /// # Errors
    /// Returns [`Io`](ErrorKind::Io) carrying `path` when the file cannot be
    /// opened or a read fails part-way through. The file handle is closed on
    /// every return path when it goes out of scope.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use srcwatch_source::Hasher;
    /// # async fn example() -> srcwatch_source::error::Result<()> {
    /// let hash = Hasher::default().hash_file("/etc/hostname").await?;
    /// assert!(hash.to_string().starts_with("sha256:"));
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all, fields(path = %path.as_ref().display(), bytes))]
    pub async fn hash_file(&self, path: impl AsRef<Path>) -> Result<ContentHash> {
        let path = path.as_ref();
        let mut file = File::open(path).await.map_err(|e| ErrorKind::io(path, e))?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; self.chunk_size];
        let mut total: u64 = 0;
        loop {
            let read = file.read(&mut buffer).await.map_err(|e| ErrorKind::io(path, e))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            total += read as u64;
        }
        tracing::Span::current().record("bytes", total);
        Ok(ContentHash::from_digest(&hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    // sha256("") and sha256("abc"), from FIPS 180-2.
    const EMPTY: &str = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const ABC: &str = "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[rstest]
    #[case(b"", EMPTY)]
    #[case(b"abc", ABC)]
    fn test_hash_bytes(#[case] input: &[u8], #[case] expected: &str) {
        assert_eq!(hash_bytes(input).to_string(), expected);
    }

    #[tokio::test]
    async fn test_identical_bytes_at_different_paths() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("nested-b.dat");
        std::fs::write(&a, b"same bytes, different names").unwrap();
        std::fs::write(&b, b"same bytes, different names").unwrap();
        let hasher = Hasher::default();
        assert_eq!(hasher.hash_file(&a).await.unwrap(), hasher.hash_file(&b).await.unwrap());
    }

    #[tokio::test]
    async fn test_single_byte_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.bin");
        let mut data = vec![7u8; 10_000];
        std::fs::write(&path, &data).unwrap();
        let before = Hasher::default().hash_file(&path).await.unwrap();
        data[4_321] ^= 0x01;
        std::fs::write(&path, &data).unwrap();
        let after = Hasher::default().hash_file(&path).await.unwrap();
        assert_ne!(before, after);
    }

    #[rstest]
    #[case(1)]
    #[case(7)]
    #[case(DEFAULT_CHUNK_SIZE)]
    #[tokio::test]
    async fn test_chunk_size_does_not_matter(#[case] chunk_size: usize) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.bin");
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        let streamed = Hasher::new(chunk_size).hash_file(&path).await.unwrap();
        assert_eq!(streamed, hash_bytes(&data));
    }

    #[tokio::test]
    async fn test_missing_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.txt");
        let err = Hasher::default().hash_file(&path).await.unwrap_err();
        assert!(err.is_not_found());
        assert!((*err).to_string().contains(&path.display().to_string()));
    }

    #[test]
    fn test_parse() {
        let parsed = ContentHash::parse(ABC).unwrap();
        assert_eq!(parsed.digest().len(), 64);
        assert_eq!(parsed.as_str(), ABC);
        assert!(ContentHash::parse("md5:abc").is_none());
        assert!(ContentHash::parse("sha256:ABC").is_none());
        assert!(ContentHash::parse(&EMPTY.to_uppercase()).is_none());
    }
}
