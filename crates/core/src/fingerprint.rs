use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::Result;

pub const DEFAULT_SAMPLE_BYTES: u64 = 64 * 1024;
pub const FULL_HASH_BLOCK_BYTES: usize = 1024 * 1024;

/// SHA-256 over the first and last `sample_size` bytes of a file.
///
/// Files shorter than `2 * sample_size` are hashed whole, once. A `sample_size` of 0
/// degrades to [`full_hash`]. The digest is a cheap duplicate-detection key, not an
/// integrity guarantee.
pub fn sample_fingerprint(path: &Path, sample_size: u64) -> Result<String> {
    if sample_size == 0 {
        return full_hash(path);
    }

    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < sample_size.saturating_mul(2) {
        return hash_reader(&mut file);
    }

    let window = usize::try_from(sample_size).unwrap_or(usize::MAX);
    let mut buf = vec![0u8; window];
    let mut hasher = Sha256::new();

    file.read_exact(&mut buf)?;
    hasher.update(&buf);

    file.seek(SeekFrom::Start(len - sample_size))?;
    file.read_exact(&mut buf)?;
    hasher.update(&buf);

    Ok(hex::encode(hasher.finalize()))
}

/// Whole-file SHA-256, streamed in 1 MiB blocks.
pub fn full_hash(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    hash_reader(&mut file)
}

fn hash_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; FULL_HASH_BLOCK_BYTES];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    #[test]
    fn small_file_is_hashed_whole_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.bin");
        std::fs::write(&path, b"hello world").unwrap();

        let fp = sample_fingerprint(&path, 8).unwrap();
        assert_eq!(fp, sha256_hex(b"hello world"));
        assert_eq!(fp, full_hash(&path).unwrap());
    }

    #[test]
    fn large_file_hashes_head_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("large.bin");
        let data: Vec<u8> = (0..100u32).map(|i| i as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let fp = sample_fingerprint(&path, 16).unwrap();
        let mut expected = data[..16].to_vec();
        expected.extend_from_slice(&data[84..]);
        assert_eq!(fp, sha256_hex(&expected));
        assert_ne!(fp, full_hash(&path).unwrap());
    }

    #[test]
    fn middle_bytes_do_not_affect_sample() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        let mut data = vec![7u8; 4096];
        std::fs::write(&a, &data).unwrap();
        data[2048] = 8;
        std::fs::write(&b, &data).unwrap();

        assert_eq!(
            sample_fingerprint(&a, 512).unwrap(),
            sample_fingerprint(&b, 512).unwrap()
        );
        assert_ne!(full_hash(&a).unwrap(), full_hash(&b).unwrap());
    }

    #[test]
    fn unreadable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sample_fingerprint(&dir.path().join("nope"), 16).is_err());
        assert!(full_hash(&dir.path().join("nope")).is_err());
    }
}
