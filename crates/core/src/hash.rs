use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::Result;

/// How much of the head of the file participates in the identity hash.
pub const SAMPLE_BYTES: u64 = 64 * 1024;

/// Identity hash of a media file: BLAKE3 over the first 64 KiB plus the
/// decimal file size. Not a full-content hash; stable as long as the
/// header and size do not change, and cheap even for very large files.
/// Truncated copies get different hashes because the size is mixed in.
pub fn content_hash(path: &Path) -> Result<String> {
    let size = std::fs::metadata(path)?.len();
    let file = File::open(path)?;
    let mut reader = BufReader::new(file).take(SAMPLE_BYTES);
    let mut hasher = blake3::Hasher::new();

    let mut buf = [0u8; 1024 * 16];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    hasher.update(size.to_string().as_bytes());

    Ok(hasher.finalize().to_hex().to_string())
}

/// Read a file from start to finish, returning the byte count. Used to
/// prove a salvage candidate is readable end-to-end before it replaces an
/// original.
pub fn read_to_end_len(path: &Path) -> Result<u64> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut total = 0u64;

    let mut buf = [0u8; 1024 * 128];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        total += read as u64;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn hash_changes_when_header_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mkv");
        std::fs::write(&path, b"matroska header bytes").unwrap();
        let first = content_hash(&path).unwrap();

        std::fs::write(&path, b"different header bytes").unwrap();
        let second = content_hash(&path).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn hash_changes_when_tail_grows_past_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mkv");
        let head = vec![7u8; SAMPLE_BYTES as usize];
        std::fs::write(&path, &head).unwrap();
        let first = content_hash(&path).unwrap();

        // Same head, longer file: the size suffix must split them.
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"trailing data").unwrap();
        let second = content_hash(&path).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn identical_files_hash_identically() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.mkv");
        let b = dir.path().join("sub").join("a.mkv");
        std::fs::create_dir_all(b.parent().unwrap()).unwrap();
        std::fs::write(&a, b"same content").unwrap();
        std::fs::write(&b, b"same content").unwrap();
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }
}
