//! Streaming MD5, per the Design Note in `spec.md` §9: compute in
//! 1 MiB chunks and never hold the file open across a rename.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use openssl::hash::{Hasher, MessageDigest};
use thiserror::Error;

const CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("unable to open {path:?}: {source}")]
    Open { path: std::path::PathBuf, #[source] source: std::io::Error },

    #[error("read error while hashing {path:?}: {source}")]
    Read { path: std::path::PathBuf, #[source] source: std::io::Error },

    #[error("openssl error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),
}

/// Returns `(size_in_bytes, md5_digest)` for the file at `path`.
pub fn hash_file_md5(path: &Path) -> Result<(u64, [u8; 16]), HashError> {
    let mut file =
        File::open(path).map_err(|source| HashError::Open { path: path.to_owned(), source })?;

    let mut hasher = Hasher::new(MessageDigest::md5())?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|source| HashError::Read { path: path.to_owned(), source })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n])?;
        total += n as u64;
    }

    let digest = hasher.finish()?;
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    Ok((total, out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn hashes_match_a_known_md5() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello alpenhorn").unwrap();
        let (size, digest) = hash_file_md5(tmp.path()).unwrap();
        assert_eq!(size, 15);
        // md5("hello alpenhorn")
        assert_eq!(
            digest,
            [
                0x31, 0x4c, 0x1a, 0x64, 0x00, 0xac, 0x12, 0x9b, 0xdc, 0xf7, 0xce, 0xc4, 0x42, 0x37,
                0x89, 0x56,
            ]
        );
    }

    #[test]
    fn hashes_files_larger_than_one_chunk() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let data = vec![0x42u8; 2 * 1024 * 1024 + 17];
        tmp.write_all(&data).unwrap();
        let (size, _digest) = hash_file_md5(tmp.path()).unwrap();
        assert_eq!(size, data.len() as u64);
    }
}
