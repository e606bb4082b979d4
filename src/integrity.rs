//! Checksum helpers shared by backup, restore, and export.

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// SHA-256 of an in-memory buffer, lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// SHA-256 of a file, streamed in 64 KiB chunks.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("open for hashing: {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Sidecar path for an archive: `<path>.sha256`.
pub fn sidecar_path(archive: &Path) -> PathBuf {
    let mut name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".sha256");
    archive.with_file_name(name)
}

/// Write a `sha256sum`-compatible sidecar: `<hex>  <filename>\n`.
pub fn write_sidecar(archive: &Path) -> Result<String> {
    let digest = file_sha256(archive)?;
    let name = archive
        .file_name()
        .ok_or_else(|| anyhow!("archive has no file name: {}", archive.display()))?
        .to_string_lossy();
    std::fs::write(sidecar_path(archive), format!("{}  {}\n", digest, name))?;
    Ok(digest)
}

/// Read the expected digest out of a sidecar file.
pub fn read_sidecar(sidecar: &Path) -> Result<String> {
    let content = std::fs::read_to_string(sidecar)
        .with_context(|| format!("read sidecar: {}", sidecar.display()))?;
    content
        .split_whitespace()
        .next()
        .map(|s| s.to_lowercase())
        .filter(|s| s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| anyhow!("malformed sidecar: {}", sidecar.display()))
}

/// Recompute the archive digest and compare against its sidecar.
pub fn verify_sidecar(archive: &Path) -> Result<()> {
    let expected = read_sidecar(&sidecar_path(archive))?;
    let actual = file_sha256(archive)?;
    if expected != actual {
        return Err(anyhow!(
            "checksum mismatch for {}: expected {} got {}",
            archive.display(),
            expected,
            actual
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        // sha256("") is the well-known empty digest
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_file_hash_matches_buffer_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, b"resilience").unwrap();
        assert_eq!(file_sha256(&path).unwrap(), sha256_hex(b"resilience"));
    }

    #[test]
    fn test_sidecar_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("backup_1.tar.gz");
        std::fs::write(&archive, b"payload").unwrap();

        let digest = write_sidecar(&archive).unwrap();
        assert_eq!(read_sidecar(&sidecar_path(&archive)).unwrap(), digest);
        verify_sidecar(&archive).unwrap();
    }

    #[test]
    fn test_verify_fails_on_tamper() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("backup_2.tar.gz");
        std::fs::write(&archive, b"payload").unwrap();
        write_sidecar(&archive).unwrap();

        std::fs::write(&archive, b"tampered").unwrap();
        assert!(verify_sidecar(&archive).is_err());
    }

    #[test]
    fn test_malformed_sidecar_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = dir.path().join("bad.sha256");
        std::fs::write(&sidecar, "not-a-digest  file\n").unwrap();
        assert!(read_sidecar(&sidecar).is_err());
    }
}
