//! Tar + gzip archive handling for backups.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::path::Path;
use tar::{Archive, Builder};

/// Pack a directory into `<dest>.tar.gz` with the directory name as the
/// archive's inner root.
pub fn pack_dir(src: &Path, dest: &Path) -> Result<u64> {
    let root = src
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("archive source has no name: {}", src.display()))?;
    let file = File::create(dest)
        .with_context(|| format!("create archive: {}", dest.display()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);
    builder
        .append_dir_all(root, src)
        .with_context(|| format!("pack {}", src.display()))?;
    builder.into_inner()?.finish()?;
    Ok(std::fs::metadata(dest)?.len())
}

/// Extract an archive into a directory.
pub fn unpack(archive: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let file = File::open(archive)
        .with_context(|| format!("open archive: {}", archive.display()))?;
    let mut tar = Archive::new(GzDecoder::new(file));
    tar.unpack(dest)
        .with_context(|| format!("unpack {}", archive.display()))?;
    Ok(())
}

/// Relative paths of every entry in the archive.
pub fn list_entries(archive: &Path) -> Result<Vec<String>> {
    let file = File::open(archive)
        .with_context(|| format!("open archive: {}", archive.display()))?;
    let mut tar = Archive::new(GzDecoder::new(file));
    let mut names = Vec::new();
    for entry in tar.entries()? {
        let entry = entry?;
        names.push(entry.path()?.to_string_lossy().into_owned());
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("backup_1");
        std::fs::create_dir_all(src.join("configs")).unwrap();
        std::fs::write(src.join("configs/app.toml"), "a = 1\n").unwrap();
        std::fs::write(src.join("manifest.json"), "{}").unwrap();

        let archive = dir.path().join("backup_1.tar.gz");
        let size = pack_dir(&src, &archive).unwrap();
        assert!(size > 0);

        let out = dir.path().join("restored");
        unpack(&archive, &out).unwrap();
        assert_eq!(
            std::fs::read_to_string(out.join("backup_1/configs/app.toml")).unwrap(),
            "a = 1\n"
        );
    }

    #[test]
    fn test_list_entries_includes_inner_root() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("backup_2");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("BACKUP_MANIFEST.json"), "{}").unwrap();

        let archive = dir.path().join("backup_2.tar.gz");
        pack_dir(&src, &archive).unwrap();

        let entries = list_entries(&archive).unwrap();
        assert!(entries
            .iter()
            .any(|e| e == "backup_2/BACKUP_MANIFEST.json"));
    }
}
