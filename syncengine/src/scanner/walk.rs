//! Filesystem-facing half of the scanner: listing one directory's entries
//! with the `(device, inode)` pair §4.5's diff and rename-detection logic
//! needs, using `std::os::unix::fs::MetadataExt` the way the rest of this
//! workspace reaches for platform metadata (see `utils::lock_file`'s use
//! of `nix` for the same class of concern).

use std::fs;
use std::os::unix::fs::MetadataExt;

use camino::Utf8Path;

use crate::scanner::diff::{DiskEntry, Kind};

pub fn list_disk_entries(path: &Utf8Path) -> std::io::Result<Vec<DiskEntry>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(path.as_std_path())? {
        let entry = entry?;
        let name = match entry.file_name().into_string() {
            Ok(n) => n,
            // Non-UTF-8 names can't be represented in the catalog's TEXT
            // columns; the scanner treats them the same as a reserved
            // name and never uploads them.
            Err(_) => continue,
        };
        let meta = entry.metadata()?;
        let kind = if meta.is_dir() { Kind::Dir } else { Kind::File };
        out.push(DiskEntry {
            name,
            kind,
            inode: meta.ino(),
            device_id: meta.dev(),
            size: meta.len(),
            mtime: meta.mtime(),
        });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

pub fn stat_device_inode(path: &Utf8Path) -> Option<(u64, u64)> {
    let meta = fs::metadata(path.as_std_path()).ok()?;
    Some((meta.dev(), meta.ino()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn list_disk_entries_sorts_by_name_and_reads_stat_fields() {
        let dir = camino_tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"bb").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let entries = list_disk_entries(dir.path()).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
        assert_eq!(entries[0].size, 1);
    }

    #[test]
    fn stat_device_inode_returns_none_for_missing_path() {
        let missing = Utf8PathBuf::from("/definitely/not/a/real/path/xyz");
        assert!(stat_device_inode(&missing).is_none());
    }
}
