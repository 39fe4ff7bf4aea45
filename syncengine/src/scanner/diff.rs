//! The per-folder diff algorithm and cross-pass rename detection of §4.5
//! steps 1-4: a merge-walk of two name-sorted sequences (on-disk vs
//! catalog), classifying each name into one of the nine per-pass bags,
//! followed by `extract_repeating` pairing deleted/new entries that share
//! a rename key into renamed-from/renamed-to bags.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::hash::Hash;

use crate::catalog::{LocalFile, LocalFolder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    File,
    Dir,
}

/// One entry read directly from the filesystem during a folder listing.
#[derive(Debug, Clone)]
pub struct DiskEntry {
    pub name: String,
    pub kind: Kind,
    pub inode: u64,
    pub device_id: u64,
    pub size: u64,
    pub mtime: i64,
}

#[derive(Debug, Clone)]
enum CatEntry {
    File(LocalFile),
    Folder(LocalFolder),
}

impl CatEntry {
    fn kind(&self) -> Kind {
        match self {
            CatEntry::File(_) => Kind::File,
            CatEntry::Folder(_) => Kind::Dir,
        }
    }

    fn name(&self) -> &str {
        match self {
            CatEntry::File(f) => &f.name,
            CatEntry::Folder(f) => &f.name,
        }
    }
}

/// The nine bags §4.5 step 3 asks for, for one folder level.
#[derive(Debug, Default)]
pub struct FolderDiff {
    pub new_files: Vec<DiskEntry>,
    pub deleted_files: Vec<LocalFile>,
    pub new_folders: Vec<DiskEntry>,
    pub deleted_folders: Vec<LocalFolder>,
    /// `(catalog row, fresh stat)` pairs whose content must be re-uploaded
    /// in place — same catalog row, new size/mtime/inode.
    pub modified_files: Vec<(LocalFile, DiskEntry)>,
    /// Entries unchanged or recursable as-is; not actioned, but the
    /// scanner still needs to recurse into unchanged on-disk directories.
    pub unchanged_folders: Vec<(LocalFolder, DiskEntry)>,
}

/// Runs the merge-walk of §4.5 steps 1-2 for one directory level.
pub fn diff_folder(disk: &[DiskEntry], cat_folders: &[LocalFolder], cat_files: &[LocalFile]) -> FolderDiff {
    let mut catalog: BTreeMap<String, CatEntry> = BTreeMap::new();
    for f in cat_folders {
        catalog.insert(f.name.clone(), CatEntry::Folder(f.clone()));
    }
    for f in cat_files {
        catalog.insert(f.name.clone(), CatEntry::File(f.clone()));
    }
    let disk_map: BTreeMap<String, DiskEntry> = disk.iter().cloned().map(|e| (e.name.clone(), e)).collect();

    let mut diff = FolderDiff::default();
    let mut names: Vec<&String> = catalog.keys().chain(disk_map.keys()).collect();
    names.sort();
    names.dedup();

    for name in names {
        match (catalog.get(name), disk_map.get(name)) {
            (Some(cat), Some(disk_entry)) if cat.kind() == disk_entry.kind => match cat {
                CatEntry::File(f) => {
                    if f.size == disk_entry.size && f.mtime == disk_entry.mtime && f.inode == disk_entry.inode {
                        // unchanged, nothing to do
                    } else {
                        diff.modified_files.push((f.clone(), disk_entry.clone()));
                    }
                }
                CatEntry::Folder(f) => {
                    if f.device_id == disk_entry.device_id && f.inode == disk_entry.inode {
                        diff.unchanged_folders.push((f.clone(), disk_entry.clone()));
                    } else {
                        // identity changed under an unchanged name: treat as
                        // delete-then-new so rename detection can still pair
                        // it against whatever else moved this pass.
                        diff.deleted_folders.push(f.clone());
                        diff.new_folders.push(disk_entry.clone());
                    }
                }
            },
            (Some(cat), Some(disk_entry)) => {
                // equal name, different kind: deleted-then-new
                match cat {
                    CatEntry::File(f) => diff.deleted_files.push(f.clone()),
                    CatEntry::Folder(f) => diff.deleted_folders.push(f.clone()),
                }
                match disk_entry.kind {
                    Kind::File => diff.new_files.push(disk_entry.clone()),
                    Kind::Dir => diff.new_folders.push(disk_entry.clone()),
                }
            }
            (Some(cat), None) => match cat {
                CatEntry::File(f) => diff.deleted_files.push(f.clone()),
                CatEntry::Folder(f) => diff.deleted_folders.push(f.clone()),
            },
            (None, Some(disk_entry)) => match disk_entry.kind {
                Kind::File => diff.new_files.push(disk_entry.clone()),
                Kind::Dir => diff.new_folders.push(disk_entry.clone()),
            },
            (None, None) => unreachable!("name came from one of the two maps"),
        }
    }
    diff
}

/// `extract_repeating`: pairs items from `from` and `to` sharing a rename
/// key, removing matched items from both input vectors and returning the
/// paired (from, to) list in discovery order.
pub fn extract_repeating<T, U, K: Eq + Hash + Clone>(
    from: &mut Vec<T>,
    to: &mut Vec<U>,
    key_from: impl Fn(&T) -> K,
    key_to: impl Fn(&U) -> K,
) -> Vec<(T, U)> {
    let mut to_by_key: HashMap<K, Vec<usize>> = HashMap::new();
    for (i, item) in to.iter().enumerate() {
        to_by_key.entry(key_to(item)).or_default().push(i);
    }

    let mut paired = Vec::new();
    let mut consumed_to = vec![false; to.len()];
    let mut keep_from = Vec::with_capacity(from.len());

    for item in from.drain(..) {
        let key = key_from(&item);
        let matched_idx = to_by_key
            .get_mut(&key)
            .and_then(|idxs| idxs.iter().position(|&i| !consumed_to[i]).map(|pos| idxs.remove(pos)));
        match matched_idx {
            Some(idx) => {
                consumed_to[idx] = true;
                paired.push((item, idx));
            }
            None => keep_from.push(item),
        }
    }
    *from = keep_from;

    let mut taken_to: Vec<Option<U>> = to.drain(..).map(Some).collect();
    let mut result = Vec::with_capacity(paired.len());
    let mut keep_to = Vec::new();
    for (i, slot) in taken_to.iter_mut().enumerate() {
        if !consumed_to[i] {
            if let Some(v) = slot.take() {
                keep_to.push(v);
            }
        }
    }
    for (item, idx) in paired {
        if let Some(v) = taken_to[idx].take() {
            result.push((item, v));
        }
    }
    *to = keep_to;
    result
}

/// Rename key for folders: inode equality alone (§4.5: "using inode
/// equality as the rename key").
pub fn folder_rename_key(f: &LocalFolder) -> u64 {
    f.inode
}

pub fn folder_rename_key_disk(e: &DiskEntry) -> u64 {
    e.inode
}

/// Rename key for files: `(size, inode, mtime)` — inode alone is
/// insufficient because some filesystems implement move-by-copy.
pub fn file_rename_key(f: &LocalFile) -> (u64, u64, i64) {
    (f.size, f.inode, f.mtime)
}

pub fn file_rename_key_disk(e: &DiskEntry) -> (u64, u64, i64) {
    (e.size, e.inode, e.mtime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use utils::id::{LocalFileId, LocalFolderId, SyncId};

    fn file(name: &str, size: u64, inode: u64, mtime: i64) -> LocalFile {
        LocalFile {
            id: LocalFileId(1),
            syncid: SyncId(1),
            parent_id: LocalFolderId(1),
            name: name.into(),
            inode,
            size,
            mtime,
            mtime_native: mtime,
            checksum: None,
            file_id: None,
            hash: None,
        }
    }

    fn disk_file(name: &str, size: u64, inode: u64, mtime: i64) -> DiskEntry {
        DiskEntry {
            name: name.into(),
            kind: Kind::File,
            inode,
            device_id: 1,
            size,
            mtime,
        }
    }

    #[test]
    fn unchanged_file_produces_no_action() {
        let cat = vec![file("a.txt", 10, 5, 100)];
        let disk = vec![disk_file("a.txt", 10, 5, 100)];
        let diff = diff_folder(&disk, &[], &cat);
        assert!(diff.modified_files.is_empty());
        assert!(diff.new_files.is_empty());
        assert!(diff.deleted_files.is_empty());
    }

    #[test]
    fn changed_stat_is_a_modification_not_delete_and_new() {
        let cat = vec![file("a.txt", 10, 5, 100)];
        let disk = vec![disk_file("a.txt", 20, 5, 200)];
        let diff = diff_folder(&disk, &[], &cat);
        assert_eq!(diff.modified_files.len(), 1);
        assert!(diff.new_files.is_empty());
        assert!(diff.deleted_files.is_empty());
    }

    #[test]
    fn name_only_on_disk_is_new_name_only_in_catalog_is_deleted() {
        let cat = vec![file("gone.txt", 1, 1, 1)];
        let disk = vec![disk_file("new.txt", 2, 2, 2)];
        let diff = diff_folder(&disk, &[], &cat);
        assert_eq!(diff.new_files.len(), 1);
        assert_eq!(diff.deleted_files.len(), 1);
    }

    #[test]
    fn extract_repeating_pairs_rename_candidates_by_key() {
        let mut deleted = vec![file("a/x.bin", 100, 77, 5)];
        let mut new = vec![disk_file("b/x.bin", 100, 77, 5)];
        let pairs = extract_repeating(&mut deleted, &mut new, file_rename_key, file_rename_key_disk);
        assert_eq!(pairs.len(), 1);
        assert!(deleted.is_empty());
        assert!(new.is_empty());
    }

    #[test]
    fn extract_repeating_leaves_unmatched_items_in_place() {
        let mut deleted = vec![file("a.txt", 1, 1, 1), file("b.txt", 2, 2, 2)];
        let mut new = vec![disk_file("c.txt", 2, 2, 2)];
        let pairs = extract_repeating(&mut deleted, &mut new, file_rename_key, file_rename_key_disk);
        assert_eq!(pairs.len(), 1);
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].name, "a.txt");
        assert!(new.is_empty());
    }
}
