//! Path-ignore engine (H, §4.8): a name-glob filter matched per path
//! component during scanning, and a `(deviceid, inode)` path filter
//! resolved once at load time. Both are gated on their source text's
//! SHA-256 fingerprint (`utils::paths::text_fingerprint`) so an unchanged
//! `ignorepatterns`/`ignorepaths` setting costs nothing to re-check.

use std::time::{Duration, Instant};

use camino::Utf8Path;
use utils::paths::{expand_home, split_semicolon_list, text_fingerprint};

const RELOAD_MAX_AGE: Duration = Duration::from_secs(3600);

/// Matches a single `*`/`?` glob pattern against one path component (never
/// a full path — `*` does not cross `/`). Hand-rolled rather than pulled
/// from a crate: the alphabet is two wildcard characters and the whole
/// thing is a dozen lines, the kind of bespoke matcher this codebase
/// writes by hand elsewhere (see `blocksync`'s own checksum table) rather
/// than reach for a dependency.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    fn rec(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => rec(&p[1..], n) || (!n.is_empty() && rec(p, &n[1..])),
            (Some(b'?'), Some(_)) => rec(&p[1..], &n[1..]),
            (Some(pc), Some(nc)) if pc == nc => rec(&p[1..], &n[1..]),
            _ => false,
        }
    }
    rec(pattern.as_bytes(), name.as_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Copy)]
pub struct DeviceInode {
    pub device_id: u64,
    pub inode: u64,
}

/// Reloadable filter over a semicolon-separated pattern list (names) or
/// path list (directories), re-resolved only when the source text's
/// fingerprint changes or the cache is older than an hour.
pub struct IgnoreFilter {
    patterns: Vec<String>,
    paths: Vec<DeviceInode>,
    pattern_fingerprint: String,
    path_fingerprint: String,
    loaded_at: Instant,
}

impl IgnoreFilter {
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            paths: Vec::new(),
            pattern_fingerprint: text_fingerprint(""),
            path_fingerprint: text_fingerprint(""),
            loaded_at: Instant::now(),
        }
    }

    fn stale(&self) -> bool {
        self.loaded_at.elapsed() > RELOAD_MAX_AGE
    }

    /// Reloads `patterns`/`paths` if either source string changed or the
    /// cache aged out; `stat_fn` resolves a directory to its
    /// `(device, inode)` pair (swappable in tests).
    pub fn reload(
        &mut self,
        pattern_list: &str,
        path_list: &str,
        stat_fn: impl Fn(&Utf8Path) -> Option<DeviceInode>,
    ) {
        let new_pattern_fp = text_fingerprint(pattern_list);
        let new_path_fp = text_fingerprint(path_list);
        let changed = new_pattern_fp != self.pattern_fingerprint || new_path_fp != self.path_fingerprint;
        if !changed && !self.stale() {
            return;
        }

        self.patterns = split_semicolon_list(pattern_list);
        self.paths = split_semicolon_list(path_list)
            .into_iter()
            .filter_map(|raw| stat_fn(&expand_home(&raw)))
            .collect();
        self.pattern_fingerprint = new_pattern_fp;
        self.path_fingerprint = new_path_fp;
        self.loaded_at = Instant::now();
    }

    /// True if `name` (one path component, not a full path) matches any
    /// configured glob.
    pub fn name_ignored(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| wildcard_match(p, name))
    }

    /// True if `(device, inode)` is one of the resolved ignore directories.
    /// O(n), but n is small per §4.8.
    pub fn path_ignored(&self, candidate: DeviceInode) -> bool {
        self.paths.contains(&candidate)
    }
}

/// Name-policy predicate (§4.5 "name policy"): names that must never be
/// uploaded regardless of user-configured patterns — invalid UTF-8 (not
/// representable here since `&str` already excludes it, checked by the
/// scanner before this is called), OS-reserved device names on Windows
/// hosts this client may also run against, and editor/temp-file suffixes.
pub fn is_reserved_name(name: &str) -> bool {
    const RESERVED: &[&str] = &[
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "LPT1", "LPT2", "LPT3", "LPT4",
    ];
    let upper = name.to_ascii_uppercase();
    let stem = upper.split('.').next().unwrap_or(&upper);
    RESERVED.contains(&stem) || name.ends_with('~') || name.ends_with(".tmp") || name.ends_with(".swp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_star_and_question_mark() {
        assert!(wildcard_match("*.log", "debug.log"));
        assert!(wildcard_match("file?.txt", "file1.txt"));
        assert!(!wildcard_match("file?.txt", "file12.txt"));
    }

    #[test]
    fn reload_skips_work_when_fingerprint_unchanged() {
        let mut filter = IgnoreFilter::empty();
        filter.reload("*.tmp", "", |_| None);
        let loaded_at = filter.loaded_at;
        filter.reload("*.tmp", "", |_| None);
        assert_eq!(filter.loaded_at, loaded_at, "unchanged text must not trigger a reload");
    }

    #[test]
    fn reload_picks_up_changed_patterns() {
        let mut filter = IgnoreFilter::empty();
        filter.reload("*.tmp", "", |_| None);
        assert!(filter.name_ignored("x.tmp"));
        filter.reload("*.bak", "", |_| None);
        assert!(!filter.name_ignored("x.tmp"));
        assert!(filter.name_ignored("x.bak"));
    }

    #[test]
    fn path_filter_resolves_via_injected_stat_fn() {
        let mut filter = IgnoreFilter::empty();
        filter.reload("", "/ignored/dir", |_| {
            Some(DeviceInode {
                device_id: 1,
                inode: 99,
            })
        });
        assert!(filter.path_ignored(DeviceInode {
            device_id: 1,
            inode: 99
        }));
        assert!(!filter.path_ignored(DeviceInode {
            device_id: 1,
            inode: 100
        }));
    }

    #[test]
    fn reserved_names_and_temp_suffixes_are_flagged() {
        assert!(is_reserved_name("CON"));
        assert!(is_reserved_name("notes.tmp"));
        assert!(!is_reserved_name("report.txt"));
    }
}
