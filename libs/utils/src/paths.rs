//! Path helpers shared by sync-root configuration and the ignore engine.
//!
//! Grounded on `pclsync/ppath.c`'s `psync_get_home_dir` /
//! `psync_expand_home` — configured paths and ignore-path lists are taken
//! from user-editable text, so `~`/`$HOME` expansion has to happen exactly
//! once, at load time, rather than being silently assumed by every caller.

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};

/// Expands a single leading `$HOME` or `~` component; a path with neither
/// is returned unchanged. Unset `$HOME` is treated as "don't expand" rather
/// than an error, matching the original's fall back to the literal string.
pub fn expand_home(path: &str) -> Utf8PathBuf {
    let Some(home) = home_dir() else {
        return Utf8PathBuf::from(path);
    };

    if let Some(rest) = path.strip_prefix("$HOME") {
        join_rest(&home, rest)
    } else if let Some(rest) = path.strip_prefix('~') {
        join_rest(&home, rest)
    } else {
        Utf8PathBuf::from(path)
    }
}

fn join_rest(home: &Utf8Path, rest: &str) -> Utf8PathBuf {
    let rest = rest.strip_prefix('/').unwrap_or(rest);
    if rest.is_empty() {
        home.to_path_buf()
    } else {
        home.join(rest)
    }
}

fn home_dir() -> Option<Utf8PathBuf> {
    std::env::var_os("HOME")
        .map(std::path::PathBuf::from)
        .and_then(|p| Utf8PathBuf::try_from(p).ok())
}

/// Splits a semicolon-separated pattern/path list the way every
/// user-editable `setting` column in §6 is stored, trimming empty entries
/// left by trailing/doubled separators.
pub fn split_semicolon_list(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Hex-encoded SHA-256 of `text`, used to decide whether a pattern/path list
/// actually changed before paying to reparse and re-resolve it.
pub fn text_fingerprint(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_semicolon_list_trims_and_drops_empty() {
        let parsed = split_semicolon_list(" a/b ;; c/d;");
        assert_eq!(parsed, vec!["a/b".to_string(), "c/d".to_string()]);
    }

    #[test]
    fn text_fingerprint_changes_with_content() {
        assert_ne!(text_fingerprint("a"), text_fingerprint("b"));
        assert_eq!(text_fingerprint("a"), text_fingerprint("a"));
    }

    #[test]
    fn expand_home_leaves_unrelated_paths_alone() {
        assert_eq!(expand_home("/tmp/foo").as_str(), "/tmp/foo");
    }
}
