//! Turns confirmed block matches into a coalesced transfer plan: a
//! sequential list of ranges the caller must either send as raw bytes
//! (`Transfer`) or ask the server to copy from an existing source (`Copy`).

use std::io::{Read, Seek, SeekFrom};

use crate::scan::{scan_for_matches, Match};
use crate::table::ChecksumTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action<S> {
    Transfer,
    Copy { source: S, source_offset: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<S> {
    pub offset: u64,
    pub len: u64,
    pub action: Action<S>,
}

/// A plan over `[0, total_len)` of the file being uploaded, initially one
/// big `Transfer` segment, refined in place as each candidate source is
/// scanned.
#[derive(Debug, Clone)]
pub struct Plan<S> {
    segments: Vec<Segment<S>>,
}

impl<S: Copy + PartialEq> Plan<S> {
    pub fn new(total_len: u64) -> Self {
        Self {
            segments: vec![Segment {
                offset: 0,
                len: total_len,
                action: Action::Transfer,
            }],
        }
    }

    pub fn segments(&self) -> &[Segment<S>] {
        &self.segments
    }

    /// Scans every range still marked `Transfer` (and at least one block
    /// long) against `table`, replacing matched sub-ranges with `Copy`
    /// segments pointing at `source`. `table` is mutated as blocks are
    /// claimed, so a later call with a different source only considers
    /// what's left.
    pub fn refine_with<R: Read + Seek>(
        &mut self,
        reader: &mut R,
        table: &mut ChecksumTable,
        block_size: u32,
        source: S,
    ) -> std::io::Result<()> {
        let candidates: Vec<(u64, u64)> = self
            .segments
            .iter()
            .filter(|s| s.action == Action::Transfer && s.len >= block_size as u64)
            .map(|s| (s.offset, s.len))
            .collect();

        for (offset, len) in candidates {
            reader.seek(SeekFrom::Start(offset))?;
            let matches = scan_for_matches(&mut *reader, len, table, block_size)?;
            for m in matches {
                self.apply_match(offset + m.local_offset, m, source);
            }
        }
        self.coalesce();
        Ok(())
    }

    fn apply_match(&mut self, abs_offset: u64, m: Match, source: S) {
        let Some(i) = self.segments.iter().position(|s| {
            s.action == Action::Transfer
                && s.offset <= abs_offset
                && abs_offset + m.len <= s.offset + s.len
        }) else {
            // The match fell outside any still-pending Transfer segment
            // (can happen if an earlier source already claimed an
            // overlapping range); ignore it rather than corrupt the plan.
            return;
        };
        let seg = self.segments[i];
        let mut replacement = Vec::with_capacity(3);
        if abs_offset > seg.offset {
            replacement.push(Segment {
                offset: seg.offset,
                len: abs_offset - seg.offset,
                action: Action::Transfer,
            });
        }
        replacement.push(Segment {
            offset: abs_offset,
            len: m.len,
            action: Action::Copy {
                source,
                source_offset: m.source_offset,
            },
        });
        let tail_offset = abs_offset + m.len;
        let seg_end = seg.offset + seg.len;
        if tail_offset < seg_end {
            replacement.push(Segment {
                offset: tail_offset,
                len: seg_end - tail_offset,
                action: Action::Transfer,
            });
        }
        self.segments.splice(i..i + 1, replacement);
    }

    /// Merges adjacent segments of the same kind: `Transfer`+`Transfer`
    /// always, `Copy`+`Copy` only when the source and its offset line up
    /// contiguously.
    fn coalesce(&mut self) {
        let mut merged: Vec<Segment<S>> = Vec::with_capacity(self.segments.len());
        for seg in self.segments.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.offset + last.len == seg.offset {
                    let mergeable = match (last.action, seg.action) {
                        (Action::Transfer, Action::Transfer) => true,
                        (
                            Action::Copy {
                                source: s1,
                                source_offset: o1,
                            },
                            Action::Copy {
                                source: s2,
                                source_offset: o2,
                            },
                        ) => s1 == s2 && o1 + last.len == o2,
                        _ => false,
                    };
                    if mergeable {
                        last.len += seg.len;
                        continue;
                    }
                }
            }
            merged.push(seg);
        }
        self.segments = merged;
    }

    /// Splits any `Copy` segment longer than `max_len` so no single
    /// server-side copy request exceeds the server's per-request budget.
    pub fn split_oversized_copies(&mut self, max_len: u64) {
        if max_len == 0 {
            return;
        }
        let mut out = Vec::with_capacity(self.segments.len());
        for seg in self.segments.drain(..) {
            match seg.action {
                Action::Copy {
                    source,
                    source_offset,
                } if seg.len > max_len => {
                    let mut done = 0u64;
                    while done < seg.len {
                        let chunk = (seg.len - done).min(max_len);
                        out.push(Segment {
                            offset: seg.offset + done,
                            len: chunk,
                            action: Action::Copy {
                                source,
                                source_offset: source_offset + done,
                            },
                        });
                        done += chunk;
                    }
                }
                _ => out.push(seg),
            }
        }
        self.segments = out;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::BlockChecksum;
    use std::io::Cursor;

    #[test]
    fn whole_file_transfer_when_no_matches() {
        let plan: Plan<u32> = Plan::new(100);
        assert_eq!(plan.segments().len(), 1);
        assert_eq!(plan.segments()[0].action, Action::Transfer);
    }

    #[test]
    fn refine_splits_out_a_copy_range() {
        let block_size = 4u32;
        let content = b"AAAA____BBBB".to_vec();
        let block_a = crate::adler::adler32_fresh(b"AAAA");
        let block_b = crate::adler::adler32_fresh(b"BBBB");
        let sha_a = {
            use sha1::{Digest, Sha1};
            let d = Sha1::digest(b"AAAA");
            let mut out = [0u8; 20];
            out.copy_from_slice(&d);
            out
        };
        let sha_b = {
            use sha1::{Digest, Sha1};
            let d = Sha1::digest(b"BBBB");
            let mut out = [0u8; 20];
            out.copy_from_slice(&d);
            out
        };
        let mut table = ChecksumTable::build(vec![
            BlockChecksum {
                adler: block_a,
                sha1: sha_a,
            },
            BlockChecksum {
                adler: block_b,
                sha1: sha_b,
            },
        ]);

        let mut plan: Plan<u32> = Plan::new(content.len() as u64);
        let mut reader = Cursor::new(content.clone());
        plan.refine_with(&mut reader, &mut table, block_size, 1).unwrap();

        let copies: Vec<_> = plan
            .segments()
            .iter()
            .filter(|s| matches!(s.action, Action::Copy { .. }))
            .collect();
        assert_eq!(copies.len(), 2);
        assert_eq!(copies[0].offset, 0);
        assert_eq!(copies[1].offset, 8);
    }

    #[test]
    fn split_oversized_copies_chunks_source_offsets() {
        let mut plan: Plan<u32> = Plan {
            segments: vec![Segment {
                offset: 0,
                len: 10,
                action: Action::Copy {
                    source: 7,
                    source_offset: 1000,
                },
            }],
        };
        plan.split_oversized_copies(4);
        assert_eq!(plan.segments().len(), 3);
        assert_eq!(
            plan.segments()[1].action,
            Action::Copy {
                source: 7,
                source_offset: 1004
            }
        );
        assert_eq!(plan.segments()[2].len, 2);
    }
}
