//! Scans a local file with a sliding window, looking for byte ranges whose
//! content already exists somewhere the server can copy from (an existing
//! remote file revision, or a prior partial upload).

use std::io::{self, Read};

use sha1::{Digest, Sha1};

use crate::adler::{adler32_fresh, adler32_roll};
use crate::table::ChecksumTable;

/// One confirmed match: `[local_offset, local_offset + len)` of the file
/// being scanned is byte-identical to `[source_offset, source_offset + len)`
/// of whatever file produced `table`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub local_offset: u64,
    pub source_offset: u64,
    pub len: u64,
}

/// Reads just enough of `reader` to keep the sliding window full, compacting
/// the buffer's consumed prefix away periodically instead of ring-indexing,
/// which keeps the scanning loop free of wraparound arithmetic.
struct Lookahead<R> {
    reader: R,
    buf: Vec<u8>,
    /// Index into `buf` of the current window's first (`out`) byte.
    pos: usize,
    eof: bool,
}

impl<R: Read> Lookahead<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    /// Guarantees `self.buf.len() - self.pos >= want` unless the stream hits
    /// EOF first, in which case it returns what's available.
    fn ensure(&mut self, want: usize) -> io::Result<()> {
        if self.eof || self.buf.len() - self.pos >= want {
            return Ok(());
        }
        if self.pos > 0 && self.pos > 4 * want {
            self.buf.drain(0..self.pos);
            self.pos = 0;
        }
        let mut chunk = [0u8; 65536];
        while !self.eof && self.buf.len() - self.pos < want {
            let n = self.reader.read(&mut chunk)?;
            if n == 0 {
                self.eof = true;
                break;
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    fn available(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn window(&self, offset: usize, len: usize) -> &[u8] {
        &self.buf[self.pos + offset..self.pos + offset + len]
    }

    fn byte_at(&self, offset: usize) -> u8 {
        self.buf[self.pos + offset]
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
    }
}

/// Scans `reader` (an independent view onto the byte range being uploaded,
/// already positioned at its start) for content matching blocks in `table`.
/// `table` has matched blocks removed as they are consumed, so a second
/// scan against a different source only needs to consider what remains.
pub fn scan_for_matches<R: Read>(
    reader: R,
    range_len: u64,
    table: &mut ChecksumTable,
    block_size: u32,
) -> io::Result<Vec<Match>> {
    let bs = block_size as usize;
    let mut matches = Vec::new();
    if range_len < bs as u64 || bs == 0 {
        return Ok(matches);
    }

    let mut ahead = Lookahead::new(reader);
    ahead.ensure(bs)?;
    if ahead.available() < bs {
        return Ok(matches);
    }

    let mut adler = adler32_fresh(ahead.window(0, bs));
    let mut local_offset: u64 = 0;

    while local_offset < range_len {
        ahead.ensure(bs + 1)?;
        let available = ahead.available() as u64;
        if available < bs as u64 {
            break;
        }

        if table.contains_adler(adler) {
            let window = ahead.window(0, bs);
            let digest = Sha1::digest(window);
            let mut sha1 = [0u8; 20];
            sha1.copy_from_slice(&digest);
            if let Some(found) = table.consume(adler, &sha1) {
                let source_offset = found.block_index as u64 * block_size as u64;
                matches.push(Match {
                    local_offset,
                    source_offset,
                    len: bs as u64,
                });
                // Jump to the next block boundary to avoid rediscovering
                // heavily overlapping matches, then reseed from scratch.
                let remaining_in_range = range_len - local_offset;
                if remaining_in_range < bs as u64 {
                    break;
                }
                ahead.advance(bs);
                local_offset += bs as u64;
                ahead.ensure(bs)?;
                if ahead.available() < bs {
                    break;
                }
                adler = adler32_fresh(ahead.window(0, bs));
                continue;
            }
        }

        if available <= bs as u64 {
            break;
        }
        let byte_out = ahead.byte_at(0);
        let byte_in = ahead.byte_at(bs);
        adler = adler32_roll(adler, byte_out, byte_in, block_size);
        ahead.advance(1);
        local_offset += 1;
    }

    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::BlockChecksum;
    use std::io::Cursor;

    fn sha1_of(data: &[u8]) -> [u8; 20] {
        let digest = Sha1::digest(data);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest);
        out
    }

    #[test]
    fn finds_prefix_match() {
        let block_size = 8u32;
        let old_block = b"AAAAAAAA".to_vec();
        let table_blocks = vec![BlockChecksum {
            adler: adler32_fresh(&old_block),
            sha1: sha1_of(&old_block),
        }];
        let mut table = ChecksumTable::build(table_blocks);

        let local = b"AAAAAAAABBBBBBBB".to_vec();
        let matches =
            scan_for_matches(Cursor::new(local.clone()), local.len() as u64, &mut table, block_size)
                .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].local_offset, 0);
        assert_eq!(matches[0].source_offset, 0);
        assert_eq!(matches[0].len, 8);
    }

    #[test]
    fn finds_match_not_aligned_to_local_block_boundary() {
        let block_size = 4u32;
        let needle = b"WXYZ".to_vec();
        let table_blocks = vec![BlockChecksum {
            adler: adler32_fresh(&needle),
            sha1: sha1_of(&needle),
        }];
        let mut table = ChecksumTable::build(table_blocks);

        let local = b"ab WXYZ cd".to_vec();
        let matches =
            scan_for_matches(Cursor::new(local.clone()), local.len() as u64, &mut table, block_size)
                .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].local_offset, 3);
    }

    #[test]
    fn no_match_when_content_differs() {
        let block_size = 4u32;
        let table_blocks = vec![BlockChecksum {
            adler: 123456,
            sha1: [0xAB; 20],
        }];
        let mut table = ChecksumTable::build(table_blocks);
        let local = b"completely unrelated content here".to_vec();
        let matches =
            scan_for_matches(Cursor::new(local.clone()), local.len() as u64, &mut table, block_size)
                .unwrap();
        assert!(matches.is_empty());
    }
}
