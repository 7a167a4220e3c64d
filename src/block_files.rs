/// Block File Reader
///
/// Iterates the node's blk*.dat files from a starting (file, offset) and
/// yields raw block bytes with their on-disk location. The node appends to
/// these files while we read, so the tail can be torn: a magic mismatch
/// resynchronizes by scanning forward, and a declared length running past
/// the end of the file means "no more data", not an error.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::ChainError;
use crate::types::BlockLocation;

/// Hard ceiling on a sane block; anything larger is a torn length field.
const MAX_BLOCK_SIZE: u32 = 8_000_000;

pub struct BlockFileReader {
    dir: PathBuf,
    magic: [u8; 4],
}

impl BlockFileReader {
    pub fn new(dir: &Path, magic: [u8; 4]) -> Self {
        Self {
            dir: dir.to_path_buf(),
            magic,
        }
    }

    pub fn file_path(&self, file_number: u16) -> PathBuf {
        self.dir.join(format!("blk{:05}.dat", file_number))
    }

    /// Lazy iteration over all blocks at or past `(file_number, offset)`.
    pub fn iter_from(&self, file_number: u16, offset: u64) -> BlockFileIter<'_> {
        BlockFileIter {
            reader: self,
            file_number,
            pos: offset as usize,
            buffer: None,
        }
    }

    /// Re-read one block for undo. The location must have come from a
    /// previous scan, so a short read here is store corruption.
    pub fn read_at(&self, loc: BlockLocation) -> Result<Vec<u8>, ChainError> {
        use std::io::{Seek, SeekFrom};
        let mut file = File::open(self.file_path(loc.file_number))?;
        file.seek(SeekFrom::Start(loc.offset))?;
        let mut data = vec![0u8; loc.size as usize];
        file.read_exact(&mut data)?;
        Ok(data)
    }
}

pub struct BlockFileIter<'a> {
    reader: &'a BlockFileReader,
    file_number: u16,
    pos: usize,
    buffer: Option<Vec<u8>>,
}

impl BlockFileIter<'_> {
    /// Where the next read would start; persisted as scan progress.
    pub fn position(&self) -> (u16, u64) {
        (self.file_number, self.pos as u64)
    }

    fn ensure_loaded(&mut self) -> bool {
        if self.buffer.is_none() {
            let path = self.reader.file_path(self.file_number);
            if !path.exists() {
                return false;
            }
            let mut data = Vec::new();
            match File::open(&path).and_then(|mut f| f.read_to_end(&mut data)) {
                Ok(_) => self.buffer = Some(data),
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "failed to read block file");
                    return false;
                }
            }
        }
        true
    }

    fn advance_file(&mut self) {
        debug!(file_number = self.file_number, "block file exhausted");
        self.file_number += 1;
        self.pos = 0;
        self.buffer = None;
    }
}

impl Iterator for BlockFileIter<'_> {
    type Item = (Vec<u8>, BlockLocation);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let magic = self.reader.magic;
            if !self.ensure_loaded() {
                return None;
            }
            let Some(data) = self.buffer.as_deref() else {
                return None;
            };

            // Resynchronize on the network magic. Zero padding and torn
            // partial writes at the tail simply never match.
            let mut pos = self.pos;
            let found = loop {
                if pos + 8 > data.len() {
                    break None;
                }
                if data[pos..pos + 4] == magic {
                    break Some(pos);
                }
                pos += 1;
            };

            let Some(start) = found else {
                self.advance_file();
                continue;
            };
            if start != self.pos {
                warn!(
                    file_number = self.file_number,
                    skipped = start - self.pos,
                    "resynchronized on network magic"
                );
            }

            let size = u32::from_le_bytes([
                data[start + 4],
                data[start + 5],
                data[start + 6],
                data[start + 7],
            ]);
            if size == 0 || size > MAX_BLOCK_SIZE {
                // Torn length field; skip the bogus magic and keep scanning.
                self.pos = start + 4;
                continue;
            }

            let body_start = start + 8;
            let body_end = body_start + size as usize;
            if body_end > data.len() {
                // Declared length past EOF: the node hasn't finished this
                // write. End of data for now.
                self.pos = start;
                return None;
            }

            let location = BlockLocation {
                file_number: self.file_number,
                offset: body_start as u64,
                size,
            };
            self.pos = body_end;
            return Some((data[body_start..body_end].to_vec(), location));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

    fn write_blk(dir: &Path, file_number: u16, chunks: &[&[u8]]) {
        let mut f = File::create(dir.join(format!("blk{:05}.dat", file_number))).unwrap();
        for chunk in chunks {
            f.write_all(chunk).unwrap();
        }
    }

    fn framed(block: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&(block.len() as u32).to_le_bytes());
        out.extend_from_slice(block);
        out
    }

    #[test]
    fn test_reads_blocks_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let b1 = vec![0x11u8; 100];
        let b2 = vec![0x22u8; 120];
        let b3 = vec![0x33u8; 90];
        write_blk(dir.path(), 0, &[&framed(&b1), &framed(&b2)]);
        write_blk(dir.path(), 1, &[&framed(&b3)]);

        let reader = BlockFileReader::new(dir.path(), MAGIC);
        let blocks: Vec<_> = reader.iter_from(0, 0).collect();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].0, b1);
        assert_eq!(blocks[1].0, b2);
        assert_eq!(blocks[2].0, b3);
        assert_eq!(blocks[2].1.file_number, 1);
        assert_eq!(blocks[2].1.offset, 8);
    }

    #[test]
    fn test_torn_tail_is_end_of_data() {
        let dir = tempfile::tempdir().unwrap();
        let b1 = vec![0x44u8; 64];
        let mut torn = framed(&[0x55u8; 500]);
        torn.truncate(torn.len() - 400); // body cut short
        write_blk(dir.path(), 0, &[&framed(&b1), &torn]);

        let reader = BlockFileReader::new(dir.path(), MAGIC);
        let mut iter = reader.iter_from(0, 0);
        assert!(iter.next().is_some());
        assert!(iter.next().is_none());
        // Progress points back at the torn frame for the next attempt.
        let (file, pos) = iter.position();
        assert_eq!(file, 0);
        assert_eq!(pos, 8 + 64);
    }

    #[test]
    fn test_resync_over_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let b1 = vec![0x66u8; 32];
        write_blk(dir.path(), 0, &[&[0xde, 0xad, 0xbe, 0xef, 0x00][..], &framed(&b1)]);

        let reader = BlockFileReader::new(dir.path(), MAGIC);
        let blocks: Vec<_> = reader.iter_from(0, 0).collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].0, b1);
    }

    #[test]
    fn test_zero_padded_tail() {
        let dir = tempfile::tempdir().unwrap();
        let b1 = vec![0x77u8; 48];
        write_blk(dir.path(), 0, &[&framed(&b1), &[0u8; 256][..]]);

        let reader = BlockFileReader::new(dir.path(), MAGIC);
        let blocks: Vec<_> = reader.iter_from(0, 0).collect();
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn test_read_at_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let b1 = vec![0x88u8; 77];
        write_blk(dir.path(), 0, &[&framed(&b1)]);

        let reader = BlockFileReader::new(dir.path(), MAGIC);
        let (block, loc) = reader.iter_from(0, 0).next().unwrap();
        assert_eq!(reader.read_at(loc).unwrap(), block);
    }
}
