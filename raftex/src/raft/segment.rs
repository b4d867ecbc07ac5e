//! Append-only log segment files.
//!
//! A segment holds a contiguous run of entries. On disk it is a fixed header
//! (first stored index + entry count) followed by length-prefixed frames;
//! positions are rebuilt by scanning on open.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const HEADER_SIZE: u64 = 16;
const FRAME_HEADER_SIZE: u64 = 8;

#[derive(Debug, Serialize, Deserialize)]
struct SegmentHeader {
    first_index: u64,
    count: u64,
}

#[derive(Debug)]
pub struct Segment {
    file: File,
    path: PathBuf,
    /// Index of the first stored entry; 0 until the first append.
    first_index: u64,
    count: u64,
    positions: BTreeMap<u64, u64>,
}

impl Segment {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut segment = Segment {
            file,
            path: path.as_ref().to_path_buf(),
            first_index: 0,
            count: 0,
            positions: BTreeMap::new(),
        };

        if segment.file.metadata()?.len() == 0 {
            segment.write_header()?;
        } else {
            segment.read_header()?;
            segment.rebuild_positions()?;
        }

        Ok(segment)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn first_index(&self) -> Option<u64> {
        (self.count > 0).then_some(self.first_index)
    }

    pub fn last_index(&self) -> Option<u64> {
        (self.count > 0).then_some(self.first_index + self.count - 1)
    }

    fn write_header(&mut self) -> io::Result<()> {
        let header = SegmentHeader {
            first_index: self.first_index,
            count: self.count,
        };
        let bytes =
            bincode::serialize(&header).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&bytes)?;
        Ok(())
    }

    fn read_header(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut bytes = vec![0u8; HEADER_SIZE as usize];
        self.file.read_exact(&mut bytes)?;
        let header: SegmentHeader =
            bincode::deserialize(&bytes).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.first_index = header.first_index;
        self.count = header.count;
        Ok(())
    }

    fn read_frame_len(&mut self) -> io::Result<u64> {
        let mut bytes = [0u8; 8];
        self.file.read_exact(&mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn rebuild_positions(&mut self) -> io::Result<()> {
        self.positions.clear();
        let mut pos = HEADER_SIZE;
        let len = self.file.metadata()?.len();

        for n in 0..self.count {
            if pos >= len {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("segment {} truncated mid-frame", self.path.display()),
                ));
            }
            self.file.seek(SeekFrom::Start(pos))?;
            let frame_len = self.read_frame_len()?;
            self.positions.insert(self.first_index + n, pos);
            pos += FRAME_HEADER_SIZE + frame_len;
        }

        Ok(())
    }

    /// Appends `(index, bytes)` frames. Indexes must continue the stored run.
    pub fn append(&mut self, entries: &[(u64, Vec<u8>)]) -> io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let expected = if self.count == 0 {
            entries[0].0
        } else {
            self.first_index + self.count
        };
        if entries[0].0 != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("expected index {expected}, got {}", entries[0].0),
            ));
        }

        let mut pos = self.file.seek(SeekFrom::End(0))?;
        for (index, bytes) in entries {
            self.file.write_all(&(bytes.len() as u64).to_le_bytes())?;
            self.file.write_all(bytes)?;
            self.positions.insert(*index, pos);
            pos += FRAME_HEADER_SIZE + bytes.len() as u64;
        }

        if self.count == 0 {
            self.first_index = entries[0].0;
        }
        self.count += entries.len() as u64;
        self.write_header()?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn read(&mut self, index: u64) -> io::Result<Vec<u8>> {
        let pos = *self.positions.get(&index).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("no entry {index}"))
        })?;
        self.file.seek(SeekFrom::Start(pos))?;
        let frame_len = self.read_frame_len()?;
        let mut bytes = vec![0u8; frame_len as usize];
        self.file.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// Drops every entry with an index greater than `index`. Truncating below
    /// the first stored index empties the segment.
    pub fn truncate_after(&mut self, index: u64) -> io::Result<()> {
        if self.count == 0 || index >= self.first_index + self.count - 1 {
            return Ok(());
        }

        if index < self.first_index {
            self.file.set_len(HEADER_SIZE)?;
            self.count = 0;
            self.positions.clear();
        } else {
            let cut = *self
                .positions
                .get(&(index + 1))
                .expect("position map covers the stored run");
            self.file.set_len(cut)?;
            self.count = index - self.first_index + 1;
            self.positions.split_off(&(index + 1));
        }

        self.write_header()?;
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn frames(range: std::ops::RangeInclusive<u64>) -> Vec<(u64, Vec<u8>)> {
        range.map(|i| (i, format!("entry-{i}").into_bytes())).collect()
    }

    #[test]
    fn new_segment_is_empty() {
        let temp = NamedTempFile::new().unwrap();
        let segment = Segment::open(temp.path()).unwrap();
        assert!(segment.is_empty());
        assert_eq!(segment.first_index(), None);
        assert_eq!(segment.last_index(), None);
    }

    #[test]
    fn append_and_read_back() {
        let temp = NamedTempFile::new().unwrap();
        let mut segment = Segment::open(temp.path()).unwrap();

        segment.append(&frames(5..=7)).unwrap();
        assert_eq!(segment.first_index(), Some(5));
        assert_eq!(segment.last_index(), Some(7));
        assert_eq!(segment.read(6).unwrap(), b"entry-6");
        assert!(segment.read(8).is_err());
    }

    #[test]
    fn rejects_non_contiguous_append() {
        let temp = NamedTempFile::new().unwrap();
        let mut segment = Segment::open(temp.path()).unwrap();
        segment.append(&frames(1..=2)).unwrap();
        assert!(segment.append(&frames(5..=5)).is_err());
    }

    #[test]
    fn survives_reopen() {
        let temp = NamedTempFile::new().unwrap();
        {
            let mut segment = Segment::open(temp.path()).unwrap();
            segment.append(&frames(10..=12)).unwrap();
        }
        let mut segment = Segment::open(temp.path()).unwrap();
        assert_eq!(segment.first_index(), Some(10));
        assert_eq!(segment.last_index(), Some(12));
        assert_eq!(segment.read(11).unwrap(), b"entry-11");
    }

    #[test]
    fn truncate_after_drops_the_tail() {
        let temp = NamedTempFile::new().unwrap();
        let mut segment = Segment::open(temp.path()).unwrap();
        segment.append(&frames(1..=3)).unwrap();

        segment.truncate_after(2).unwrap();
        assert_eq!(segment.last_index(), Some(2));
        assert_eq!(segment.read(1).unwrap(), b"entry-1");
        assert!(segment.read(3).is_err());

        // New entries continue from the truncation point.
        segment.append(&frames(3..=3)).unwrap();
        assert_eq!(segment.read(3).unwrap(), b"entry-3");
    }

    #[test]
    fn truncate_below_first_empties_the_segment() {
        let temp = NamedTempFile::new().unwrap();
        let mut segment = Segment::open(temp.path()).unwrap();
        segment.append(&frames(5..=6)).unwrap();

        segment.truncate_after(2).unwrap();
        assert!(segment.is_empty());

        segment.append(&frames(3..=3)).unwrap();
        assert_eq!(segment.first_index(), Some(3));
    }
}
