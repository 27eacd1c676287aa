//! A single log segment file.
//!
//! Layout: a fixed 20 byte header (`first_index: u64 | max_entries: u32 |
//! created: u64`, little endian) followed by length-prefixed records
//! (`length: u32 | term: u64 | type: u8 | payload`). Entry indexes are not
//! stored; an entry's index is `first_index + ordinal`. A compacted-out slot
//! is persisted as a zero-length record with the reserved skip tag so
//! ordinals stay derivable after rewrites.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::entry::ENTRY_ID_BASE;
use crate::entry::SKIP_ID;
use crate::error::StorageError;

pub(crate) const HEADER_LEN: u64 = 20;
pub(crate) const RECORD_HEADER_LEN: u64 = 13;
pub(crate) const SKIP_TAG: u8 = (SKIP_ID - ENTRY_ID_BASE) as u8;

/// The location and framing metadata of one stored record. Slots with the
/// skip tag are compacted-out placeholders.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Slot {
    pub offset: u64,
    pub len: u32,
    pub term: u64,
    pub tag: u8,
}

impl Slot {
    fn present(&self) -> bool {
        self.tag != SKIP_TAG
    }

    fn end(&self) -> u64 {
        self.offset + RECORD_HEADER_LEN + self.len as u64
    }
}

/// An open segment file with its in-memory offset index.
pub(crate) struct Segment {
    path: PathBuf,
    file: Mutex<File>,
    pub first_index: u64,
    pub max_entries: u32,
    pub created: u64,
    slots: Vec<Slot>,
    write_offset: u64,
    /// Sealed segments accept no further appends.
    pub sealed: bool,
}

impl Segment {
    /// The file name of the segment starting at `first_index`.
    pub fn file_name(first_index: u64) -> String {
        format!("{:020}.seg", first_index)
    }

    /// Create a fresh segment file.
    pub fn create(dir: &Path, first_index: u64, max_entries: u32, created: u64) -> Result<Self, StorageError> {
        let path = dir.join(Self::file_name(first_index));
        Self::create_at(&path, first_index, max_entries, created)
    }

    /// Create a fresh segment file at an explicit path (compaction rewrites
    /// build their replacement under a temporary name).
    pub fn create_at(path: &Path, first_index: u64, max_entries: u32, created: u64) -> Result<Self, StorageError> {
        let mut file = OpenOptions::new().create_new(true).read(true).write(true).open(path)?;

        let mut header = [0u8; HEADER_LEN as usize];
        header[0..8].copy_from_slice(&first_index.to_le_bytes());
        header[8..12].copy_from_slice(&max_entries.to_le_bytes());
        header[12..20].copy_from_slice(&created.to_le_bytes());
        file.write_all(&header)?;
        file.sync_data()?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            first_index,
            max_entries,
            created,
            slots: Vec::new(),
            write_offset: HEADER_LEN,
            sealed: false,
        })
    }

    /// Open an existing segment file, rebuilding the offset index by scan.
    ///
    /// A torn tail (an interrupted final write) is truncated away; corrupt
    /// interior records are fatal.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();

        if file_len < HEADER_LEN {
            return Err(StorageError::Corruption {
                segment: 0,
                offset: 0,
                reason: format!("segment file {:?} is shorter than its header", path),
            });
        }

        let mut header = [0u8; HEADER_LEN as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let first_index = u64::from_le_bytes(header[0..8].try_into().expect("header slice is 8 bytes"));
        let max_entries = u32::from_le_bytes(header[8..12].try_into().expect("header slice is 4 bytes"));
        let created = u64::from_le_bytes(header[12..20].try_into().expect("header slice is 8 bytes"));

        let mut slots = Vec::new();
        let mut offset = HEADER_LEN;
        loop {
            if offset == file_len {
                break;
            }
            if offset + RECORD_HEADER_LEN > file_len {
                tracing::warn!(segment = first_index, offset, "torn record header at segment tail, truncating");
                file.set_len(offset)?;
                break;
            }

            let mut rec = [0u8; RECORD_HEADER_LEN as usize];
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut rec)?;
            let len = u32::from_le_bytes(rec[0..4].try_into().expect("record slice is 4 bytes"));
            let term = u64::from_le_bytes(rec[4..12].try_into().expect("record slice is 8 bytes"));
            let tag = rec[12];

            if offset + RECORD_HEADER_LEN + len as u64 > file_len {
                tracing::warn!(segment = first_index, offset, "torn record payload at segment tail, truncating");
                file.set_len(offset)?;
                break;
            }

            if tag == SKIP_TAG && len != 0 {
                return Err(StorageError::Corruption {
                    segment: first_index,
                    offset,
                    reason: "skip record with non-empty payload".to_string(),
                });
            }

            slots.push(Slot {
                offset,
                len,
                term,
                tag,
            });
            offset += RECORD_HEADER_LEN + len as u64;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            first_index,
            max_entries,
            created,
            slots,
            write_offset: offset.min(file_len),
            sealed: false,
        })
    }

    /// Number of entry slots, discarded ones included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.max_entries as usize
    }

    /// The index of the last slot, discarded or not.
    pub fn last_index(&self) -> Option<u64> {
        if self.slots.is_empty() {
            None
        } else {
            Some(self.first_index + self.slots.len() as u64 - 1)
        }
    }

    fn slot(&self, index: u64) -> Option<&Slot> {
        if index < self.first_index {
            return None;
        }
        self.slots.get((index - self.first_index) as usize)
    }

    /// Whether the slot for `index` exists and was not compacted out.
    pub fn contains(&self, index: u64) -> bool {
        self.slot(index).map(Slot::present).unwrap_or(false)
    }

    pub fn term_of(&self, index: u64) -> Option<u64> {
        self.slot(index).filter(|s| s.present()).map(|s| s.term)
    }

    /// The term recorded in the slot for `index`, skip slots included.
    pub fn raw_term(&self, index: u64) -> Option<u64> {
        self.slot(index).map(|s| s.term)
    }

    /// The term recorded in the very last slot, skip slots included.
    pub fn last_slot_term(&self) -> Option<u64> {
        self.slots.last().map(|s| s.term)
    }

    /// The highest present index whose record carries the given tag.
    pub fn last_index_with_tag(&self, tag: u8) -> Option<u64> {
        self.slots
            .iter()
            .enumerate()
            .rev()
            .find(|(_, s)| s.present() && s.tag == tag)
            .map(|(ord, _)| self.first_index + ord as u64)
    }

    /// Append one record, returning the index it was assigned.
    pub fn append(&mut self, term: u64, tag: u8, payload: &[u8]) -> Result<u64, StorageError> {
        debug_assert!(!self.sealed, "append to sealed segment");
        let index = self.first_index + self.slots.len() as u64;
        let offset = self.write_offset;

        let mut buf = Vec::with_capacity(RECORD_HEADER_LEN as usize + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&term.to_le_bytes());
        buf.push(tag);
        buf.extend_from_slice(payload);

        {
            let mut file = self.file.lock().expect("segment file lock poisoned");
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&buf)?;
        }

        self.slots.push(Slot {
            offset,
            len: payload.len() as u32,
            term,
            tag,
        });
        self.write_offset = offset + buf.len() as u64;
        Ok(index)
    }

    /// Flush appended records to disk.
    pub fn sync(&self) -> Result<(), StorageError> {
        let file = self.file.lock().expect("segment file lock poisoned");
        file.sync_data()?;
        Ok(())
    }

    /// Read the record stored for `index`, `None` for discarded slots.
    pub fn read(&self, index: u64) -> Result<Option<(u64, u8, Vec<u8>)>, StorageError> {
        let slot = match self.slot(index) {
            Some(slot) if slot.present() => *slot,
            _ => return Ok(None),
        };
        let mut payload = vec![0u8; slot.len as usize];
        {
            let mut file = self.file.lock().expect("segment file lock poisoned");
            file.seek(SeekFrom::Start(slot.offset + RECORD_HEADER_LEN))?;
            file.read_exact(&mut payload)?;
        }
        Ok(Some((slot.term, slot.tag, payload)))
    }

    /// Discard all slots with index > `index` and shrink the file.
    pub fn truncate_after(&mut self, index: u64) -> Result<(), StorageError> {
        let keep = if index < self.first_index {
            0
        } else {
            (index - self.first_index + 1) as usize
        };
        if keep >= self.slots.len() {
            return Ok(());
        }
        let new_end = self.slots[keep].offset;
        self.slots.truncate(keep);
        {
            let file = self.file.lock().expect("segment file lock poisoned");
            file.set_len(new_end)?;
            file.sync_data()?;
        }
        self.write_offset = new_end;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = Segment::create(dir.path(), 1, 16, 7).unwrap();
        assert_eq!(seg.append(1, 3, b"alpha").unwrap(), 1);
        assert_eq!(seg.append(1, 3, b"beta").unwrap(), 2);
        seg.sync().unwrap();

        assert_eq!(seg.read(1).unwrap().unwrap(), (1, 3, b"alpha".to_vec()));
        assert_eq!(seg.read(2).unwrap().unwrap(), (1, 3, b"beta".to_vec()));
        assert!(seg.read(3).unwrap().is_none());
        assert_eq!(seg.term_of(2), Some(1));
        assert_eq!(seg.last_index(), Some(2));
    }

    #[test]
    fn reopen_rebuilds_offset_index() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut seg = Segment::create(dir.path(), 5, 8, 0).unwrap();
            seg.append(2, 1, b"one").unwrap();
            seg.append(2, 1, b"two").unwrap();
            seg.append(3, 1, b"three").unwrap();
            seg.sync().unwrap();
        }
        let seg = Segment::open(&dir.path().join(Segment::file_name(5))).unwrap();
        assert_eq!(seg.first_index, 5);
        assert_eq!(seg.len(), 3);
        assert_eq!(seg.read(6).unwrap().unwrap(), (2, 1, b"two".to_vec()));
        assert_eq!(seg.term_of(7), Some(3));
    }

    #[test]
    fn skip_records_keep_ordinals_aligned() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut seg = Segment::create(dir.path(), 1, 8, 0).unwrap();
            seg.append(1, 1, b"kept").unwrap();
            seg.append(1, SKIP_TAG, b"").unwrap();
            seg.append(1, 1, b"also kept").unwrap();
            seg.sync().unwrap();
        }
        let seg = Segment::open(&dir.path().join(Segment::file_name(1))).unwrap();
        assert_eq!(seg.len(), 3);
        assert!(seg.contains(1));
        assert!(!seg.contains(2), "skip slot reads as a hole");
        assert!(seg.read(2).unwrap().is_none());
        assert_eq!(seg.term_of(2), None);
        assert_eq!(seg.read(3).unwrap().unwrap().2, b"also kept".to_vec());
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(Segment::file_name(1));
        {
            let mut seg = Segment::create(dir.path(), 1, 8, 0).unwrap();
            seg.append(1, 1, b"good").unwrap();
            seg.sync().unwrap();
        }
        // Simulate a torn final write: a record header claiming more payload
        // than the file holds.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            let mut rec = Vec::new();
            rec.extend_from_slice(&100u32.to_le_bytes());
            rec.extend_from_slice(&1u64.to_le_bytes());
            rec.push(1);
            rec.extend_from_slice(b"partial");
            file.write_all(&rec).unwrap();
        }
        let seg = Segment::open(&path).unwrap();
        assert_eq!(seg.len(), 1);
        assert_eq!(seg.read(1).unwrap().unwrap().2, b"good".to_vec());
    }

    #[test]
    fn truncate_after_drops_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = Segment::create(dir.path(), 1, 8, 0).unwrap();
        for payload in [b"a".as_ref(), b"b".as_ref(), b"c".as_ref()] {
            seg.append(1, 1, payload).unwrap();
        }
        seg.truncate_after(1).unwrap();
        assert_eq!(seg.len(), 1);
        assert!(seg.contains(1));
        assert!(!seg.contains(2));

        // The file shrank too: reopen sees only the survivor.
        drop(seg);
        let seg = Segment::open(&dir.path().join(Segment::file_name(1))).unwrap();
        assert_eq!(seg.len(), 1);
    }
}
