//! The segmented replicated log.
//!
//! A log is a directory of segment files. The last segment is *active* and
//! receives appends; earlier segments are sealed and become eligible for
//! compaction once their whole index range falls under a compaction
//! watermark. Compaction deletes individual entries (leaving holes) but the
//! index range of the log itself only moves at the edges: appends on the
//! right, truncation of divergent suffixes on the right, never the left.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use crate::entry::ConfigurationEntry;
use crate::entry::Entry;
use crate::entry::EntryPayload;
use crate::entry::CONFIGURATION_ID;
use crate::entry::ENTRY_ID_BASE;
use crate::error::StorageError;
use crate::storage::segment::Segment;
use crate::storage::segment::SKIP_TAG;
use crate::AppData;
use crate::LogId;

/// The segmented log of one server.
pub struct Log<D: AppData> {
    dir: PathBuf,
    segment_entries: u32,
    inner: RwLock<LogInner>,
    _marker: PhantomData<fn() -> D>,
}

struct LogInner {
    /// Segments keyed by their first index. The last one is active.
    segments: BTreeMap<u64, Segment>,
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

impl<D: AppData> Log<D> {
    /// Open the log in `dir`, creating the directory if needed and
    /// rebuilding every segment's offset index by scan.
    pub fn open(dir: impl Into<PathBuf>, segment_entries: u32) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut segments = BTreeMap::new();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|res| res.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "seg").unwrap_or(false))
            .collect();
        paths.sort();

        for path in paths {
            let segment = Segment::open(&path)?;
            segments.insert(segment.first_index, segment);
        }

        // All but the last segment are sealed.
        let last = segments.keys().next_back().copied();
        for (first, segment) in segments.iter_mut() {
            segment.sealed = Some(*first) != last;
        }

        let log = Self {
            dir,
            segment_entries,
            inner: RwLock::new(LogInner { segments }),
            _marker: PhantomData,
        };
        tracing::debug!(dir = ?log.dir, first = log.first_index(), last = log.last_index(), "opened log");
        Ok(log)
    }

    /// The index of the first entry slot, 0 when the log is empty.
    pub fn first_index(&self) -> u64 {
        let inner = self.inner.read().expect("log lock poisoned");
        inner.segments.values().find(|s| !s.is_empty()).map(|s| s.first_index).unwrap_or(0)
    }

    /// The index of the last entry slot, 0 when the log is empty.
    pub fn last_index(&self) -> u64 {
        let inner = self.inner.read().expect("log lock poisoned");
        inner.segments.values().rev().find_map(|s| s.last_index()).unwrap_or(0)
    }

    /// The id (term and index) of the last entry slot.
    pub fn last_log_id(&self) -> LogId {
        let inner = self.inner.read().expect("log lock poisoned");
        for segment in inner.segments.values().rev() {
            if let Some(index) = segment.last_index() {
                let term = segment.last_slot_term().unwrap_or(0);
                return LogId { term, index };
            }
        }
        LogId::default()
    }

    /// Append a new entry, assigning the next index.
    pub fn append(&self, term: u64, timestamp: u64, payload: EntryPayload<D>) -> Result<Entry<D>, StorageError> {
        let mut inner = self.inner.write().expect("log lock poisoned");
        let index = inner.segments.values().rev().find_map(|s| s.last_index()).unwrap_or(0) + 1;
        let entry = Entry {
            log_id: LogId { term, index },
            timestamp,
            payload,
        };
        self.write_entry(&mut inner, &entry)?;
        self.sync_active(&inner)?;
        Ok(entry)
    }

    /// Store entries prepared elsewhere (the replication receive path).
    ///
    /// Entries already present with a matching term are skipped; a gap ahead
    /// of the next index is filled with skip slots (the missing entries were
    /// compacted away on the sender). Conflicting suffixes must be truncated
    /// by the caller before storing.
    pub fn append_entries(&self, entries: &[Arc<Entry<D>>]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.write().expect("log lock poisoned");
        for entry in entries {
            let last = inner.segments.values().rev().find_map(|s| s.last_index()).unwrap_or(0);
            let index = entry.log_id.index;
            if index <= last {
                let existing = Self::locate(&inner, index).and_then(|s| s.term_of(index));
                match existing {
                    Some(term) if term == entry.log_id.term => continue,
                    None => continue,
                    Some(_) => {
                        return Err(StorageError::IllegalOperation(format!(
                            "conflicting entry at index {} was not truncated before append",
                            index
                        )));
                    }
                }
            }
            // Fill any gap with skip slots so ordinals stay derivable.
            for _ in (last + 1)..index {
                self.write_skip(&mut inner, entry.log_id.term)?;
            }
            self.write_entry(&mut inner, entry)?;
        }
        self.sync_active(&inner)?;
        Ok(())
    }

    /// Discard all entries with index greater than `index`.
    pub fn truncate(&self, index: u64) -> Result<(), StorageError> {
        let mut inner = self.inner.write().expect("log lock poisoned");
        let doomed: Vec<u64> = inner.segments.range((index + 1)..).map(|(first, _)| *first).collect();
        for first in doomed {
            if let Some(segment) = inner.segments.remove(&first) {
                tracing::debug!(segment = first, "removing truncated segment");
                std::fs::remove_file(segment.path())?;
            }
        }
        if let Some((_, segment)) = inner.segments.iter_mut().next_back() {
            segment.truncate_after(index)?;
            segment.sealed = false;
        }
        Ok(())
    }

    /// Read the entry at `index`. Returns `None` for indexes outside the log
    /// range and for slots discarded by compaction.
    pub fn get(&self, index: u64) -> Result<Option<Entry<D>>, StorageError> {
        let inner = self.inner.read().expect("log lock poisoned");
        let segment = match Self::locate(&inner, index) {
            Some(s) => s,
            None => return Ok(None),
        };
        Self::read_entry(segment, index)
    }

    /// Whether the slot for `index` is inside the log range and present.
    pub fn contains(&self, index: u64) -> bool {
        let inner = self.inner.read().expect("log lock poisoned");
        Self::locate(&inner, index).map(|s| s.contains(index)).unwrap_or(false)
    }

    /// The term of the entry at `index`, `None` for holes.
    pub fn term_of(&self, index: u64) -> Option<u64> {
        let inner = self.inner.read().expect("log lock poisoned");
        Self::locate(&inner, index).and_then(|s| s.term_of(index))
    }

    /// Read the present entries in `[from, to]`, skipping holes.
    pub fn range(&self, from: u64, to: u64) -> Result<Vec<Arc<Entry<D>>>, StorageError> {
        let inner = self.inner.read().expect("log lock poisoned");
        let mut out = Vec::new();
        for (_, segment) in inner.segments.iter() {
            let last = match segment.last_index() {
                Some(last) => last,
                None => continue,
            };
            if last < from || segment.first_index > to {
                continue;
            }
            let lo = from.max(segment.first_index);
            let hi = to.min(last);
            for index in lo..=hi {
                if let Some(entry) = Self::read_entry(segment, index)? {
                    out.push(Arc::new(entry));
                }
            }
        }
        Ok(out)
    }

    /// The most recent Configuration entry in the log, with its index.
    pub fn latest_configuration(&self) -> Result<Option<(u64, ConfigurationEntry)>, StorageError> {
        let config_tag = (CONFIGURATION_ID - ENTRY_ID_BASE) as u8;
        let inner = self.inner.read().expect("log lock poisoned");
        for segment in inner.segments.values().rev() {
            if let Some(index) = segment.last_index_with_tag(config_tag) {
                let entry = Self::read_entry(segment, index)?.ok_or_else(|| StorageError::Corruption {
                    segment: segment.first_index,
                    offset: 0,
                    reason: format!("configuration slot {} vanished during read", index),
                })?;
                match entry.payload {
                    EntryPayload::Configuration(config) => return Ok(Some((index, config))),
                    _ => {
                        return Err(StorageError::Corruption {
                            segment: segment.first_index,
                            offset: 0,
                            reason: format!("slot {} tagged configuration holds another variant", index),
                        })
                    }
                }
            }
        }
        Ok(None)
    }

    /// Segments no longer receiving appends whose whole range is at or
    /// below `limit`. Retention shrinks as state evolves, so passes sweep
    /// these again and again; rewrites are discard-only and idempotent.
    pub(crate) fn compactable_segments(&self, limit: u64) -> Vec<u64> {
        let inner = self.inner.read().expect("log lock poisoned");
        let active = inner.segments.keys().next_back().copied();
        inner
            .segments
            .values()
            .filter(|s| s.sealed || s.is_full())
            .filter(|s| Some(s.first_index) != active || s.is_full())
            .filter(|s| s.last_index().map(|last| last <= limit).unwrap_or(false))
            .map(|s| s.first_index)
            .collect()
    }

    /// Decode the present entries of one segment.
    pub(crate) fn segment_entries(&self, first_index: u64) -> Result<Vec<Entry<D>>, StorageError> {
        let inner = self.inner.read().expect("log lock poisoned");
        let segment = inner.segments.get(&first_index).ok_or_else(|| {
            StorageError::IllegalOperation(format!("no segment starts at index {}", first_index))
        })?;
        let mut out = Vec::new();
        if let Some(last) = segment.last_index() {
            for index in segment.first_index..=last {
                if let Some(entry) = Self::read_entry(segment, index)? {
                    out.push(entry);
                }
            }
        }
        Ok(out)
    }

    /// Rewrite one sealed segment, replacing the slots in `discard` with
    /// skip records. The rewritten file replaces the original atomically.
    pub(crate) fn rewrite_segment(&self, first_index: u64, discard: &BTreeSet<u64>) -> Result<usize, StorageError> {
        // Read phase: the segment is sealed, so a read lock suffices and
        // appends to the active segment proceed meanwhile.
        let records: Vec<(u64, u8, Vec<u8>)> = {
            let inner = self.inner.read().expect("log lock poisoned");
            let segment = inner.segments.get(&first_index).ok_or_else(|| {
                StorageError::IllegalOperation(format!("no segment starts at index {}", first_index))
            })?;
            let last = match segment.last_index() {
                Some(last) => last,
                None => return Ok(0),
            };
            let mut records = Vec::with_capacity((last - first_index + 1) as usize);
            for index in first_index..=last {
                match segment.read(index)? {
                    Some((term, tag, payload)) if !discard.contains(&index) => {
                        records.push((term, tag, payload));
                    }
                    Some((term, _, _)) => records.push((term, SKIP_TAG, Vec::new())),
                    None => records.push((segment.raw_term(index).unwrap_or(0), SKIP_TAG, Vec::new())),
                }
            }
            records
        };

        let discarded = records.iter().filter(|(_, tag, _)| *tag == SKIP_TAG).count();

        let tmp_path = self.dir.join(format!("{}.compact", Segment::file_name(first_index)));
        let _ = std::fs::remove_file(&tmp_path);
        let (max_entries, created) = {
            let inner = self.inner.read().expect("log lock poisoned");
            let segment = inner.segments.get(&first_index).expect("segment presence was checked above");
            (segment.max_entries, segment.created)
        };
        let mut tmp = Segment::create_at(&tmp_path, first_index, max_entries, created)?;
        for (term, tag, payload) in &records {
            tmp.append(*term, *tag, payload)?;
        }
        tmp.sync()?;
        drop(tmp);

        // Swap phase: replace the file and the in-memory segment under the
        // write lock.
        let mut inner = self.inner.write().expect("log lock poisoned");
        let path = self.dir.join(Segment::file_name(first_index));
        std::fs::rename(&tmp_path, &path)?;
        let mut replacement = Segment::open(&path)?;
        replacement.sealed = true;
        inner.segments.insert(first_index, replacement);
        tracing::debug!(segment = first_index, discarded, "rewrote segment");
        Ok(discarded)
    }

    fn locate(inner: &LogInner, index: u64) -> Option<&Segment> {
        inner.segments.range(..=index).next_back().map(|(_, s)| s)
    }

    fn read_entry(segment: &Segment, index: u64) -> Result<Option<Entry<D>>, StorageError> {
        let (term, tag, payload) = match segment.read(index)? {
            Some(rec) => rec,
            None => return Ok(None),
        };
        Entry::decode(LogId { term, index }, tag, &payload)
            .map(Some)
            .map_err(|err| StorageError::Codec {
                index,
                reason: err.to_string(),
            })
    }

    fn write_entry(&self, inner: &mut LogInner, entry: &Entry<D>) -> Result<(), StorageError> {
        let body = entry.encode_body().map_err(|err| StorageError::Codec {
            index: entry.log_id.index,
            reason: err.to_string(),
        })?;
        let segment = self.active_segment(inner, entry.log_id.index)?;
        let assigned = segment.append(entry.log_id.term, entry.wire_tag(), &body)?;
        debug_assert_eq!(assigned, entry.log_id.index);
        Ok(())
    }

    fn write_skip(&self, inner: &mut LogInner, term: u64) -> Result<(), StorageError> {
        let next = inner.segments.values().rev().find_map(|s| s.last_index()).unwrap_or(0) + 1;
        let segment = self.active_segment(inner, next)?;
        segment.append(term, SKIP_TAG, &[])?;
        Ok(())
    }

    /// The segment the next append at `index` goes to, rolling as needed.
    fn active_segment<'a>(&self, inner: &'a mut LogInner, index: u64) -> Result<&'a mut Segment, StorageError> {
        let needs_roll = match inner.segments.values().next_back() {
            Some(active) => active.is_full() || active.sealed,
            None => true,
        };
        if needs_roll {
            if let Some((_, active)) = inner.segments.iter_mut().next_back() {
                active.sealed = true;
            }
            tracing::debug!(first_index = index, "rolling to new segment");
            let segment = Segment::create(&self.dir, index, self.segment_entries, now_millis())?;
            inner.segments.insert(index, segment);
        }
        Ok(inner.segments.values_mut().next_back().expect("active segment was just ensured"))
    }

    fn sync_active(&self, inner: &LogInner) -> Result<(), StorageError> {
        if let Some(active) = inner.segments.values().next_back() {
            active.sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::entry::OperationEntry;

    fn command(session: u64, seq: u64, op: &str) -> EntryPayload<String> {
        EntryPayload::Command(OperationEntry {
            session,
            sequence: seq,
            operation: op.to_string(),
        })
    }

    fn open_log(dir: &Path, cap: u32) -> Log<String> {
        Log::open(dir, cap).unwrap()
    }

    #[test]
    fn append_assigns_contiguous_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 4);
        for i in 1..=6u64 {
            let entry = log.append(1, i * 10, command(1, i, "x")).unwrap();
            assert_eq!(entry.log_id.index, i);
        }
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 6);
        assert_eq!(log.last_log_id(), LogId::new(1, 6));
    }

    #[test]
    fn rolls_segments_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 2);
        for i in 1..=5u64 {
            log.append(1, 0, command(1, i, "x")).unwrap();
        }
        // 3 segment files: [1,2], [3,4], [5].
        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names.len(), 3);
        assert!(log.contains(5));
    }

    #[test]
    fn reopen_recovers_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = open_log(dir.path(), 3);
            for i in 1..=7u64 {
                log.append(2, i, command(9, i, "persist")).unwrap();
            }
        }
        let log = open_log(dir.path(), 3);
        assert_eq!(log.last_index(), 7);
        let entry = log.get(4).unwrap().unwrap();
        assert_eq!(entry.log_id, LogId::new(2, 4));
        assert_eq!(entry.timestamp, 4);
    }

    #[test]
    fn truncate_discards_suffix_and_whole_segments() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 2);
        for i in 1..=6u64 {
            log.append(1, 0, command(1, i, "x")).unwrap();
        }
        log.truncate(3).unwrap();
        assert_eq!(log.last_index(), 3);
        assert!(!log.contains(4));
        // Appends continue from the truncation point.
        let entry = log.append(2, 0, command(1, 9, "y")).unwrap();
        assert_eq!(entry.log_id.index, 4);
        assert_eq!(log.term_of(4), Some(2));
    }

    #[test]
    fn append_entries_fills_gaps_with_holes() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 8);
        let entries: Vec<Arc<Entry<String>>> = [3u64, 4]
            .iter()
            .map(|i| {
                Arc::new(Entry {
                    log_id: LogId::new(1, *i),
                    timestamp: 0,
                    payload: command(1, *i, "from-leader"),
                })
            })
            .collect();
        log.append_entries(&entries).unwrap();
        assert_eq!(log.last_index(), 4);
        assert!(!log.contains(1));
        assert!(!log.contains(2));
        assert!(log.contains(3));
        assert_eq!(log.get(2).unwrap(), None);
    }

    #[test]
    fn duplicate_appends_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 8);
        let entry = Arc::new(Entry {
            log_id: LogId::new(1, 1),
            timestamp: 0,
            payload: command(1, 1, "once"),
        });
        log.append_entries(&[entry.clone()]).unwrap();
        log.append_entries(&[entry]).unwrap();
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn latest_configuration_is_found() {
        let dir = tempfile::tempdir().unwrap();
        let log: Log<String> = open_log(dir.path(), 4);
        log.append(1, 0, EntryPayload::NoOp).unwrap();
        log.append(1, 0, EntryPayload::Configuration(ConfigurationEntry::default())).unwrap();
        log.append(1, 0, command(1, 1, "x")).unwrap();
        let (index, _) = log.latest_configuration().unwrap().unwrap();
        assert_eq!(index, 2);
    }
}
