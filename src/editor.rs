//! Scoped handles onto single entries of a [DiskLruStore].
//!
//! An [Editor] owns the only edit of its entry.  Dropping it without calling [Editor::commit] aborts the edit, so temp
//! files never outlive the editor on any exit path, panics included.
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use crate::disk_store::StoreInner;
use crate::*;

/// A committed entry as of the moment it was read.
///
/// The files were opened when the snapshot was taken, so they stay readable even if the entry is evicted or replaced
/// afterwards.
pub struct Snapshot {
    pub(crate) store: Arc<StoreInner>,
    pub(crate) key: String,
    pub(crate) sequence_number: u64,
    pub(crate) files: Vec<File>,
    pub(crate) lengths: Vec<u64>,
}

impl Snapshot {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn length(&self, index: usize) -> u64 {
        self.lengths[index]
    }

    /// The open file for a value.  Reads move a shared cursor; [Snapshot::read] rewinds before reading.
    pub fn file(&self, index: usize) -> &File {
        &self.files[index]
    }

    pub fn read(&self, index: usize) -> std::io::Result<Vec<u8>> {
        let mut file = &self.files[index];
        file.seek(SeekFrom::Start(0))?;
        let mut out = Vec::with_capacity(self.lengths[index] as usize);
        file.read_to_end(&mut out)?;
        Ok(out)
    }

    pub fn read_string(&self, index: usize) -> std::io::Result<String> {
        String::from_utf8(self.read(index)?)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Edit this entry, unless it has been committed again since this snapshot was taken or is already being edited.
    pub fn edit(&self) -> Result<Option<Editor>, StoreError> {
        self.store.edit(&self.key, Some(self.sequence_number))
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("key", &self.key)
            .field("lengths", &self.lengths)
            .finish()
    }
}

/// The single in-progress edit of one entry.
pub struct Editor {
    store: Arc<StoreInner>,
    key: String,
    id: u64,
    /// Which values have been written by this edit.
    written: Vec<bool>,
    /// Whether the entry had been committed before this edit started.
    existing: bool,
    done: bool,
}

impl Editor {
    pub(crate) fn new(store: Arc<StoreInner>, key: String, id: u64, existing: bool) -> Editor {
        let value_count = store.layout.value_count();
        Editor {
            store,
            key,
            id,
            written: vec![false; value_count],
            existing,
            done: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether committing will update an existing entry, in which case values left unwritten keep their old contents.
    pub fn is_update(&self) -> bool {
        self.existing
    }

    /// Open the temp file for a value, truncating anything written to it earlier in this edit.
    ///
    /// # Panics
    ///
    /// If `index` is out of range for the store.
    pub fn writer(&mut self, index: usize) -> Result<File, StoreError> {
        assert!(
            index < self.written.len(),
            "Value index {} out of range, entries have {} values",
            index,
            self.written.len()
        );
        let file = File::create(self.store.layout.dirty_file(&self.key, index))?;
        self.written[index] = true;
        Ok(file)
    }

    /// Write a whole value.
    pub fn set(&mut self, index: usize, data: &[u8]) -> Result<&mut Editor, StoreError> {
        let mut file = self.writer(index)?;
        file.write_all(data)?;
        Ok(self)
    }

    /// Publish the written values.
    ///
    /// # Panics
    ///
    /// If this edit creates the entry and didn't write every value.  The edit is aborted before panicking.
    pub fn commit(mut self) -> Result<(), StoreError> {
        self.done = true;
        self.store
            .complete_edit(&self.key, self.id, &self.written, true)
    }

    /// Throw away the written values.  An entry which had never been committed is removed.
    pub fn abort(mut self) -> Result<(), StoreError> {
        self.done = true;
        self.store
            .complete_edit(&self.key, self.id, &self.written, false)
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(e) = self
            .store
            .complete_edit(&self.key, self.id, &self.written, false)
        {
            log::warn!("Failed to abort edit of {}: {}", self.key, e);
        }
    }
}

impl std::fmt::Debug for Editor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Editor")
            .field("key", &self.key)
            .field("written", &self.written)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Read;

    #[test]
    fn test_streaming_writer() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskLruStore::open(dir.path(), 1, 1, 1000).unwrap();
        let mut editor = store.edit("k").unwrap().unwrap();
        assert!(!editor.is_update());
        {
            let mut w = editor.writer(0).unwrap();
            w.write_all(b"hello ").unwrap();
            w.write_all(b"world").unwrap();
        }
        editor.commit().unwrap();

        let snapshot = store.get("k").unwrap().unwrap();
        assert_eq!(snapshot.length(0), 11);
        let mut contents = String::new();
        snapshot.file(0).read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "hello world");
        // Reading again starts over.
        assert_eq!(snapshot.read_string(0).unwrap(), "hello world");

        let editor = snapshot.edit().unwrap().unwrap();
        assert!(editor.is_update());
    }

    #[test]
    fn test_snapshot_outlives_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskLruStore::open(dir.path(), 1, 1, 1000).unwrap();
        let mut editor = store.edit("k").unwrap().unwrap();
        editor.set(0, b"data").unwrap();
        editor.commit().unwrap();

        let snapshot = store.get("k").unwrap().unwrap();
        assert!(store.remove("k").unwrap());
        assert_eq!(snapshot.read(0).unwrap(), b"data");
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_index_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskLruStore::open(dir.path(), 1, 1, 1000).unwrap();
        let mut editor = store.edit("k").unwrap().unwrap();
        let _ = editor.set(1, b"x");
    }
}
