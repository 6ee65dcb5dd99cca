//! A [DiskLruStore] keeps a bounded number of bytes on disk, as entries of a fixed number of values each.
//!
//! Each value is a plain file named `<key>.<index>` in the store directory.  Edits are written to `<key>.<index>.tmp`
//! and renamed into place on commit, so readers never see a half-written value.  The in-memory index is rebuilt on
//! open from an append-only journal (see the `journal` module), which is compacted once it is mostly redundant.
//!
//! The store is advisory.  Failures reading values come back as misses, and a journal which can't be understood
//! makes the store start again from an empty directory.  Only failures writing the journal reach the caller.
//!
//! All index mutation happens under one lock.  Eviction down to the size budget and journal compaction run on a
//! dedicated background thread, which takes the same lock.
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::journal::{
    read_journal, Header, JournalWriter, Record, JOURNAL_FILE, JOURNAL_FILE_BACKUP,
    JOURNAL_FILE_TEMP,
};
use crate::key::is_valid_disk_key;
use crate::*;

/// Compact the journal once it has at least this many redundant records, and at least as many as there are entries.
const REDUNDANT_OP_COMPACT_THRESHOLD: usize = 2000;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error in disk store: {0}")]
    Io(#[from] std::io::Error),
    #[error("keys must match [a-z0-9_-]{{1,120}}, got {0:?}")]
    InvalidKey(String),
    #[error("the disk store is closed")]
    Closed,
    #[error("the edit of {0} no longer owns its entry")]
    StaleEditor(String),
}

/// The index entry for one key.
#[derive(Debug)]
pub(crate) struct Entry {
    lengths: Vec<u64>,
    /// True once the entry has been committed at least once.
    readable: bool,
    /// Id of the editor holding this entry, if any.
    current_editor: Option<u64>,
    /// Bumped on every successful commit, so snapshots can tell when they are stale.
    sequence_number: u64,
}

impl Entry {
    fn new(value_count: usize) -> Entry {
        Entry {
            lengths: vec![0; value_count],
            readable: false,
            current_editor: None,
            sequence_number: 0,
        }
    }

    fn total_length(&self) -> u64 {
        self.lengths.iter().sum()
    }
}

pub(crate) struct StoreState {
    /// Cost of an entry is the total length of its committed values; the maximum cost is the size budget.
    entries: CostBasedLru<str, Entry>,
    /// `None` once closed.
    journal: Option<JournalWriter>,
    redundant_op_count: usize,
    next_sequence_number: u64,
    next_editor_id: u64,
}

impl StoreState {
    fn new(max_size: u64) -> StoreState {
        StoreState {
            entries: CostBasedLru::new(max_size),
            journal: None,
            redundant_op_count: 0,
            next_sequence_number: 0,
            next_editor_id: 0,
        }
    }

    fn append(&mut self, record: Record) -> Result<(), StoreError> {
        match self.journal.as_mut() {
            Some(j) => Ok(j.append(&record)?),
            None => Err(StoreError::Closed),
        }
    }

    fn check_not_closed(&self) -> Result<(), StoreError> {
        if self.journal.is_none() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn journal_rebuild_required(&self) -> bool {
        self.redundant_op_count >= REDUNDANT_OP_COMPACT_THRESHOLD
            && self.redundant_op_count >= self.entries.len()
    }

    fn needs_cleanup(&self) -> bool {
        self.entries.current_cost() > self.entries.max_cost() || self.journal_rebuild_required()
    }

    /// Apply one journal record while replaying.
    fn replay(&mut self, record: Record, value_count: usize) {
        let key = match &record {
            Record::Remove(k) => {
                self.entries.remove(k.as_str());
                return;
            }
            Record::Dirty(k) | Record::Clean(k, _) | Record::Read(k) => k.as_str(),
        };

        if !self.entries.touch(key) {
            self.entries
                .insert(key.into(), Entry::new(value_count), 0);
        }

        match record {
            Record::Clean(k, lengths) => {
                let total = lengths.iter().sum();
                if let Some(e) = self.entries.peek_mut(&k) {
                    e.readable = true;
                    e.current_editor = None;
                    e.lengths = lengths;
                }
                self.entries.set_cost(&k, total);
            }
            Record::Dirty(k) => {
                let id = self.next_editor_id;
                self.next_editor_id += 1;
                if let Some(e) = self.entries.peek_mut(&k) {
                    e.current_editor = Some(id);
                }
            }
            _ => {}
        }
    }
}

/// Where everything lives, and what the journal header must say.
#[derive(Debug, Clone)]
pub(crate) struct Layout {
    directory: PathBuf,
    header: Header,
}

impl Layout {
    pub(crate) fn value_count(&self) -> usize {
        self.header.value_count
    }

    pub(crate) fn clean_file(&self, key: &str, index: usize) -> PathBuf {
        self.directory.join(format!("{}.{}", key, index))
    }

    pub(crate) fn dirty_file(&self, key: &str, index: usize) -> PathBuf {
        self.directory.join(format!("{}.{}.tmp", key, index))
    }

    fn journal(&self) -> PathBuf {
        self.directory.join(JOURNAL_FILE)
    }

    fn journal_temp(&self) -> PathBuf {
        self.directory.join(JOURNAL_FILE_TEMP)
    }

    fn journal_backup(&self) -> PathBuf {
        self.directory.join(JOURNAL_FILE_BACKUP)
    }

    /// If a compaction died between moving the journal aside and moving the new one in, the backup is the journal.
    fn promote_backup(&self) -> std::io::Result<()> {
        let backup = self.journal_backup();
        if !backup.exists() {
            return Ok(());
        }
        if self.journal().exists() {
            fs::remove_file(backup)
        } else {
            fs::rename(backup, self.journal())
        }
    }

    /// Replay an existing journal into `state`, deleting anything belonging to edits which never finished.
    fn load(&self, state: &mut StoreState) -> Result<(), crate::journal::JournalError> {
        let replay = read_journal(&self.journal(), self.header)?;
        let line_count = replay.records.len();
        for record in replay.records {
            state.replay(record, self.value_count());
        }
        state.redundant_op_count = line_count.saturating_sub(state.entries.len());

        delete_if_exists(&self.journal_temp())?;

        // Entries still being edited when the journal ended are gone, along with all their files.
        let unfinished = state
            .entries
            .iter_lru()
            .filter(|(_, e)| e.current_editor.is_some() || !e.readable)
            .map(|(k, _)| k.clone())
            .collect::<Vec<_>>();
        for key in unfinished {
            state.entries.remove(&key);
            for i in 0..self.value_count() {
                delete_if_exists(&self.clean_file(&key, i))?;
                delete_if_exists(&self.dirty_file(&key, i))?;
            }
        }

        if replay.truncated {
            log::info!(
                "Journal in {} ends in a partial record, rewriting it",
                self.directory.display()
            );
            self.rebuild_journal(state)?;
        } else {
            state.journal = Some(JournalWriter::open_append(&self.journal())?);
        }
        Ok(())
    }

    /// Write a fresh journal from the index, swapping it in through a temp file so that a crash at any point leaves
    /// either the old or the new journal readable.
    ///
    /// The old writer stays in place until the new journal is open, so a failed rebuild leaves the store appending to
    /// the journal it had.
    fn rebuild_journal(&self, state: &mut StoreState) -> std::io::Result<()> {
        if let Some(old) = state.journal.as_mut() {
            old.flush()?;
        }

        let records = state
            .entries
            .iter_lru()
            .map(|(key, entry)| match entry.current_editor {
                Some(_) => Record::Dirty(key.to_string()),
                None => Record::Clean(key.to_string(), entry.lengths.clone()),
            })
            .collect::<Vec<_>>();
        JournalWriter::write_full(&self.journal_temp(), self.header, &records)?;

        let had_journal = self.journal().exists();
        if had_journal {
            fs::rename(self.journal(), self.journal_backup())?;
        }
        if let Err(e) = fs::rename(self.journal_temp(), self.journal()) {
            // Put the old journal back under its name; the old writer still has it open.
            if had_journal {
                let _ = fs::rename(self.journal_backup(), self.journal());
            }
            return Err(e);
        }
        let writer = JournalWriter::open_append(&self.journal())?;
        delete_if_exists(&self.journal_backup())?;

        state.journal = Some(writer);
        state.redundant_op_count = 0;
        log::debug!(
            "Rebuilt journal in {} with {} entries",
            self.directory.display(),
            records.len()
        );
        Ok(())
    }
}

fn delete_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

enum CleanupRequest {
    /// Evict down to the budget and compact the journal if needed.
    Trim,
    /// Reply once everything queued before this has run.
    Barrier(mpsc::Sender<()>),
}

pub(crate) struct StoreInner {
    pub(crate) layout: Layout,
    pub(crate) state: Mutex<StoreState>,
    cleanup_tx: Mutex<Option<mpsc::Sender<CleanupRequest>>>,
    cleanup_thread: Mutex<Option<JoinHandle<()>>>,
}

/// A journaled LRU of multi-value entries in a directory.  Cheap to clone; clones share the store.
#[derive(Clone)]
pub struct DiskLruStore {
    inner: Arc<StoreInner>,
}

impl DiskLruStore {
    /// Open the store in `directory`, creating it if needed.
    ///
    /// A journal written for a different `app_version` or `value_count`, or one that is corrupt, is not an error: the
    /// directory is emptied and the store starts over.
    ///
    /// # Panics
    ///
    /// If `value_count` is zero.
    pub fn open(
        directory: impl AsRef<Path>,
        app_version: u32,
        value_count: usize,
        max_size: u64,
    ) -> Result<DiskLruStore, StoreError> {
        assert!(value_count > 0, "Entries must hold at least one value");

        let layout = Layout {
            directory: directory.as_ref().to_path_buf(),
            header: Header {
                app_version,
                value_count,
            },
        };
        fs::create_dir_all(&layout.directory)?;
        layout.promote_backup()?;

        let mut state = StoreState::new(max_size);
        if layout.journal().exists() {
            match layout.load(&mut state) {
                Ok(()) => log::info!(
                    "Opened disk store in {} with {} entries, {} bytes",
                    layout.directory.display(),
                    state.entries.len(),
                    state.entries.current_cost()
                ),
                Err(e) => {
                    log::warn!(
                        "Disk store in {} is unusable ({}), starting over",
                        layout.directory.display(),
                        e
                    );
                    state = StoreState::new(max_size);
                    fs::remove_dir_all(&layout.directory)?;
                    fs::create_dir_all(&layout.directory)?;
                }
            }
        }
        if state.journal.is_none() {
            layout.rebuild_journal(&mut state)?;
        }

        let needs_cleanup = state.needs_cleanup();
        let (tx, rx) = mpsc::channel();
        let inner = Arc::new(StoreInner {
            layout,
            state: Mutex::new(state),
            cleanup_tx: Mutex::new(Some(tx)),
            cleanup_thread: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let join = thread::Builder::new()
            .name("resource-cache-cleanup".into())
            .spawn(move || cleanup_loop(weak, rx))?;
        *inner.cleanup_thread.lock() = Some(join);

        if needs_cleanup {
            inner.schedule_cleanup();
        }
        Ok(DiskLruStore { inner })
    }

    pub fn directory(&self) -> &Path {
        &self.inner.layout.directory
    }

    pub fn value_count(&self) -> usize {
        self.inner.layout.value_count()
    }

    /// Bytes currently used by committed values.
    pub fn size(&self) -> u64 {
        self.inner.state.lock().entries.current_cost()
    }

    pub fn max_size(&self) -> u64 {
        self.inner.state.lock().entries.max_cost()
    }

    /// Change the budget.  Shrinking evicts in the background.
    pub fn set_max_size(&self, max_size: u64) {
        let mut state = self.inner.state.lock();
        state.entries.set_max_cost(max_size);
        if state.needs_cleanup() {
            self.inner.schedule_cleanup();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().journal.is_none()
    }

    /// Read a committed entry.  Returns `None` if there is no such entry or its files are unreadable; in the latter
    /// case the entry is dropped.
    pub fn get(&self, key: &str) -> Result<Option<Snapshot>, StoreError> {
        validate_key(key)?;
        let inner = &self.inner;
        let mut state = inner.state.lock();
        state.check_not_closed()?;

        let (sequence_number, lengths) = match state.entries.peek(key) {
            Some(e) if e.readable => (e.sequence_number, e.lengths.clone()),
            _ => return Ok(None),
        };

        let mut files = Vec::with_capacity(lengths.len());
        for i in 0..lengths.len() {
            match fs::File::open(inner.layout.clean_file(key, i)) {
                Ok(f) => files.push(f),
                Err(e) => {
                    let editing = state
                        .entries
                        .peek(key)
                        .map_or(false, |entry| entry.current_editor.is_some());
                    // The editor settles the entry when it finishes.
                    if editing {
                        log::warn!(
                            "Value {} of {} is unreadable ({}) while it is being edited",
                            i,
                            key,
                            e
                        );
                        return Ok(None);
                    }
                    log::warn!("Value {} of {} is unreadable ({}), dropping the entry", i, key, e);
                    inner.remove_locked(&mut state, key)?;
                    return Ok(None);
                }
            }
        }

        state.redundant_op_count += 1;
        state.append(Record::Read(key.to_string()))?;
        state.entries.touch(key);
        if state.journal_rebuild_required() {
            inner.schedule_cleanup();
        }

        Ok(Some(Snapshot {
            store: inner.clone(),
            key: key.to_string(),
            sequence_number,
            files,
            lengths,
        }))
    }

    /// Start editing an entry.  Returns `None` if another edit of it is in progress.
    pub fn edit(&self, key: &str) -> Result<Option<Editor>, StoreError> {
        self.inner.edit(key, None)
    }

    /// Remove a committed entry.  Returns false if there was nothing to remove or the entry is being edited.
    pub fn remove(&self, key: &str) -> Result<bool, StoreError> {
        validate_key(key)?;
        let mut state = self.inner.state.lock();
        state.check_not_closed()?;
        match state.entries.peek(key) {
            Some(e) if e.current_editor.is_none() => {}
            _ => return Ok(false),
        }
        self.inner.remove_locked(&mut state, key)?;
        Ok(true)
    }

    /// Evict down to the budget now and push the journal to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        let mut state = self.inner.state.lock();
        state.check_not_closed()?;
        self.inner.trim_to_size_locked(&mut state)?;
        if let Some(j) = state.journal.as_mut() {
            j.flush()?;
        }
        Ok(())
    }

    /// Block until every cleanup scheduled so far has run.
    pub fn wait_for_cleanup(&self) {
        let (tx, rx) = mpsc::channel();
        let sent = match self.inner.cleanup_tx.lock().as_ref() {
            Some(cleanup) => cleanup.send(CleanupRequest::Barrier(tx)).is_ok(),
            None => false,
        };
        if sent {
            let _ = rx.recv();
        }
    }

    /// Trim and flush, then refuse any further operations.  Editors still open will fail to commit.
    pub fn close(&self) -> Result<(), StoreError> {
        let mut state = self.inner.state.lock();
        if state.journal.is_none() {
            return Ok(());
        }
        self.inner.trim_to_size_locked(&mut state)?;
        if let Some(mut j) = state.journal.take() {
            j.flush()?;
        }
        Ok(())
    }

    /// Close the store and delete its directory, including files it doesn't know about.
    pub fn delete(&self) -> Result<(), StoreError> {
        self.close()?;
        fs::remove_dir_all(self.directory())?;
        Ok(())
    }
}

impl std::fmt::Debug for DiskLruStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskLruStore")
            .field("directory", &self.inner.layout.directory)
            .finish()
    }
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if !is_valid_disk_key(key) {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

impl StoreInner {
    fn schedule_cleanup(&self) {
        if let Some(tx) = self.cleanup_tx.lock().as_ref() {
            let _ = tx.send(CleanupRequest::Trim);
        }
    }

    /// Start an edit, optionally only if the entry is still at a given sequence number.
    pub(crate) fn edit(
        self: &Arc<Self>,
        key: &str,
        expected_sequence: Option<u64>,
    ) -> Result<Option<Editor>, StoreError> {
        validate_key(key)?;
        let mut state = self.state.lock();
        state.check_not_closed()?;

        if let Some(expected) = expected_sequence {
            match state.entries.peek(key) {
                Some(e) if e.sequence_number == expected => {}
                _ => return Ok(None),
            }
        }

        let created = !state.entries.touch(key);
        if created {
            state
                .entries
                .insert(key.into(), Entry::new(self.layout.value_count()), 0);
        }

        let editor_id = state.next_editor_id;
        let readable = match state.entries.peek_mut(key) {
            Some(e) if e.current_editor.is_some() => return Ok(None),
            Some(e) => {
                e.current_editor = Some(editor_id);
                e.readable
            }
            None => unreachable!("entry was just inserted"),
        };
        state.next_editor_id += 1;

        // Nothing may observe the edit unless the journal says it started.
        if let Err(e) = state.append(Record::Dirty(key.to_string())) {
            if created {
                state.entries.remove(key);
            } else if let Some(entry) = state.entries.peek_mut(key) {
                entry.current_editor = None;
            }
            return Err(e);
        }

        Ok(Some(Editor::new(self.clone(), key.to_string(), editor_id, readable)))
    }

    /// Finish an edit started by `editor_id`, either committing the values marked in `written` or discarding them.
    ///
    /// # Panics
    ///
    /// If committing an entry which has never been committed before, and some value wasn't written.  The edit is
    /// aborted first.
    pub(crate) fn complete_edit(
        &self,
        key: &str,
        editor_id: u64,
        written: &[bool],
        success: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let owned = matches!(
            state.entries.peek(key),
            Some(e) if e.current_editor == Some(editor_id)
        );
        // The temp files may belong to whoever edits the entry now, so leave them alone.
        if !owned {
            return if success {
                Err(StoreError::StaleEditor(key.to_string()))
            } else {
                Ok(())
            };
        }
        if state.journal.is_none() {
            self.delete_dirty_files(key);
            return if success {
                Err(StoreError::Closed)
            } else {
                Ok(())
            };
        }

        let readable = state.entries.peek(key).map_or(false, |e| e.readable);
        if success && !readable {
            if let Some(missing) = written.iter().position(|w| !w) {
                self.finish_edit_locked(&mut state, key, written, false)?;
                drop(state);
                panic!(
                    "Newly created entry {} didn't create a value for index {}",
                    key, missing
                );
            }
        }

        self.finish_edit_locked(&mut state, key, written, success)
    }

    fn finish_edit_locked(
        &self,
        state: &mut StoreState,
        key: &str,
        written: &[bool],
        success: bool,
    ) -> Result<(), StoreError> {
        let (mut lengths, readable) = match state.entries.peek(key) {
            Some(e) => (e.lengths.clone(), e.readable),
            None => return Ok(()),
        };

        if success {
            for (i, _) in written.iter().enumerate().filter(|(_, w)| **w) {
                let clean = self.layout.clean_file(key, i);
                let renamed = fs::rename(self.layout.dirty_file(key, i), &clean)
                    .and_then(|_| fs::metadata(&clean));
                match renamed {
                    Ok(meta) => lengths[i] = meta.len(),
                    Err(e) => {
                        // Some values may already have been replaced, so the entry can't be trusted anymore.
                        log::warn!("Failed to commit value {} of {}: {}", i, key, e);
                        self.delete_dirty_files(key);
                        if let Some(entry) = state.entries.peek_mut(key) {
                            entry.current_editor = None;
                        }
                        self.remove_locked(state, key)?;
                        return Err(e.into());
                    }
                }
            }
        }
        self.delete_dirty_files(key);

        state.redundant_op_count += 1;
        if readable || success {
            let sequence_number = if success {
                state.next_sequence_number += 1;
                Some(state.next_sequence_number)
            } else {
                None
            };
            if let Some(entry) = state.entries.peek_mut(key) {
                entry.current_editor = None;
                entry.readable = true;
                entry.lengths = lengths.clone();
                if let Some(seq) = sequence_number {
                    entry.sequence_number = seq;
                }
            }
            state.entries.set_cost(key, lengths.iter().sum());
            state.append(Record::Clean(key.to_string(), lengths))?;
        } else {
            state.entries.remove(key);
            state.append(Record::Remove(key.to_string()))?;
        }

        if state.needs_cleanup() {
            self.schedule_cleanup();
        }
        Ok(())
    }

    fn delete_dirty_files(&self, key: &str) {
        for i in 0..self.layout.value_count() {
            if let Err(e) = delete_if_exists(&self.layout.dirty_file(key, i)) {
                log::warn!("Failed to delete temp value {} of {}: {}", i, key, e);
            }
        }
    }

    /// Drop an entry that nobody is editing, with its files.
    fn remove_locked(&self, state: &mut StoreState, key: &str) -> Result<(), StoreError> {
        if state.entries.remove(key).is_none() {
            return Ok(());
        }
        for i in 0..self.layout.value_count() {
            if let Err(e) = delete_if_exists(&self.layout.clean_file(key, i)) {
                log::warn!("Failed to delete value {} of {}: {}", i, key, e);
            }
        }

        state.redundant_op_count += 1;
        state.append(Record::Remove(key.to_string()))?;
        if state.journal_rebuild_required() {
            self.schedule_cleanup();
        }
        Ok(())
    }

    /// Evict least recently used entries until the store is within budget.  Entries being edited are skipped.
    fn trim_to_size_locked(&self, state: &mut StoreState) -> Result<(), StoreError> {
        while state.entries.current_cost() > state.entries.max_cost() {
            let victim = state
                .entries
                .iter_lru()
                .find(|(_, e)| e.readable && e.current_editor.is_none())
                .map(|(k, e)| (k.clone(), e.total_length()));
            let (key, size) = match victim {
                Some(v) => v,
                None => break,
            };
            log::debug!("Evicting {} ({} bytes) from the disk store", key, size);
            self.remove_locked(state, &key)?;
        }
        Ok(())
    }

    fn cleanup(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.journal.is_none() {
            return Ok(());
        }
        self.trim_to_size_locked(&mut state)?;
        if state.journal_rebuild_required() {
            self.layout.rebuild_journal(&mut state)?;
        }
        Ok(())
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        // Dropping the sender ends the cleanup loop.
        self.cleanup_tx.lock().take();
        if let Some(join) = self.cleanup_thread.lock().take() {
            // The cleanup thread can hold the last reference for a moment; it can't join itself.
            if join.thread().id() != thread::current().id() {
                let _ = join.join();
            }
        }
    }
}

fn cleanup_loop(store: Weak<StoreInner>, requests: mpsc::Receiver<CleanupRequest>) {
    while let Ok(request) = requests.recv() {
        match request {
            CleanupRequest::Trim => {
                let inner = match store.upgrade() {
                    Some(i) => i,
                    None => break,
                };
                if let Err(e) = inner.cleanup() {
                    log::warn!(
                        "Disk store cleanup in {} failed: {}",
                        inner.layout.directory.display(),
                        e
                    );
                }
            }
            CleanupRequest::Barrier(reply) => {
                let _ = reply.send(());
            }
        }
    }
}
