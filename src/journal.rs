//! The on-disk journal of a [crate::DiskLruStore].
//!
//! The journal is a text file.  Its header is five lines: a magic string, the journal format version, the application
//! version, the number of values per entry, and a blank line.  Every following line is one [Record]:
//!
//! ```text
//! DIRTY 3400330d1dfc7f3f7f4b8d4d803dfcf6
//! CLEAN 3400330d1dfc7f3f7f4b8d4d803dfcf6 832 21054
//! READ 3400330d1dfc7f3f7f4b8d4d803dfcf6
//! REMOVE 3400330d1dfc7f3f7f4b8d4d803dfcf6
//! ```
//!
//! `DIRTY` opens an edit, which `CLEAN` (with one size per value) or `REMOVE` closes.  `READ` only records recency.
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::key::is_valid_disk_key;

pub(crate) const JOURNAL_FILE: &str = "journal";
pub(crate) const JOURNAL_FILE_TEMP: &str = "journal.tmp";
pub(crate) const JOURNAL_FILE_BACKUP: &str = "journal.bkp";

pub(crate) const MAGIC: &str = "resource_cache.DiskLruStore";
pub(crate) const VERSION: &str = "1";

#[derive(Debug, thiserror::Error)]
pub(crate) enum JournalError {
    #[error("unexpected journal header: [{0}]")]
    Header(String),
    #[error("unexpected journal line: {0:?}")]
    Line(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Record {
    Dirty(String),
    Clean(String, Vec<u64>),
    Remove(String),
    Read(String),
}

impl Record {
    pub(crate) fn parse(line: &str, value_count: usize) -> Result<Record, JournalError> {
        let bad = || JournalError::Line(line.to_string());
        let mut parts = line.split(' ');
        let op = parts.next().ok_or_else(bad)?;
        let key = parts.next().ok_or_else(bad)?;
        if !is_valid_disk_key(key) {
            return Err(bad());
        }
        let key = key.to_string();

        let record = match op {
            "CLEAN" => {
                let sizes = parts
                    .map(|p| p.parse::<u64>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| bad())?;
                if sizes.len() != value_count {
                    return Err(bad());
                }
                return Ok(Record::Clean(key, sizes));
            }
            "DIRTY" => Record::Dirty(key),
            "REMOVE" => Record::Remove(key),
            "READ" => Record::Read(key),
            _ => return Err(bad()),
        };

        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(record)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Record::Dirty(k) => write!(f, "DIRTY {}", k),
            Record::Remove(k) => write!(f, "REMOVE {}", k),
            Record::Read(k) => write!(f, "READ {}", k),
            Record::Clean(k, sizes) => {
                write!(f, "CLEAN {}", k)?;
                for s in sizes {
                    write!(f, " {}", s)?;
                }
                Ok(())
            }
        }
    }
}

/// What must match for a journal to be reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Header {
    pub(crate) app_version: u32,
    pub(crate) value_count: usize,
}

impl Header {
    fn write_to(&self, out: &mut impl Write) -> std::io::Result<()> {
        writeln!(out, "{}", MAGIC)?;
        writeln!(out, "{}", VERSION)?;
        writeln!(out, "{}", self.app_version)?;
        writeln!(out, "{}", self.value_count)?;
        writeln!(out)
    }
}

/// The records of a journal, in order.
#[derive(Debug)]
pub(crate) struct Replay {
    pub(crate) records: Vec<Record>,
    /// The last line had no terminating newline, so the writer died mid-record.  That record is dropped.
    pub(crate) truncated: bool,
}

/// Read and check a whole journal.
pub(crate) fn read_journal(path: &Path, header: Header) -> Result<Replay, JournalError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut line = String::new();

    let expected = [
        MAGIC.to_string(),
        VERSION.to_string(),
        header.app_version.to_string(),
        header.value_count.to_string(),
        String::new(),
    ];
    let mut found = Vec::with_capacity(expected.len());
    for _ in 0..expected.len() {
        line.clear();
        if reader.read_line(&mut line)? == 0 || !line.ends_with('\n') {
            return Err(JournalError::Header(found.join(", ")));
        }
        found.push(line.trim_end_matches('\n').to_string());
    }
    if found[..] != expected[..] {
        return Err(JournalError::Header(found.join(", ")));
    }

    let mut records = vec![];
    let mut truncated = false;
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        if !line.ends_with('\n') {
            truncated = true;
            break;
        }
        records.push(Record::parse(line.trim_end_matches('\n'), header.value_count)?);
    }

    Ok(Replay { records, truncated })
}

/// Appends records to a journal.
pub(crate) struct JournalWriter {
    out: BufWriter<File>,
}

impl JournalWriter {
    pub(crate) fn open_append(path: &Path) -> std::io::Result<JournalWriter> {
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(JournalWriter {
            out: BufWriter::new(file),
        })
    }

    /// Write a complete journal to `path`, replacing anything there, and make sure it reached the disk.
    pub(crate) fn write_full<'a>(
        path: &Path,
        header: Header,
        records: impl IntoIterator<Item = &'a Record>,
    ) -> std::io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut out = BufWriter::new(file);
        header.write_to(&mut out)?;
        for r in records {
            writeln!(out, "{}", r)?;
        }
        out.flush()?;
        out.get_ref().sync_all()
    }

    /// Append a record.  Records which close or open an edit are flushed straight away; `READ` is left buffered.
    pub(crate) fn append(&mut self, record: &Record) -> std::io::Result<()> {
        writeln!(self.out, "{}", record)?;
        if !matches!(record, Record::Read(_)) {
            self.out.flush()?;
        }
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: Header = Header {
        app_version: 7,
        value_count: 2,
    };

    #[test]
    fn test_parse_records() {
        assert_eq!(
            Record::parse("CLEAN k1 2 1", 2).unwrap(),
            Record::Clean("k1".into(), vec![2, 1])
        );
        assert_eq!(Record::parse("DIRTY k1", 2).unwrap(), Record::Dirty("k1".into()));
        assert_eq!(Record::parse("REMOVE k1", 2).unwrap(), Record::Remove("k1".into()));
        assert_eq!(Record::parse("READ k1", 2).unwrap(), Record::Read("k1".into()));
        assert_eq!(
            Record::Clean("k1".into(), vec![2, 1]).to_string(),
            "CLEAN k1 2 1"
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for line in &[
            "",
            "CLEAN k1 2",
            "CLEAN k1 2 x",
            "CLEAN k1 1 2 3",
            "DIRTY",
            "DIRTY k1 extra",
            "WRITE k1",
            "READ K1",
            "READ k 1",
        ] {
            assert!(
                matches!(Record::parse(line, 2), Err(JournalError::Line(_))),
                "{:?} should not parse",
                line
            );
        }
    }

    #[test]
    fn test_round_trip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(JOURNAL_FILE);
        let records = vec![Record::Dirty("a".into()), Record::Clean("a".into(), vec![1, 2])];
        JournalWriter::write_full(&path, HEADER, &records).unwrap();

        let mut writer = JournalWriter::open_append(&path).unwrap();
        writer.append(&Record::Read("a".into())).unwrap();
        writer.flush().unwrap();

        let replay = read_journal(&path, HEADER).unwrap();
        assert!(!replay.truncated);
        assert_eq!(replay.records.len(), 3);
        assert_eq!(replay.records[2], Record::Read("a".into()));
    }

    #[test]
    fn test_header_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(JOURNAL_FILE);
        JournalWriter::write_full(&path, HEADER, &[]).unwrap();

        let other_app = Header {
            app_version: 8,
            ..HEADER
        };
        assert!(matches!(
            read_journal(&path, other_app),
            Err(JournalError::Header(_))
        ));
        let other_count = Header {
            value_count: 1,
            ..HEADER
        };
        assert!(matches!(
            read_journal(&path, other_count),
            Err(JournalError::Header(_))
        ));

        std::fs::write(&path, "garbage\n").unwrap();
        assert!(matches!(read_journal(&path, HEADER), Err(JournalError::Header(_))));
    }

    #[test]
    fn test_truncated_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(JOURNAL_FILE);
        JournalWriter::write_full(&path, HEADER, &[Record::Dirty("a".into())]).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"CLEAN a 1").unwrap();

        let replay = read_journal(&path, HEADER).unwrap();
        assert!(replay.truncated);
        assert_eq!(replay.records, vec![Record::Dirty("a".into())]);
    }
}
