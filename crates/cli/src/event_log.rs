//! A tiny text transaction log for the shell.
//!
//! Each line is one record and a record's position is the byte offset of its
//! line:
//!
//! ```text
//! ADD orders 0
//! ADD orders 1
//! DELETE orders
//! ```
//!
//! `DELETE` hides every earlier event of the stream, which is what lets
//! merges and scavenges drop index entries end to end.

use anyhow::{bail, Context, Result};
use index::LogReader;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub stream: String,
    pub number: i64,
    pub position: i64,
}

struct LogState {
    file: File,
    len: i64,
    events: HashMap<i64, Event>,
    /// Stream -> position of its latest DELETE.
    deleted: HashMap<String, i64>,
}

pub struct EventLog {
    state: RwLock<LogState>,
}

impl EventLog {
    /// Opens (or creates) the log at `path` and reads every record.
    pub fn open(path: &Path) -> Result<Self> {
        let mut events = HashMap::new();
        let mut deleted = HashMap::new();
        let mut len = 0i64;

        if path.exists() {
            let reader = BufReader::new(
                File::open(path).with_context(|| format!("opening {}", path.display()))?,
            );
            for line in reader.lines() {
                let line = line?;
                let position = len;
                len += line.len() as i64 + 1;
                match parse_record(&line, position)? {
                    Record::Add(e) => {
                        events.insert(position, e);
                    }
                    Record::Delete(stream) => {
                        deleted.insert(stream, position);
                    }
                    Record::Blank => {}
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            state: RwLock::new(LogState {
                file,
                len,
                events,
                deleted,
            }),
        })
    }

    /// Appends an event and returns its position.
    pub fn append_event(&self, stream: &str, number: i64) -> Result<i64> {
        check_stream(stream)?;
        let mut state = self.state.write();
        let position = write_line(&mut state, &format!("ADD {} {}", stream, number))?;
        state.events.insert(
            position,
            Event {
                stream: stream.to_string(),
                number,
                position,
            },
        );
        Ok(position)
    }

    /// Appends a stream deletion and returns its position.
    pub fn append_delete(&self, stream: &str) -> Result<i64> {
        check_stream(stream)?;
        let mut state = self.state.write();
        let position = write_line(&mut state, &format!("DELETE {}", stream))?;
        state.deleted.insert(stream.to_string(), position);
        Ok(position)
    }

    /// Byte length of the log; everything before it is durable.
    pub fn end_position(&self) -> i64 {
        self.state.read().len
    }

    /// Events recorded after `position`, in log order.
    pub fn events_after(&self, position: i64) -> Vec<Event> {
        let state = self.state.read();
        let mut events: Vec<Event> = state
            .events
            .values()
            .filter(|e| e.position > position)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.position);
        events
    }

    /// Whether the stream was deleted after `position`.
    pub fn is_deleted(&self, stream: &str, position: i64) -> bool {
        self.state
            .read()
            .deleted
            .get(stream)
            .map_or(false, |&at| at > position)
    }
}

impl LogReader for EventLog {
    fn exists_at(&self, position: i64) -> bool {
        let state = self.state.read();
        match state.events.get(&position) {
            Some(e) => state
                .deleted
                .get(&e.stream)
                .map_or(true, |&at| at < position),
            None => false,
        }
    }

    fn read_stream(&self, position: i64) -> Option<String> {
        self.state
            .read()
            .events
            .get(&position)
            .map(|e| e.stream.clone())
    }
}

enum Record {
    Add(Event),
    Delete(String),
    Blank,
}

fn parse_record(line: &str, position: i64) -> Result<Record> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        [] => Ok(Record::Blank),
        ["ADD", stream, number] => Ok(Record::Add(Event {
            stream: stream.to_string(),
            number: number
                .parse()
                .with_context(|| format!("bad event number at position {}", position))?,
            position,
        })),
        ["DELETE", stream] => Ok(Record::Delete(stream.to_string())),
        _ => bail!("unreadable log record at position {}: {:?}", position, line),
    }
}

fn write_line(state: &mut LogState, line: &str) -> Result<i64> {
    let position = state.len;
    state.file.write_all(line.as_bytes())?;
    state.file.write_all(b"\n")?;
    state.file.sync_data()?;
    state.len += line.len() as i64 + 1;
    Ok(position)
}

fn check_stream(stream: &str) -> Result<()> {
    if stream.is_empty() || stream.contains(char::is_whitespace) {
        bail!("stream names must be non-empty and contain no whitespace");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn positions_are_line_offsets() -> Result<()> {
        let dir = tempdir()?;
        let log = EventLog::open(&dir.path().join("events.log"))?;
        assert_eq!(log.append_event("a", 0)?, 0);
        // "ADD a 0\n" is 8 bytes.
        assert_eq!(log.append_event("a", 1)?, 8);
        assert_eq!(log.end_position(), 16);
        assert_eq!(log.read_stream(8).as_deref(), Some("a"));
        assert!(!log.exists_at(3));
        Ok(())
    }

    #[test]
    fn delete_hides_earlier_events_only() -> Result<()> {
        let dir = tempdir()?;
        let log = EventLog::open(&dir.path().join("events.log"))?;
        let first = log.append_event("a", 0)?;
        log.append_delete("a")?;
        let later = log.append_event("a", 1)?;

        assert!(!log.exists_at(first));
        assert!(log.exists_at(later));
        assert!(log.is_deleted("a", first));
        assert!(!log.is_deleted("a", later));
        Ok(())
    }

    #[test]
    fn reopen_reads_existing_records() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("events.log");
        {
            let log = EventLog::open(&path)?;
            log.append_event("a", 0)?;
            log.append_event("b", 0)?;
            log.append_delete("a")?;
        }
        let log = EventLog::open(&path)?;
        let events = log.events_after(-1);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].stream, "b");
        assert!(!log.exists_at(events[0].position));
        assert_eq!(log.append_event("c", 0)?, log.end_position() - 8);
        Ok(())
    }

    #[test]
    fn bad_stream_names_are_rejected() -> Result<()> {
        let dir = tempdir()?;
        let log = EventLog::open(&dir.path().join("events.log"))?;
        assert!(log.append_event("", 0).is_err());
        assert!(log.append_event("two words", 0).is_err());
        Ok(())
    }

    #[test]
    fn garbage_line_fails_open() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("events.log");
        std::fs::write(&path, "ADD a 0\nWHAT\n")?;
        assert!(EventLog::open(&path).is_err());
        Ok(())
    }
}
