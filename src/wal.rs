use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Largest payload a journal entry may carry. A longer length prefix can only
/// come from a torn or corrupt write.
pub const MAX_EVENT_BYTES: usize = 16 * 1024 * 1024;

/// Framing around each payload: length prefix and CRC.
const FRAME_BYTES: u64 = 8;

/// Encode one event as `[len][bincode][crc32]`. Returns the bytes written.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_EVENT_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("event of {} bytes exceeds the journal limit", payload.len()),
        ));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(payload.len() as u64 + FRAME_BYTES)
}

/// Read one entry and its size on disk. `Ok(None)` means a clean end, a torn
/// tail, an oversized length or a bad checksum: everything from that point on
/// is discarded.
fn read_entry(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_EVENT_BYTES {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload)
        .ok()
        .map(|event| (event, len as u64 + FRAME_BYTES)))
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Valid events on disk and the byte offset just past the last of them.
fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut valid_len = 0;
    while let Some((event, size)) = read_entry(&mut reader)? {
        events.push(event);
        valid_len += size;
    }
    Ok((events, valid_len))
}

/// Append-only journal of document mutations.
///
/// A crash mid-append leaves a torn last entry. Opening the journal cuts the
/// file back to the last valid entry, so new appends are always readable.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// Bytes known to be on disk and fsynced.
    synced_len: u64,
    /// Bytes handed to the writer since the last fsync.
    pending_len: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self::recover(path)?.0)
    }

    /// Open for append after replaying, truncating any torn or corrupt tail.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = scan(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            warn!(
                "journal {}: dropping {} bytes after the last valid entry",
                path.display(),
                on_disk - valid_len
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            synced_len: valid_len,
            pending_len: 0,
        };
        Ok((wal, events))
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event; durable only after `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.pending_len += encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len += self.pending_len;
        self.pending_len = 0;
        Ok(())
    }

    /// Discard everything since the last successful `flush_sync`, whether still
    /// buffered or partly written, leaving the file on an entry boundary.
    pub fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts drops the buffer unwritten
        let _ = stale.into_parts();
        self.writer.get_ref().set_len(self.synced_len)?;
        self.writer.get_ref().sync_all()?;
        self.pending_len = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Rewrite the journal as `events`: write a temp file, fsync, rename over, reopen.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        let mut written = 0;
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                written += encode_event(&mut writer, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.synced_len = written;
        self.pending_len = 0;
        Ok(())
    }

    /// All valid events on disk, oldest first. A missing file is an empty journal.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(scan(path)?.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("bookd_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn schedule_event() -> Event {
        Event::SchedulePut {
            schedule: Schedule::new(Ulid::new(), Ulid::new(), 2),
        }
    }

    fn lease_event(key: &str) -> Event {
        Event::LeaseWritten {
            lease: Lease {
                lock_key: key.into(),
                token: Ulid::new(),
                holder: "test".into(),
                expires_at: 5_000,
                created_at: 0,
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![schedule_event(), lease_event("booking:a")];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn replay_drops_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = schedule_event();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let good = schedule_event();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&lease_event("x")).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn compact_shrinks_lease_churn() {
        let path = tmp_path("compact_churn.wal");
        let schedule = schedule_event();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&schedule).unwrap();
            for _ in 0..20 {
                let Event::LeaseWritten { lease } = lease_event("booking:s") else {
                    unreachable!()
                };
                wal.append(&Event::LeaseDeleted {
                    lock_key: lease.lock_key.clone(),
                    token: lease.token,
                })
                .unwrap();
                wal.append(&Event::LeaseWritten { lease }).unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(std::slice::from_ref(&schedule)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted journal should be smaller: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), vec![schedule]);
    }

    #[test]
    fn append_after_compact() {
        let path = tmp_path("append_after_compact.wal");
        let schedule = schedule_event();
        let lease = lease_event("booking:t");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&schedule).unwrap();
            wal.compact(std::slice::from_ref(&schedule)).unwrap();
            wal.append(&lease).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![schedule, lease]);
    }

    #[test]
    fn buffered_appends_are_counted() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|_| schedule_event()).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn reopen_cuts_garbage_before_appending() {
        let path = tmp_path("reopen_garbage.wal");
        let first = schedule_event();
        let second = lease_event("booking:g");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let valid_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xAB, 0x01]).unwrap();
        }

        let (mut wal, replayed) = Wal::recover(&path).unwrap();
        assert_eq!(replayed, vec![first.clone()]);
        assert_eq!(fs::metadata(&path).unwrap().len(), valid_len);
        wal.append(&second).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn oversized_length_prefix_ends_replay() {
        let path = tmp_path("oversized.wal");
        let good = schedule_event();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[0u8; 16]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good.clone()]);

        let wal = Wal::open(&path).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn rollback_discards_unsynced_batch() {
        let path = tmp_path("rollback.wal");
        let kept = schedule_event();
        // Larger than the writer's buffer, so part of it reaches the file
        let dropped = Event::SchedulePut {
            schedule: Schedule {
                name: Some("x".repeat(64 * 1024)),
                ..Schedule::new(Ulid::new(), Ulid::new(), 1)
            },
        };
        let after = lease_event("booking:r");

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();
        let synced = fs::metadata(&path).unwrap().len();
        wal.append_buffered(&dropped).unwrap();
        assert!(fs::metadata(&path).unwrap().len() > synced);

        wal.rollback().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), synced);
        wal.append(&after).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, after]);
    }
}
