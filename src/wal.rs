use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use crate::model::Commit;

/// Records longer than this are never written, and a length header above it
/// is read as corruption.
pub const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// Frame one commit as `[u32 len][bincode payload][u32 crc32]`, little endian.
fn encode_record(commit: &Commit) -> io::Result<Vec<u8>> {
    let payload =
        bincode::serialize(commit).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "commit record too large"));
    }
    let len = payload.len() as u32;
    let mut record = Vec::with_capacity(payload.len() + 8);
    record.extend_from_slice(&len.to_le_bytes());
    record.extend_from_slice(&payload);
    record.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(record)
}

/// Read the next complete record and its framed size. `Ok(None)` marks the end
/// of the usable log: clean EOF, a torn tail from a crash, or a record whose
/// length, CRC or payload is bad.
fn read_record(reader: &mut impl Read) -> io::Result<Option<(Commit, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
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
    Ok(bincode::deserialize::<Commit>(&payload)
        .ok()
        .map(|commit| (commit, len as u64 + 8)))
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Every intact commit in log order, plus the byte length of that intact prefix.
fn scan(path: &Path) -> io::Result<(Vec<Commit>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut commits = Vec::new();
    let mut intact = 0u64;
    while let Some((commit, size)) = read_record(&mut reader)? {
        commits.push(commit);
        intact += size;
    }
    Ok((commits, intact))
}

/// Append-only ledger of commits.
///
/// A commit is one record, so a crash can never leave half of a logical
/// operation on disk: the torn record fails its length or CRC check, replay
/// stops just before it, and reopening cuts it off so new records land right
/// after the last good one.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length covered by the last successful `flush_sync`.
    durable_len: u64,
    pending_len: u64,
    pending_appends: u64,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::recover(path).map(|(wal, _)| wal)
    }

    /// Replay the log, cut off anything after the last intact record, and
    /// open it for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Commit>)> {
        let (commits, intact) = scan(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > intact {
            warn!(
                path = %path.display(),
                discarded = on_disk - intact,
                "truncating unreadable WAL tail"
            );
            file.set_len(intact)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            durable_len: intact,
            pending_len: 0,
            pending_appends: 0,
            appends_since_compact: 0,
        };
        Ok((wal, commits))
    }

    #[cfg(test)]
    pub fn append(&mut self, commit: &Commit) -> io::Result<()> {
        self.append_buffered(commit)?;
        self.flush_sync()
    }

    /// Buffer a commit. Not durable until `flush_sync`.
    pub fn append_buffered(&mut self, commit: &Commit) -> io::Result<()> {
        let record = encode_record(commit)?;
        self.writer.write_all(&record)?;
        self.pending_len += record.len() as u64;
        self.pending_appends += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.durable_len += self.pending_len;
        self.appends_since_compact += self.pending_appends;
        self.pending_len = 0;
        self.pending_appends = 0;
        Ok(())
    }

    /// Forget everything appended since the last successful `flush_sync`,
    /// whether it is still buffered or already partly written to the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the unwritten buffer instead of flushing it
        let (_old_file, _unwritten) = stale.into_parts();
        self.pending_len = 0;
        self.pending_appends = 0;
        let file = self.writer.get_ref();
        if let Err(e) = file.set_len(self.durable_len).and_then(|()| file.sync_all()) {
            error!(path = %self.path.display(), "WAL rollback failed: {e}");
            return Err(e);
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("wal.tmp")
    }

    /// Write `commits` to a fresh log beside this one, then rename it into place.
    pub fn rewrite(&mut self, commits: &[Commit]) -> io::Result<()> {
        let tmp_path = self.tmp_path();
        let mut written = 0u64;
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for commit in commits {
                let record = encode_record(commit)?;
                writer.write_all(&record)?;
                written += record.len() as u64;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.durable_len = written;
        self.pending_len = 0;
        self.pending_appends = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact commit, in log order. A missing file is an empty ledger.
    pub fn replay(path: &Path) -> io::Result<Vec<Commit>> {
        scan(path).map(|(commits, _)| commits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Booking, BookingStatus, Change, Span};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("stationd_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn station_created(seq: u64) -> Commit {
        Commit {
            seq,
            at: 1_000,
            changes: vec![Change::StationCreated {
                id: Ulid::new(),
                name: format!("pc-{seq:02}"),
                at: 1_000,
            }],
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let sid = Ulid::new();
        let booking = Booking {
            id: Ulid::new(),
            station_id: sid,
            person_id: Ulid::new(),
            span: Span::new(1_000, 2_000),
            status: BookingStatus::Scheduled,
            created_at: 500,
        };
        let commits = vec![
            station_created(1),
            Commit {
                seq: 2,
                at: 500,
                changes: vec![
                    Change::BookingInserted { booking: booking.clone() },
                    Change::QuotaDecremented { id: booking.person_id, remaining: 3 },
                ],
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for c in &commits {
                wal.append(c).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), commits);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn torn_tail_is_discarded() {
        let path = tmp_path("torn_tail.wal");
        let _ = fs::remove_file(&path);

        let first = station_created(1);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0x20, 0, 0, 0, 1, 2]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first.clone()]);

        let second = station_created(2);
        Wal::open(&path).unwrap().append(&second).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_replays_empty() {
        let path = tmp_path("missing.wal");
        let _ = fs::remove_file(&path);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn bad_crc_is_cut_off_and_later_appends_survive() {
        let path = tmp_path("bad_crc.wal");
        let _ = fs::remove_file(&path);

        let good = station_created(1);
        let bad = station_created(2);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good.clone()]);

        let after_restart = station_created(2);
        {
            let (mut wal, replayed) = Wal::recover(&path).unwrap();
            assert_eq!(replayed, vec![good.clone()]);
            wal.append(&after_restart).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good, after_restart]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn oversized_length_header_ends_log() {
        let path = tmp_path("oversized.wal");
        let _ = fs::remove_file(&path);

        let first = station_created(1);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(MAX_RECORD_LEN as u32 + 1).to_le_bytes()).unwrap();
            f.write_all(&[7u8; 16]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first.clone()]);

        let next = station_created(2);
        Wal::open(&path).unwrap().append(&next).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, next]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_discards_records_written_since_last_sync() {
        let path = tmp_path("rollback.wal");
        let _ = fs::remove_file(&path);

        let kept = station_created(1);
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();

        // One record reached the file, one is still buffered; neither was synced.
        wal.append_buffered(&station_created(2)).unwrap();
        wal.writer.flush().unwrap();
        wal.append_buffered(&station_created(3)).unwrap();
        wal.rollback().unwrap();
        assert_eq!(wal.appends_since_compact(), 1);

        let next = station_created(2);
        wal.append(&next).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, next]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rewrite_replaces_log_and_keeps_appending() {
        let path = tmp_path("rewrite.wal");
        let _ = fs::remove_file(&path);

        let mut wal = Wal::open(&path).unwrap();
        for seq in 1..=20 {
            wal.append_buffered(&station_created(seq)).unwrap();
        }
        wal.flush_sync().unwrap();
        assert_eq!(wal.appends_since_compact(), 20);
        let before = fs::metadata(&path).unwrap().len();

        let image = vec![station_created(20)];
        wal.rewrite(&image).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(fs::metadata(&path).unwrap().len() < before);

        let next = station_created(21);
        wal.append(&next).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![image[0].clone(), next]);
        let _ = fs::remove_file(&path);
    }
}
