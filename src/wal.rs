use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Change;

/// Encode one change as `[u32 len][bincode][u32 crc32]`.
fn encode_change(writer: &mut impl Write, change: &Change) -> io::Result<()> {
    let payload =
        bincode::serialize(change).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "change record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Outcome of reading one frame during replay.
enum Frame {
    Record(Vec<u8>),
    /// Clean end of file.
    End,
    /// Partial or checksum-failing tail left by a crash.
    Torn,
}

fn read_u32(reader: &mut impl Read) -> io::Result<Option<u32>> {
    let mut buf = [0u8; 4];
    match reader.read_exact(&mut buf) {
        Ok(()) => Ok(Some(u32::from_le_bytes(buf))),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut first = [0u8; 1];
    if reader.read(&mut first)? == 0 {
        return Ok(Frame::End);
    }
    let mut rest = [0u8; 3];
    match reader.read_exact(&mut rest) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Frame::Torn),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes([first[0], rest[0], rest[1], rest[2]]) as usize;

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Frame::Torn),
        Err(e) => return Err(e),
    }
    let Some(stored_crc) = read_u32(reader)? else {
        return Ok(Frame::Torn);
    };
    if stored_crc != crc32fast::hash(&payload) {
        return Ok(Frame::Torn);
    }
    Ok(Frame::Record(payload))
}

/// Append-only write-ahead log of ledger changes.
///
/// A torn last entry (crash mid-write) fails its length or CRC check and is
/// dropped on replay together with anything after it.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log at `path` for appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync one change. Tests only; the ledger batches through
    /// `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, change: &Change) -> io::Result<()> {
        self.append_buffered(change)?;
        self.flush_sync()
    }

    /// Buffer one change without syncing.
    pub fn append_buffered(&mut self, change: &Change) -> io::Result<()> {
        encode_change(&mut self.writer, change)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the log with `changes`: write a synced temp file, then rename
    /// it over the live log and reopen.
    pub fn compact(&mut self, changes: &[Change]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for change in changes {
                encode_change(&mut writer, change)?;
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
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every intact change from disk. A missing file replays as empty.
    pub fn replay(path: &Path) -> io::Result<Vec<Change>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut changes = Vec::new();

        loop {
            match read_frame(&mut reader)? {
                Frame::Record(payload) => match bincode::deserialize::<Change>(&payload) {
                    Ok(change) => changes.push(change),
                    Err(e) => {
                        tracing::warn!(
                            "wal {}: undecodable record after {} changes ({e}), stopping replay",
                            path.display(),
                            changes.len()
                        );
                        break;
                    }
                },
                Frame::End => break,
                Frame::Torn => {
                    tracing::warn!(
                        "wal {}: discarding torn tail after {} changes",
                        path.display(),
                        changes.len()
                    );
                    break;
                }
            }
        }

        Ok(changes)
    }
}
