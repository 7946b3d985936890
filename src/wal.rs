use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// File header: magic + format version. Written once when the log is created.
const MAGIC: &[u8; 4] = b"RMDW";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: u64 = 5;
/// Anything larger is treated as a corrupt length prefix.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

fn write_header(writer: &mut impl Write) -> io::Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_all(&[FORMAT_VERSION])
}

fn check_header(reader: &mut impl Read) -> io::Result<()> {
    let mut header = [0u8; HEADER_LEN as usize];
    reader.read_exact(&mut header)?;
    if &header[..4] != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "not a roomd log file"));
    }
    if header[4] != FORMAT_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported log format version {}", header[4]),
        ));
    }
    Ok(())
}

/// Frame a single event as `[u32 len][bincode payload][u32 crc32(payload)]`.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Read one frame. `Ok(None)` marks the end of the usable log: clean EOF,
/// a torn trailing write, or a checksum mismatch.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_or_eof(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(Some(payload))
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn open_for_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let fresh = file.metadata()?.len() == 0;
    let mut writer = BufWriter::new(file);
    if fresh {
        write_header(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    Ok(writer)
}

/// Append-only write-ahead log of committed mutations.
///
/// A crash mid-append leaves a torn last frame. `recover` cuts the file back
/// to the last valid frame before the log is reopened for appends.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: open_for_append(path)?,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event. Durable only after the next `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
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

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a snapshot of `events` next to the log. Slow; does not touch the live file.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        write_header(&mut writer)?;
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the live log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        self.writer = open_for_append(&self.path)?;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Read every valid event. A missing or empty file is an empty log;
    /// a file with a foreign header is an error.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::scan(path)?.0)
    }

    /// Replay, then truncate anything after the last valid frame so new
    /// appends are not stranded behind a torn record.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let (events, valid_len) = Self::scan(path)?;
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > valid_len
        {
            tracing::warn!(
                "truncating {} trailing bytes from {}",
                meta.len() - valid_len,
                path.display()
            );
            OpenOptions::new().write(true).open(path)?.set_len(valid_len)?;
        }
        Ok(events)
    }

    fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        if file.metadata()?.len() < HEADER_LEN {
            return Ok((Vec::new(), 0));
        }
        let mut reader = BufReader::new(file);
        check_header(&mut reader)?;

        let mut events = Vec::new();
        let mut valid_len = HEADER_LEN;
        while let Some(payload) = read_frame(&mut reader)? {
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => {
                    valid_len += payload.len() as u64 + 8;
                    events.push(event);
                }
                Err(e) => {
                    tracing::warn!("stopping replay at undecodable record: {e}");
                    break;
                }
            }
        }
        Ok((events, valid_len))
    }
}
