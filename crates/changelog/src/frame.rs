//! On-disk framing of changelog files.
//!
//! A file is a sequence of self-delimiting records:
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ index: u64                       │
//! │ term: u64                        │
//! │ kind: u8                         │
//! │ payload_len: u32                 │
//! │ payload bytes                    │
//! │ crc32 over all preceding fields  │
//! └──────────────────────────────────┘
//! ```
//!
//! Compressed files hold the same record stream inside concatenated zstd
//! frames; one frame is finished per flush boundary so a crashed writer
//! never leaves a readable prefix in doubt. A torn frame makes the rest of
//! a compressed file unrecoverable, which recovery treats as corruption
//! from that point on.

use crate::entry::{EntryKind, LogEntry};
use bytes::Bytes;
use protocol::wire;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Upper bound on a single record payload; a torn length prefix must not
/// turn into a multi-gigabyte allocation.
const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Fixed overhead of one record on top of its payload.
pub const RECORD_OVERHEAD: u64 = 8 + 8 + 1 + 4 + 4;

/// A changelog file as described by its name:
/// `changelog_<from>_<to>.bin[.zstd]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileDescription {
    pub from: u64,
    pub to: u64,
    pub compressed: bool,
    pub path: PathBuf,
}

impl FileDescription {
    pub fn parse(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let (stem, compressed) = match name.strip_suffix(".zstd") {
            Some(stem) => (stem, true),
            None => (name, false),
        };
        let stem = stem.strip_suffix(".bin")?;
        let rest = stem.strip_prefix("changelog_")?;
        let (from, to) = rest.split_once('_')?;
        let from = from.parse().ok()?;
        let to = to.parse().ok()?;
        if from == 0 || to < from {
            return None;
        }
        Some(Self {
            from,
            to,
            compressed,
            path: path.to_path_buf(),
        })
    }

    pub fn file_name(from: u64, to: u64, compressed: bool) -> String {
        if compressed {
            format!("changelog_{from}_{to}.bin.zstd")
        } else {
            format!("changelog_{from}_{to}.bin")
        }
    }

    pub fn new(dir: &Path, from: u64, to: u64, compressed: bool) -> Self {
        Self {
            from,
            to,
            compressed,
            path: dir.join(Self::file_name(from, to, compressed)),
        }
    }
}

/// Serialized size of a record holding `entry`.
pub fn record_size(entry: &LogEntry) -> u64 {
    RECORD_OVERHEAD + entry.data.len() as u64
}

pub fn write_record<W: Write>(w: &mut W, index: u64, entry: &LogEntry) -> io::Result<()> {
    let mut buf = Vec::with_capacity(record_size(entry) as usize);
    wire::write_u64(&mut buf, index)?;
    wire::write_u64(&mut buf, entry.term)?;
    wire::write_u8(&mut buf, entry.kind as u8)?;
    wire::write_bytes(&mut buf, &entry.data)?;
    let checksum = crc32fast::hash(&buf);
    w.write_all(&buf)?;
    wire::write_u32(w, checksum)
}

/// Reads one record. `Ok(None)` is a clean end of stream (EOF exactly at a
/// record boundary); anything else that cuts a record short is an error.
pub fn read_record<R: Read>(r: &mut R) -> io::Result<Option<(u64, LogEntry)>> {
    let mut first = [0u8; 8];
    if !try_read_exact(r, &mut first)? {
        return Ok(None);
    }

    let mut body = first.to_vec();
    let mut fixed = [0u8; 8 + 1 + 4];
    r.read_exact(&mut fixed)?;
    body.extend_from_slice(&fixed);

    let payload_len = u32::from_le_bytes(fixed[9..13].try_into().unwrap()) as usize;
    if payload_len > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("record payload of {payload_len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; payload_len];
    r.read_exact(&mut payload)?;
    body.extend_from_slice(&payload);

    let stored_checksum = wire::read_u32(r)?;
    if crc32fast::hash(&body) != stored_checksum {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "record checksum mismatch",
        ));
    }

    let index = u64::from_le_bytes(first);
    let term = u64::from_le_bytes(fixed[0..8].try_into().unwrap());
    let kind = EntryKind::from_u8(fixed[8]).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "unknown record kind")
    })?;

    Ok(Some((
        index,
        LogEntry {
            term,
            kind,
            data: Bytes::from(payload),
        },
    )))
}

/// `read_exact` that reports a zero-byte EOF as `Ok(false)` instead of an
/// error, so record boundaries and torn records can be told apart.
fn try_read_exact<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "record cut short",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Outcome of scanning one file front to back.
pub struct FileReadResult {
    pub entries: Vec<(u64, LogEntry)>,
    /// Error that stopped the scan before a clean EOF, if any.
    pub error: Option<io::Error>,
}

/// Reads every intact record of a changelog file. Stops at the first broken
/// record; for a compressed file a torn frame ends the scan the same way.
pub fn read_file(desc: &FileDescription) -> io::Result<FileReadResult> {
    let file = File::open(&desc.path)?;
    if desc.compressed && file.metadata()?.len() == 0 {
        return Ok(FileReadResult {
            entries: Vec::new(),
            error: None,
        });
    }

    let mut reader: Box<dyn Read> = if desc.compressed {
        match zstd::stream::read::Decoder::new(file) {
            Ok(decoder) => Box::new(decoder),
            // A file cut inside its first frame header cannot even open.
            Err(error) => {
                return Ok(FileReadResult {
                    entries: Vec::new(),
                    error: Some(error),
                })
            }
        }
    } else {
        Box::new(BufReader::new(file))
    };

    let mut entries = Vec::new();
    loop {
        match read_record(&mut reader) {
            Ok(Some(record)) => entries.push(record),
            Ok(None) => break,
            Err(error) => {
                return Ok(FileReadResult {
                    entries,
                    error: Some(error),
                })
            }
        }
    }
    Ok(FileReadResult {
        entries,
        error: None,
    })
}

/// Append-capable writer over a changelog file, plain or compressed.
pub enum RecordWriter {
    Plain(BufWriter<File>),
    /// `None` only transiently while a frame is being finished.
    Zstd(Option<zstd::stream::write::Encoder<'static, File>>),
}

impl RecordWriter {
    pub fn open(desc: &FileDescription, truncate: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(truncate)
            .append(!truncate)
            .open(&desc.path)?;
        if desc.compressed {
            let encoder = zstd::stream::write::Encoder::new(file, 0)?;
            Ok(RecordWriter::Zstd(Some(encoder)))
        } else {
            Ok(RecordWriter::Plain(BufWriter::new(file)))
        }
    }

    pub fn write_record(&mut self, index: u64, entry: &LogEntry) -> io::Result<()> {
        match self {
            RecordWriter::Plain(w) => write_record(w, index, entry),
            RecordWriter::Zstd(Some(w)) => write_record(w, index, entry),
            RecordWriter::Zstd(None) => unreachable!("zstd writer mid-finish"),
        }
    }

    /// Makes everything written so far decodable: flushes the plain buffer,
    /// or finishes the current zstd frame and opens the next one.
    pub fn flush_batch(&mut self) -> io::Result<()> {
        match self {
            RecordWriter::Plain(w) => w.flush(),
            RecordWriter::Zstd(encoder) => {
                let file = encoder
                    .take()
                    .expect("zstd writer mid-finish")
                    .finish()?;
                *encoder = Some(zstd::stream::write::Encoder::new(file, 0)?);
                Ok(())
            }
        }
    }

    /// Closes the writer, ending any open zstd frame.
    pub fn finalize(self) -> io::Result<()> {
        match self {
            RecordWriter::Plain(mut w) => w.flush(),
            RecordWriter::Zstd(Some(encoder)) => encoder.finish().map(|_| ()),
            RecordWriter::Zstd(None) => Ok(()),
        }
    }
}

/// Rewrites a file from scratch with the given records. Used by recovery to
/// cut a damaged file back to its intact prefix and by `write_at` to drop a
/// suffix from the file holding the overwritten index.
pub fn rewrite_file<'a>(
    desc: &FileDescription,
    records: impl Iterator<Item = (u64, &'a LogEntry)>,
) -> io::Result<()> {
    let mut writer = RecordWriter::open(desc, true)?;
    for (index, entry) in records {
        writer.write_record(index, entry)?;
    }
    writer.finalize()?;
    File::open(&desc.path)?.sync_data()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn file_name_parse_roundtrip() {
        for compressed in [false, true] {
            let name = FileDescription::file_name(21, 40, compressed);
            let desc = FileDescription::parse(Path::new(&name)).unwrap();
            assert_eq!(desc.from, 21);
            assert_eq!(desc.to, 40);
            assert_eq!(desc.compressed, compressed);
        }
        assert!(FileDescription::parse(Path::new("changelog_5_4.bin")).is_none());
        assert!(FileDescription::parse(Path::new("changelog_0_4.bin")).is_none());
        assert!(FileDescription::parse(Path::new("snapshot_10.bin")).is_none());
        assert!(FileDescription::parse(Path::new("changelog_a_b.bin")).is_none());
    }

    #[test]
    fn record_roundtrip() {
        let entry = LogEntry::new(77, "hello world");
        let mut buf = Vec::new();
        write_record(&mut buf, 3, &entry).unwrap();
        assert_eq!(buf.len() as u64, record_size(&entry));

        let mut r = Cursor::new(buf);
        let (index, read) = read_record(&mut r).unwrap().unwrap();
        assert_eq!(index, 3);
        assert_eq!(read, entry);
        assert!(read_record(&mut r).unwrap().is_none());
    }

    #[test]
    fn torn_record_is_an_error() {
        let entry = LogEntry::new(7, "payload");
        let mut buf = Vec::new();
        write_record(&mut buf, 1, &entry).unwrap();
        buf.truncate(buf.len() - 3);
        let mut r = Cursor::new(buf);
        assert!(read_record(&mut r).is_err());
    }

    #[test]
    fn flipped_bit_fails_checksum() {
        let entry = LogEntry::new(7, "payload");
        let mut buf = Vec::new();
        write_record(&mut buf, 1, &entry).unwrap();
        buf[20] ^= 0x01;
        let mut r = Cursor::new(buf);
        assert!(read_record(&mut r).is_err());
    }
}
