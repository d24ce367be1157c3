//! Streaming single-entry ZIP archives.
//!
//! Dumps are packaged as a ZIP holding one `dump.sql` entry. The writer never
//! seeks: CRC and sizes go into a data descriptor after the entry data, and
//! ZIP64 records are emitted once the sizes outgrow 32 bits, so the archive
//! can be produced straight into a pipe. The reader is the mirror image and
//! extracts one entry from a forward-only stream.

use chrono::{Datelike, Local, NaiveDateTime, Timelike};
use flate2::bufread::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::{Compression, CrcWriter};
use log::{debug, error, info};
use std::io::{self, BufRead, BufWriter, Read, Write};
use tokio_util::io::{StreamReader, SyncIoBridge};

use crate::stream::{self, ByteStream, ChannelWriter, CHUNK_SIZE, DEFAULT_CHANNEL_CAPACITY};
use crate::PostgresError;

/// Name of the archive entry holding the SQL dump.
pub const DUMP_ENTRY: &str = "dump.sql";

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const ZIP64_END_SIG: u32 = 0x0606_4b50;
const ZIP64_LOCATOR_SIG: u32 = 0x0706_4b50;
const END_SIG: u32 = 0x0605_4b50;

const FLAG_ENCRYPTED: u16 = 0x0001;
const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

const VERSION_DEFAULT: u16 = 20;
const VERSION_ZIP64: u16 = 45;
const MADE_BY_UNIX: u16 = 3 << 8;
const ZIP64_EXTRA_ID: u16 = 0x0001;
const UNIX_FILE_MODE: u32 = 0o100644;
const MAX_DESCRIPTOR_LEN: usize = 24;

/// CRC and sizes of an entry written by [`write_single_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySummary {
    pub crc32: u32,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
}

/// Writes a complete archive holding one deflated entry named `name` whose
/// content is everything read from `source`.
pub fn write_single_entry<R: Read, W: Write>(
    name: &str,
    mut source: R,
    sink: W,
) -> io::Result<EntrySummary> {
    let name_len = u16::try_from(name.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "entry name too long"))?;
    let (time, date) = dos_timestamp(Local::now().naive_local());
    let mut out = CountingWriter::new(sink);

    put_u32(&mut out, LOCAL_HEADER_SIG)?;
    put_u16(&mut out, VERSION_DEFAULT)?;
    put_u16(&mut out, FLAG_DATA_DESCRIPTOR)?;
    put_u16(&mut out, METHOD_DEFLATE)?;
    put_u16(&mut out, time)?;
    put_u16(&mut out, date)?;
    put_u32(&mut out, 0)?;
    put_u32(&mut out, 0)?;
    put_u32(&mut out, 0)?;
    put_u16(&mut out, name_len)?;
    put_u16(&mut out, 0)?;
    out.write_all(name.as_bytes())?;

    let data_start = out.written;
    let mut encoder = CrcWriter::new(DeflateEncoder::new(&mut out, Compression::default()));
    let uncompressed_size = io::copy(&mut source, &mut encoder)?;
    let crc32 = encoder.crc().sum();
    encoder.into_inner().finish()?;
    let compressed_size = out.written - data_start;

    let zip64 = uncompressed_size > u64::from(u32::MAX) || compressed_size > u64::from(u32::MAX);

    put_u32(&mut out, DATA_DESCRIPTOR_SIG)?;
    put_u32(&mut out, crc32)?;
    if zip64 {
        put_u64(&mut out, compressed_size)?;
        put_u64(&mut out, uncompressed_size)?;
    } else {
        put_u32(&mut out, compressed_size as u32)?;
        put_u32(&mut out, uncompressed_size as u32)?;
    }

    let version = if zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT };
    let central_start = out.written;
    put_u32(&mut out, CENTRAL_HEADER_SIG)?;
    put_u16(&mut out, MADE_BY_UNIX | version)?;
    put_u16(&mut out, version)?;
    put_u16(&mut out, FLAG_DATA_DESCRIPTOR)?;
    put_u16(&mut out, METHOD_DEFLATE)?;
    put_u16(&mut out, time)?;
    put_u16(&mut out, date)?;
    put_u32(&mut out, crc32)?;
    if zip64 {
        put_u32(&mut out, u32::MAX)?;
        put_u32(&mut out, u32::MAX)?;
    } else {
        put_u32(&mut out, compressed_size as u32)?;
        put_u32(&mut out, uncompressed_size as u32)?;
    }
    put_u16(&mut out, name_len)?;
    put_u16(&mut out, if zip64 { 20 } else { 0 })?;
    put_u16(&mut out, 0)?; // comment
    put_u16(&mut out, 0)?; // disk
    put_u16(&mut out, 0)?; // internal attributes
    put_u32(&mut out, UNIX_FILE_MODE << 16)?;
    put_u32(&mut out, 0)?; // local header offset
    out.write_all(name.as_bytes())?;
    if zip64 {
        put_u16(&mut out, ZIP64_EXTRA_ID)?;
        put_u16(&mut out, 16)?;
        put_u64(&mut out, uncompressed_size)?;
        put_u64(&mut out, compressed_size)?;
    }
    let central_size = out.written - central_start;

    if zip64 {
        let zip64_end = out.written;
        put_u32(&mut out, ZIP64_END_SIG)?;
        put_u64(&mut out, 44)?;
        put_u16(&mut out, MADE_BY_UNIX | VERSION_ZIP64)?;
        put_u16(&mut out, VERSION_ZIP64)?;
        put_u32(&mut out, 0)?;
        put_u32(&mut out, 0)?;
        put_u64(&mut out, 1)?;
        put_u64(&mut out, 1)?;
        put_u64(&mut out, central_size)?;
        put_u64(&mut out, central_start)?;

        put_u32(&mut out, ZIP64_LOCATOR_SIG)?;
        put_u32(&mut out, 0)?;
        put_u64(&mut out, zip64_end)?;
        put_u32(&mut out, 1)?;
    }

    put_u32(&mut out, END_SIG)?;
    put_u16(&mut out, 0)?;
    put_u16(&mut out, 0)?;
    put_u16(&mut out, 1)?;
    put_u16(&mut out, 1)?;
    put_u32(&mut out, central_size as u32)?;
    put_u32(&mut out, u32::try_from(central_start).unwrap_or(u32::MAX))?;
    put_u16(&mut out, 0)?;
    out.flush()?;

    Ok(EntrySummary {
        crc32,
        uncompressed_size,
        compressed_size,
    })
}

/// Streams the content of the first entry called `name` into `sink`, skipping
/// every other entry. The rest of the archive is drained so the producer
/// always runs to completion. Returns the number of bytes extracted.
pub fn extract_entry<R: BufRead, W: Write>(
    name: &str,
    mut source: R,
    mut sink: W,
) -> Result<u64, PostgresError> {
    let mut extracted = None;

    loop {
        match read_u32(&mut source)? {
            LOCAL_HEADER_SIG => {
                let header = LocalHeader::read(&mut source)?;
                if extracted.is_none() && header.name == name {
                    extracted = Some(header.copy_data(&mut source, &mut sink)?);
                } else {
                    debug!("Skipping archive entry {}", header.name);
                    header.copy_data(&mut source, io::sink())?;
                }
            }
            CENTRAL_HEADER_SIG | ZIP64_END_SIG | END_SIG => break,
            other => {
                return Err(PostgresError::ExtractionError(format!(
                    "unexpected record signature {other:#010x}"
                )))
            }
        }
    }

    io::copy(&mut source, &mut io::sink()).map_err(classify)?;
    sink.flush().map_err(classify)?;

    extracted.ok_or_else(|| {
        PostgresError::ExtractionError(format!("archive does not contain a {name} entry"))
    })
}

/// Wraps `source` in a ZIP archive with a single `dump.sql` entry. The archive
/// is produced on the blocking pool while the caller consumes it; a failure
/// anywhere ends the returned stream with a `PackagingError`.
///
/// Must be called from within a Tokio runtime.
pub fn package_as_archive(source: ByteStream) -> ByteStream {
    package_with_capacity(source, DEFAULT_CHANNEL_CAPACITY)
}

pub(crate) fn package_with_capacity(source: ByteStream, capacity: usize) -> ByteStream {
    let (tx, output) = stream::channel(capacity);
    let reader = SyncIoBridge::new(StreamReader::new(source));

    tokio::task::spawn_blocking(move || {
        let mut writer = ChannelWriter::new(tx);
        let result = write_single_entry(
            DUMP_ENTRY,
            reader,
            BufWriter::with_capacity(CHUNK_SIZE, &mut writer),
        );

        match result {
            Ok(summary) => info!(
                "Packaged {} bytes of SQL into a {} byte entry",
                summary.uncompressed_size, summary.compressed_size
            ),
            Err(err) if stream::is_downstream_closed(&err) => {
                debug!("Archive consumer went away before the end of the dump")
            }
            Err(err) => {
                let err = match PostgresError::from(err) {
                    PostgresError::Cancelled => PostgresError::Cancelled,
                    cause => PostgresError::PackagingError(Box::new(cause)),
                };
                error!("{err}");
                writer.fail(err.into_io());
            }
        }
    });

    output
}

struct LocalHeader {
    flags: u16,
    method: u16,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    zip64: bool,
    name: String,
}

impl LocalHeader {
    fn read<R: Read>(source: &mut R) -> Result<Self, PostgresError> {
        let _version = read_u16(source)?;
        let flags = read_u16(source)?;
        let method = read_u16(source)?;
        let _time = read_u16(source)?;
        let _date = read_u16(source)?;
        let crc32 = read_u32(source)?;
        let compressed = read_u32(source)?;
        let uncompressed = read_u32(source)?;
        let name_len = read_u16(source)?;
        let extra_len = read_u16(source)?;
        let name = String::from_utf8_lossy(&read_vec(source, name_len.into())?).into_owned();
        let extra = read_vec(source, extra_len.into())?;

        if flags & FLAG_ENCRYPTED != 0 {
            return Err(PostgresError::ExtractionError(format!(
                "entry {name} is encrypted"
            )));
        }

        let mut header = LocalHeader {
            flags,
            method,
            crc32,
            compressed_size: compressed.into(),
            uncompressed_size: uncompressed.into(),
            zip64: false,
            name,
        };
        if compressed == u32::MAX || uncompressed == u32::MAX {
            header.apply_zip64_extra(&extra, uncompressed == u32::MAX, compressed == u32::MAX)?;
        }
        Ok(header)
    }

    fn apply_zip64_extra(
        &mut self,
        mut extra: &[u8],
        has_uncompressed: bool,
        has_compressed: bool,
    ) -> Result<(), PostgresError> {
        while extra.len() >= 4 {
            let id = u16::from_le_bytes([extra[0], extra[1]]);
            let size = usize::from(u16::from_le_bytes([extra[2], extra[3]]));
            let body = extra.get(4..4 + size).ok_or_else(|| {
                PostgresError::ExtractionError(format!("malformed extra field in {}", self.name))
            })?;
            if id == ZIP64_EXTRA_ID {
                let mut fields = body;
                if has_uncompressed {
                    self.uncompressed_size = read_u64(&mut fields)?;
                }
                if has_compressed {
                    self.compressed_size = read_u64(&mut fields)?;
                }
                self.zip64 = true;
                return Ok(());
            }
            extra = &extra[4 + size..];
        }
        Err(PostgresError::ExtractionError(format!(
            "entry {} is missing its ZIP64 sizes",
            self.name
        )))
    }

    fn uses_data_descriptor(&self) -> bool {
        self.flags & FLAG_DATA_DESCRIPTOR != 0
    }

    fn copy_data<R: BufRead, W: Write>(&self, source: &mut R, sink: W) -> Result<u64, PostgresError> {
        let mut out = CrcWriter::new(sink);
        let (copied, descriptor) = match (self.method, self.uses_data_descriptor()) {
            (METHOD_STORED, false) => (
                io::copy(&mut (&mut *source).take(self.compressed_size), &mut out)
                    .map_err(classify)?,
                None,
            ),
            (METHOD_DEFLATE, false) => (
                io::copy(
                    &mut DeflateDecoder::new((&mut *source).take(self.compressed_size)),
                    &mut out,
                )
                .map_err(classify)?,
                None,
            ),
            (METHOD_DEFLATE, true) => (
                io::copy(&mut DeflateDecoder::new(&mut *source), &mut out).map_err(classify)?,
                None,
            ),
            (METHOD_STORED, true) => {
                let (copied, crc) = copy_stored_until_descriptor(source, &mut out, self.zip64)?;
                (copied, Some((crc, copied)))
            }
            (method, _) => {
                return Err(PostgresError::ExtractionError(format!(
                    "entry {} uses unsupported compression method {method}",
                    self.name
                )))
            }
        };

        let (expected_crc, expected_size) = match descriptor {
            Some(found) => found,
            None if self.uses_data_descriptor() => {
                let first = read_u32(source)?;
                let crc = if first == DATA_DESCRIPTOR_SIG {
                    read_u32(source)?
                } else {
                    first
                };
                let size = if self.zip64 || copied > u64::from(u32::MAX) {
                    let _compressed = read_u64(source)?;
                    read_u64(source)?
                } else {
                    let _compressed = read_u32(source)?;
                    u64::from(read_u32(source)?)
                };
                (crc, size)
            }
            None => (self.crc32, self.uncompressed_size),
        };

        if copied != expected_size {
            return Err(PostgresError::ExtractionError(format!(
                "entry {} is {copied} bytes, expected {expected_size}",
                self.name
            )));
        }
        if out.crc().sum() != expected_crc {
            return Err(PostgresError::ExtractionError(format!(
                "CRC mismatch in entry {}",
                self.name
            )));
        }
        Ok(copied)
    }
}

/// Copies a stored entry whose sizes only follow the data. Nothing marks the
/// end of such an entry except its data descriptor, so the entry ends at the
/// first descriptor signature whose sizes match the number of bytes before it.
/// Returns the entry size and the CRC recorded in the descriptor.
fn copy_stored_until_descriptor<R: BufRead, W: Write>(
    source: &mut R,
    out: &mut W,
    zip64: bool,
) -> Result<(u64, u32), PostgresError> {
    let signature = DATA_DESCRIPTOR_SIG.to_le_bytes();
    let mut held: Vec<u8> = Vec::new();
    let mut copied = 0u64;

    loop {
        let buf = source.fill_buf().map_err(classify)?;
        if buf.is_empty() {
            return Err(PostgresError::ExtractionError(
                "archive is truncated".to_string(),
            ));
        }
        let fresh = buf.len();
        let mut window = std::mem::take(&mut held);
        let held_len = window.len();
        window.extend_from_slice(buf);

        let mut from = 0;
        while let Some(offset) = window[from..].windows(4).position(|w| w == signature) {
            let at = from + offset;
            let size = copied + at as u64;
            let wide = zip64 || size > u64::from(u32::MAX);
            let len = if wide { 24 } else { 16 };
            let Some(descriptor) = window.get(at..at + len) else {
                break;
            };
            let (compressed, uncompressed) = if wide {
                (le_u64(&descriptor[8..16]), le_u64(&descriptor[16..24]))
            } else {
                (
                    u64::from(le_u32(&descriptor[8..12])),
                    u64::from(le_u32(&descriptor[12..16])),
                )
            };

            if compressed == size && uncompressed == size {
                let crc = le_u32(&descriptor[4..8]);
                out.write_all(&window[..at]).map_err(classify)?;
                source.consume((at + len).saturating_sub(held_len));
                return Ok((size, crc));
            }
            from = at + 1;
        }

        // The tail may hold the start of a descriptor still being received.
        let keep = window.len().min(MAX_DESCRIPTOR_LEN - 1);
        let ready = window.len() - keep;
        out.write_all(&window[..ready]).map_err(classify)?;
        copied += ready as u64;
        held = window.split_off(ready);
        source.consume(fresh);
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn le_u64(bytes: &[u8]) -> u64 {
    u64::from(le_u32(&bytes[..4])) | (u64::from(le_u32(&bytes[4..8])) << 32)
}

/// Keeps upstream stream errors and downstream hang-ups intact; everything
/// else is a problem with the archive itself.
fn classify(err: io::Error) -> PostgresError {
    if stream::is_downstream_closed(&err) {
        return PostgresError::Io(err);
    }
    match PostgresError::from(err) {
        PostgresError::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            PostgresError::ExtractionError("archive is truncated".to_string())
        }
        PostgresError::Io(err) => PostgresError::ExtractionError(err.to_string()),
        upstream => upstream,
    }
}

fn read_vec<R: Read>(source: &mut R, len: usize) -> Result<Vec<u8>, PostgresError> {
    let mut buf = vec![0u8; len];
    source.read_exact(&mut buf).map_err(classify)?;
    Ok(buf)
}

fn read_u16<R: Read>(source: &mut R) -> Result<u16, PostgresError> {
    let mut buf = [0u8; 2];
    source.read_exact(&mut buf).map_err(classify)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(source: &mut R) -> Result<u32, PostgresError> {
    let mut buf = [0u8; 4];
    source.read_exact(&mut buf).map_err(classify)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(source: &mut R) -> Result<u64, PostgresError> {
    let mut buf = [0u8; 8];
    source.read_exact(&mut buf).map_err(classify)?;
    Ok(u64::from_le_bytes(buf))
}

fn put_u16<W: Write>(out: &mut W, value: u16) -> io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

fn put_u32<W: Write>(out: &mut W, value: u32) -> io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

fn put_u64<W: Write>(out: &mut W, value: u64) -> io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

/// MS-DOS time and date fields as stored in ZIP headers.
fn dos_timestamp(now: NaiveDateTime) -> (u16, u16) {
    let year = now.year().clamp(1980, 2107) as u16;
    let date = ((year - 1980) << 9) | ((now.month() as u16) << 5) | now.day() as u16;
    let time =
        ((now.hour() as u16) << 11) | ((now.minute() as u16) << 5) | (now.second() as u16 / 2);
    (time, date)
}

struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
