//! AOF (Append Only File) persistence implementation.
//!
//! Every propagated bloom write is logged as a RESP array. A rewrite replaces
//! the log with one `BF.LOAD key <codec bytes>` per live bloom object, so
//! replay never has to repeat individual inserts.
//!
//! # Fsync Policies
//!
//! - **Always**: Fsync after every write (safest, slowest)
//! - **EverySec**: Fsync once per second (good balance)
//! - **No**: Let the OS handle fsyncing (fastest, least safe)

use crate::error::StorageError;
use crate::storage::{Db, ExportedValue};
use bytes::{BufMut, Bytes, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

/// AOF fsync policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AofFsync {
    /// Fsync after every write command
    Always,
    /// Fsync once per second
    #[default]
    EverySec,
    /// Never explicitly fsync (let the OS decide)
    No,
}

impl AofFsync {
    /// Parse from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "always" => Some(Self::Always),
            "everysec" => Some(Self::EverySec),
            "no" => Some(Self::No),
            _ => None,
        }
    }
}

/// AOF writer for appending commands to the AOF file.
#[derive(Debug)]
pub struct AofWriter {
    writer: BufWriter<File>,
    fsync_policy: AofFsync,
    last_fsync: Instant,
    needs_fsync: bool,
    total_bytes: u64,
}

impl AofWriter {
    /// Open (or create) the AOF for appending.
    pub fn new<P: AsRef<Path>>(path: P, fsync_policy: AofFsync) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(StorageError::Io)?;

        Ok(Self {
            writer: BufWriter::with_capacity(64 * 1024, file),
            fsync_policy,
            last_fsync: Instant::now(),
            needs_fsync: false,
            total_bytes: 0,
        })
    }

    /// Append raw RESP bytes.
    pub fn append(&mut self, command: &[u8]) -> Result<(), StorageError> {
        self.writer.write_all(command).map_err(StorageError::Io)?;
        self.total_bytes += command.len() as u64;
        self.needs_fsync = true;

        match self.fsync_policy {
            AofFsync::Always => self.fsync()?,
            AofFsync::EverySec => {
                if self.last_fsync.elapsed() >= Duration::from_secs(1) {
                    self.fsync()?;
                }
            }
            AofFsync::No => self.writer.flush().map_err(StorageError::Io)?,
        }

        Ok(())
    }

    /// Append one command given as its argument vector.
    pub fn append_command(&mut self, command: &[Bytes]) -> Result<(), StorageError> {
        let args: Vec<&[u8]> = command.iter().map(|a| a.as_ref()).collect();
        self.append(&encode_command(&args))
    }

    /// Flush and fsync if anything was written since the last sync.
    pub fn fsync(&mut self) -> Result<(), StorageError> {
        if self.needs_fsync {
            self.writer.flush().map_err(StorageError::Io)?;
            self.writer.get_ref().sync_data().map_err(StorageError::Io)?;
            self.last_fsync = Instant::now();
            self.needs_fsync = false;
        }
        Ok(())
    }

    /// Bytes appended through this writer.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Rewrite the AOF from the current keyspace.
    ///
    /// Writes to a temp file next to `path` and renames it into place, so a
    /// crash mid-rewrite leaves the old log intact. Returns the number of
    /// commands written.
    pub fn rewrite_from_db<P: AsRef<Path>>(path: P, db: &Db) -> Result<usize, StorageError> {
        let path = path.as_ref();
        let temp_path = path.with_extension(format!("aof.temp.{}", std::process::id()));

        let written = match Self::write_aof_to_file(&temp_path, db) {
            Ok(n) => n,
            Err(e) => {
                let _ = std::fs::remove_file(&temp_path);
                return Err(e);
            }
        };

        std::fs::rename(&temp_path, path).map_err(StorageError::Io)?;
        Ok(written)
    }

    fn write_aof_to_file(path: &Path, db: &Db) -> Result<usize, StorageError> {
        let file = File::create(path).map_err(StorageError::Io)?;
        let mut writer = BufWriter::with_capacity(64 * 1024, file);

        let entries = db.export_entries();
        for entry in &entries {
            let command = match &entry.value {
                ExportedValue::String(value) => {
                    encode_command(&[&b"SET"[..], &entry.key[..], &value[..]])
                }
                ExportedValue::Bloom(bytes) => {
                    encode_command(&[&b"BF.LOAD"[..], &entry.key[..], &bytes[..]])
                }
            };
            writer.write_all(&command).map_err(StorageError::Io)?;
        }

        writer.flush().map_err(StorageError::Io)?;
        writer.get_ref().sync_all().map_err(StorageError::Io)?;
        Ok(entries.len())
    }
}

/// Encode an argument vector as a RESP array of bulk strings.
pub fn encode_command(args: &[&[u8]]) -> Bytes {
    let payload: usize = args.iter().map(|a| a.len() + 16).sum();
    let mut buf = BytesMut::with_capacity(payload + 16);
    let mut itoa_buf = itoa::Buffer::new();

    buf.put_u8(b'*');
    buf.put_slice(itoa_buf.format(args.len()).as_bytes());
    buf.put_slice(b"\r\n");
    for arg in args {
        buf.put_u8(b'$');
        buf.put_slice(itoa_buf.format(arg.len()).as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(arg);
        buf.put_slice(b"\r\n");
    }
    buf.freeze()
}

/// AOF file reader for replay.
#[derive(Debug)]
pub struct AofReader {
    data: Vec<u8>,
    pos: usize,
}

impl AofReader {
    /// Read the whole AOF into memory.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let data = std::fs::read(path).map_err(StorageError::Io)?;
        Ok(Self::from_bytes(data))
    }

    /// Reader over an in-memory log.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    /// Read the next command from the AOF.
    pub fn next_command(&mut self) -> Result<Option<Vec<Bytes>>, StorageError> {
        while matches!(self.peek(), Some(b'\r' | b'\n')) {
            self.pos += 1;
        }
        if self.peek().is_none() {
            return Ok(None);
        }

        self.expect(b'*')?;
        let array_len = self.read_length()?;
        let mut args = Vec::with_capacity(array_len.min(1024));

        for _ in 0..array_len {
            self.expect(b'$')?;
            let str_len = self.read_length()?;

            let end = self
                .pos
                .checked_add(str_len)
                .filter(|end| *end <= self.data.len())
                .ok_or_else(|| StorageError::Corrupted("Unexpected end of AOF".to_string()))?;
            args.push(Bytes::copy_from_slice(&self.data[self.pos..end]));
            self.pos = end;
            self.skip_crlf();
        }

        Ok(Some(args))
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn expect(&mut self, marker: u8) -> Result<(), StorageError> {
        match self.peek() {
            Some(b) if b == marker => {
                self.pos += 1;
                Ok(())
            }
            Some(b) => Err(StorageError::Corrupted(format!(
                "Expected '{}', got '{}'",
                marker as char, b as char
            ))),
            None => Err(StorageError::Corrupted("Unexpected end of AOF".to_string())),
        }
    }

    fn read_length(&mut self) -> Result<usize, StorageError> {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b != b'\r') {
            self.pos += 1;
        }

        let s = std::str::from_utf8(&self.data[start..self.pos])
            .map_err(|_| StorageError::Corrupted("Invalid integer in AOF".to_string()))?;
        let n = s
            .parse()
            .map_err(|_| StorageError::Corrupted(format!("Invalid integer: {s}")))?;
        self.skip_crlf();
        Ok(n)
    }

    fn skip_crlf(&mut self) {
        if self.peek() == Some(b'\r') {
            self.pos += 1;
        }
        if self.peek() == Some(b'\n') {
            self.pos += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aof_fsync_from_str() {
        assert_eq!(AofFsync::from_str("always"), Some(AofFsync::Always));
        assert_eq!(AofFsync::from_str("EVERYSEC"), Some(AofFsync::EverySec));
        assert_eq!(AofFsync::from_str("No"), Some(AofFsync::No));
        assert_eq!(AofFsync::from_str("invalid"), None);
    }

    #[test]
    fn test_encode_command() {
        let encoded = encode_command(&[&b"BF.ADD"[..], &b"key"[..], &b"value"[..]]);
        assert_eq!(
            encoded.as_ref(),
            b"*3\r\n$6\r\nBF.ADD\r\n$3\r\nkey\r\n$5\r\nvalue\r\n"
        );
    }

    #[test]
    fn test_reader_handles_binary_arguments() {
        let binary = [0u8, b'\r', b'\n', 0xff];
        let mut log = encode_command(&[&b"BF.LOAD"[..], &b"k"[..], &binary[..]]).to_vec();
        log.extend_from_slice(&encode_command(&[&b"BF.ADD"[..], &b"k"[..], &b"x"[..]]));

        let mut reader = AofReader::from_bytes(log);
        let first = reader.next_command().unwrap().unwrap();
        assert_eq!(first[2].as_ref(), &binary);
        let second = reader.next_command().unwrap().unwrap();
        assert_eq!(second[0].as_ref(), b"BF.ADD");
        assert!(reader.next_command().unwrap().is_none());
    }

    #[test]
    fn test_reader_rejects_truncated_log() {
        let log = encode_command(&[&b"BF.ADD"[..], &b"key"[..], &b"value"[..]]);
        let mut reader = AofReader::from_bytes(log[..log.len() - 4].to_vec());
        assert!(matches!(
            reader.next_command(),
            Err(StorageError::Corrupted(_))
        ));
    }
}
