//! VDB snapshot file.
//!
//! A point-in-time image of the keyspace. Bloom objects are stored as their
//! codec bytes; loading validates the checksum first, then decodes every
//! record into a staging list that replaces the keyspace only if all of them
//! pass.
//!
//! # Format Overview
//!
//! ```text
//! +-------+-------------+-----------+----------+---------+-----+--------+
//! | VBLOM | VDB-VERSION | AUX-PAIRS | RESIZEDB | RECORDS | EOF | CRC64  |
//! +-------+-------------+-----------+----------+---------+-----+--------+
//! ```
//!
//! Each record is a type byte, the key and the value as length-prefixed
//! strings.

use super::codec;
use crate::error::StorageError;
use crate::server::metrics::BloomMetrics;
use crate::storage::{Db, DbEntry, ExportedValue};
use crate::types::bloom::SizeLimit;
use crate::types::{Key, ViatorValue};
use bytes::Bytes;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

/// CRC64 polynomial (ECMA-182)
const CRC64_POLY: u64 = 0xC96C5795D7870F42;

/// CRC64 lookup table for fast computation
static CRC64_TABLE: std::sync::LazyLock<[u64; 256]> = std::sync::LazyLock::new(|| {
    let mut table = [0u64; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        let mut crc = i as u64;
        for _ in 0..8 {
            if crc & 1 == 1 {
                crc = (crc >> 1) ^ CRC64_POLY;
            } else {
                crc >>= 1;
            }
        }
        *slot = crc;
    }
    table
});

/// Calculate CRC64 checksum (ECMA-182)
fn crc64_update(crc: u64, data: &[u8]) -> u64 {
    let mut crc = crc;
    for byte in data {
        let idx = ((crc ^ (*byte as u64)) & 0xFF) as usize;
        crc = CRC64_TABLE[idx] ^ (crc >> 8);
    }
    crc
}

/// VDB file magic string
const VDB_MAGIC: &[u8; 5] = b"VBLOM";

/// VDB format version
const VDB_VERSION: u32 = 1;

// VDB opcodes
const VDB_OPCODE_AUX: u8 = 0xFA;
const VDB_OPCODE_RESIZEDB: u8 = 0xFB;
const VDB_OPCODE_EOF: u8 = 0xFF;

// VDB value types
const VDB_TYPE_STRING: u8 = 0;
const VDB_TYPE_BLOOM: u8 = 0x42;

// Length encoding
const VDB_6BITLEN: u8 = 0;
const VDB_14BITLEN: u8 = 1;
const VDB_32BITLEN: u8 = 0x80;
const VDB_64BITLEN: u8 = 0x81;

/// VDB file saver.
pub struct VdbSaver {
    writer: BufWriter<File>,
    crc64: u64,
}

impl VdbSaver {
    /// Create a new VDB saver.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let file = File::create(path).map_err(StorageError::Io)?;
        Ok(Self {
            writer: BufWriter::new(file),
            crc64: 0,
        })
    }

    /// Save the keyspace. Returns the number of records written.
    pub fn save(self, db: &Db) -> Result<usize, StorageError> {
        self.save_entries(&db.export_entries())
    }

    /// Save already-exported entries.
    pub fn save_entries(mut self, entries: &[DbEntry]) -> Result<usize, StorageError> {
        self.write_header()?;

        self.write_aux("viator-bloom-ver", env!("CARGO_PKG_VERSION"))?;
        self.write_aux("ctime", &chrono::Utc::now().timestamp().to_string())?;

        self.write_u8(VDB_OPCODE_RESIZEDB)?;
        self.write_length(entries.len() as u64)?;

        for entry in entries {
            match &entry.value {
                ExportedValue::String(value) => {
                    self.write_u8(VDB_TYPE_STRING)?;
                    self.write_string(&entry.key)?;
                    self.write_string(value)?;
                }
                ExportedValue::Bloom(bytes) => {
                    self.write_u8(VDB_TYPE_BLOOM)?;
                    self.write_string(&entry.key)?;
                    self.write_string(bytes)?;
                }
            }
        }

        self.write_u8(VDB_OPCODE_EOF)?;

        // Checksum is written without updating itself
        let crc = self.crc64;
        self.writer
            .write_all(&crc.to_le_bytes())
            .map_err(StorageError::Io)?;
        self.writer.flush().map_err(StorageError::Io)?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(StorageError::Io)?;

        Ok(entries.len())
    }

    fn write_header(&mut self) -> Result<(), StorageError> {
        self.write_bytes(VDB_MAGIC)?;
        // Version as 4-digit string (e.g., "0001")
        let version_str = format!("{:04}", VDB_VERSION);
        self.write_bytes(version_str.as_bytes())
    }

    fn write_aux(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.write_u8(VDB_OPCODE_AUX)?;
        self.write_string(key.as_bytes())?;
        self.write_string(value.as_bytes())
    }

    fn write_u8(&mut self, byte: u8) -> Result<(), StorageError> {
        self.write_bytes(&[byte])
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        self.crc64 = crc64_update(self.crc64, bytes);
        self.writer.write_all(bytes).map_err(StorageError::Io)
    }

    fn write_length(&mut self, len: u64) -> Result<(), StorageError> {
        if len < 64 {
            self.write_u8((VDB_6BITLEN << 6) | len as u8)
        } else if len < 16384 {
            let high = (VDB_14BITLEN << 6) | ((len >> 8) & 0x3F) as u8;
            let low = (len & 0xFF) as u8;
            self.write_bytes(&[high, low])
        } else if len <= u32::MAX as u64 {
            self.write_u8(VDB_32BITLEN)?;
            self.write_bytes(&(len as u32).to_be_bytes())
        } else {
            self.write_u8(VDB_64BITLEN)?;
            self.write_bytes(&len.to_be_bytes())
        }
    }

    fn write_string(&mut self, s: &[u8]) -> Result<(), StorageError> {
        self.write_length(s.len() as u64)?;
        self.write_bytes(s)
    }
}

/// Auxiliary fields read from a snapshot header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VdbAux {
    /// Writer version
    pub version: Option<String>,
    /// Creation time, seconds since the epoch
    pub ctime: Option<i64>,
}

/// Checksum-verified records of a snapshot, not yet decoded.
#[derive(Debug, Clone, Default)]
pub struct VdbContents {
    /// Header fields
    pub aux: VdbAux,
    /// Records in file order
    pub entries: Vec<DbEntry>,
}

/// VDB file loader.
pub struct VdbLoader {
    reader: BufReader<File>,
    crc64: u64,
}

impl VdbLoader {
    /// Create a new VDB loader.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let file = File::open(path).map_err(StorageError::Io)?;
        Ok(Self {
            reader: BufReader::new(file),
            crc64: 0,
        })
    }

    /// Read every record and verify the trailing checksum.
    pub fn read_contents(mut self) -> Result<VdbContents, StorageError> {
        let mut magic = [0u8; 5];
        self.read_exact(&mut magic)?;
        if &magic != VDB_MAGIC {
            return Err(StorageError::Corrupted(
                "Invalid dump file magic (expected VBLOM)".to_string(),
            ));
        }

        let mut version_str = [0u8; 4];
        self.read_exact(&mut version_str)?;
        let version: u32 = std::str::from_utf8(&version_str)
            .map_err(|_| StorageError::Corrupted("Invalid version string".to_string()))?
            .parse()
            .map_err(|_| StorageError::Corrupted("Invalid version number".to_string()))?;
        if version == 0 || version > VDB_VERSION {
            return Err(StorageError::UnsupportedVersion(version));
        }

        let mut contents = VdbContents::default();
        loop {
            match self.read_u8()? {
                VDB_OPCODE_AUX => {
                    let key = self.read_string()?;
                    let value = self.read_string()?;
                    let value = String::from_utf8_lossy(&value).into_owned();
                    match key.as_slice() {
                        b"viator-bloom-ver" => contents.aux.version = Some(value),
                        b"ctime" => contents.aux.ctime = value.parse().ok(),
                        _ => {}
                    }
                }
                VDB_OPCODE_RESIZEDB => {
                    let size = self.read_length()?;
                    contents.entries.reserve(size.min(1 << 20) as usize);
                }
                VDB_OPCODE_EOF => {
                    let expected = self.crc64;
                    let mut stored = [0u8; 8];
                    self.reader
                        .read_exact(&mut stored)
                        .map_err(StorageError::Io)?;
                    let actual = u64::from_le_bytes(stored);
                    if actual != expected {
                        return Err(StorageError::ChecksumMismatch { expected, actual });
                    }
                    return Ok(contents);
                }
                value_type @ (VDB_TYPE_STRING | VDB_TYPE_BLOOM) => {
                    let key = Bytes::from(self.read_string()?);
                    let raw = Bytes::from(self.read_string()?);
                    let value = if value_type == VDB_TYPE_BLOOM {
                        ExportedValue::Bloom(raw)
                    } else {
                        ExportedValue::String(raw)
                    };
                    contents.entries.push(DbEntry { key, value });
                }
                other => {
                    return Err(StorageError::Corrupted(format!(
                        "Unknown VDB opcode: {other:#04x}"
                    )));
                }
            }
        }
    }

    /// Read, verify and decode the whole snapshot.
    ///
    /// Fails on the first record that does not decode; nothing is returned
    /// for a partially valid file.
    pub fn load(
        self,
        limit: SizeLimit,
        metrics: &Arc<BloomMetrics>,
    ) -> Result<Vec<(Key, ViatorValue)>, StorageError> {
        let contents = self.read_contents()?;
        decode_entries(contents.entries, limit, metrics)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), StorageError> {
        self.reader.read_exact(buf).map_err(StorageError::Io)?;
        self.crc64 = crc64_update(self.crc64, buf);
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, StorageError> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_length(&mut self) -> Result<u64, StorageError> {
        let first = self.read_u8()?;
        match (first & 0xC0) >> 6 {
            VDB_6BITLEN => Ok((first & 0x3F) as u64),
            VDB_14BITLEN => {
                let second = self.read_u8()?;
                Ok((((first & 0x3F) as u64) << 8) | (second as u64))
            }
            _ if first == VDB_32BITLEN => {
                let mut buf = [0u8; 4];
                self.read_exact(&mut buf)?;
                Ok(u32::from_be_bytes(buf) as u64)
            }
            _ if first == VDB_64BITLEN => {
                let mut buf = [0u8; 8];
                self.read_exact(&mut buf)?;
                Ok(u64::from_be_bytes(buf))
            }
            _ => Err(StorageError::Corrupted(format!(
                "Unknown length encoding: {first}"
            ))),
        }
    }

    fn read_string(&mut self) -> Result<Vec<u8>, StorageError> {
        let len = self.read_length()?;
        // Grow with the data actually present rather than the claimed length
        let mut buf = Vec::new();
        (&mut self.reader)
            .take(len)
            .read_to_end(&mut buf)
            .map_err(StorageError::Io)?;
        if (buf.len() as u64) < len {
            return Err(StorageError::Corrupted("Unexpected end of file".to_string()));
        }
        self.crc64 = crc64_update(self.crc64, &buf);
        Ok(buf)
    }
}

/// Decode exported records into keyspace values.
///
/// A record that fails validation is logged with its key and reported as
/// [`StorageError::CorruptPersistedState`].
pub fn decode_entries(
    entries: Vec<DbEntry>,
    limit: SizeLimit,
    metrics: &Arc<BloomMetrics>,
) -> Result<Vec<(Key, ViatorValue)>, StorageError> {
    let mut staged = Vec::with_capacity(entries.len());
    for DbEntry { key, value } in entries {
        let value = match value {
            ExportedValue::String(s) => ViatorValue::String(s),
            ExportedValue::Bloom(bytes) => {
                ViatorValue::Bloom(codec::decode_persisted(&key, &bytes, limit, metrics)?)
            }
        };
        staged.push((key, value));
    }
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::bloom::{BloomObject, BloomOptions, Scaling, SeedChoice};

    const LIMIT: u64 = 1 << 24;

    fn populated_db() -> Db {
        let db = Db::new(Arc::new(BloomMetrics::new()));
        let options = BloomOptions {
            capacity: 100,
            fp_rate: 0.01,
            tightening_ratio: 0.5,
            scaling: Scaling::Expansion(2),
            seed: SeedChoice::Random,
        };
        let limit = SizeLimit::enforced(LIMIT);
        let mut bloom = BloomObject::new(options, None, limit, db.metrics()).unwrap();
        for i in 0..150 {
            bloom.add_item(format!("item:{i}").as_bytes(), limit).unwrap();
        }
        db.set(Key::from("bf"), bloom.into());
        db.set(Key::from("plain"), ViatorValue::string("value"));
        db
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.vdb");
        let db = populated_db();
        let digest = db.with_bloom(b"bf", |b| b.digest()).unwrap();

        assert_eq!(VdbSaver::new(&path).unwrap().save(&db).unwrap(), 2);

        let metrics = Arc::new(BloomMetrics::new());
        let mut loaded = VdbLoader::new(&path)
            .unwrap()
            .load(SizeLimit::enforced(LIMIT), &metrics)
            .unwrap();
        loaded.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].1.as_bloom().map(|b| b.digest()), digest);
        assert!(matches!(&loaded[1].1, ViatorValue::String(s) if s.as_ref() == b"value"));
        assert_eq!(metrics.num_objects(), 1);
    }

    #[test]
    fn test_aux_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.vdb");
        VdbSaver::new(&path).unwrap().save(&populated_db()).unwrap();

        let contents = VdbLoader::new(&path).unwrap().read_contents().unwrap();
        assert_eq!(contents.aux.version.as_deref(), Some(env!("CARGO_PKG_VERSION")));
        assert!(contents.aux.ctime.is_some());
    }

    #[test]
    fn test_checksum_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.vdb");
        VdbSaver::new(&path).unwrap().save(&populated_db()).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        let result = VdbLoader::new(&path).unwrap().read_contents();
        assert!(matches!(result, Err(StorageError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.vdb");
        std::fs::write(&path, b"VIATR0009").unwrap();
        assert!(matches!(
            VdbLoader::new(&path).unwrap().read_contents(),
            Err(StorageError::Corrupted(_))
        ));
    }

    #[test]
    fn test_oversized_object_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.vdb");
        VdbSaver::new(&path).unwrap().save(&populated_db()).unwrap();

        let metrics = Arc::new(BloomMetrics::new());
        let err = VdbLoader::new(&path)
            .unwrap()
            .load(SizeLimit::enforced(1024), &metrics)
            .unwrap_err();
        match err {
            StorageError::CorruptPersistedState { key, reason } => {
                assert_eq!(key, "bf");
                assert!(reason.contains("exceeds allowed memory limit"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(metrics.num_objects(), 0);
    }

    #[test]
    fn test_length_encoding_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("len.vdb");
        let lengths = [0u64, 63, 64, 16383, 16384, 70_000];

        let mut saver = VdbSaver::new(&path).unwrap();
        for len in lengths {
            saver.write_length(len).unwrap();
        }
        saver.writer.flush().unwrap();

        let mut loader = VdbLoader::new(&path).unwrap();
        for len in lengths {
            assert_eq!(loader.read_length().unwrap(), len);
        }
    }
}
