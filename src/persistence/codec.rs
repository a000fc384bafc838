//! Bloom object byte codec.
//!
//! Shared by the snapshot file, AOF rewrite (`BF.LOAD`) and replication.
//!
//! ```text
//! +---------+-----------+---------+------------+------------+-----------+--------------+
//! | VERSION | EXPANSION | FP RATE | TIGHTENING | MAX SCALED | SEED MODE | [DRAWN SEED] |
//! |   u8    |    u32    |   f64   |    f64     |    i64     |    u8     |   32 bytes   |
//! +---------+-----------+---------+------------+------------+-----------+--------------+
//! | UNITS u32 | per unit: m u64 | k u32 | capacity i64 | items i64 |
//! |           |   primary u64 | secondary u64 | byte length u64 | bits   |
//! +-----------+-------------------------------------------------------------------------+
//! ```
//!
//! All integers are little-endian. An expansion of 0 marks a non-scaling
//! object. MAX SCALED is the capacity ceiling fixed when the object was
//! created; it is restored as stored, not recomputed against the loading
//! server's limit. Decoding checks every field and the projected footprint
//! before allocating any bit array.

use crate::error::{BloomError, StorageError};
use crate::server::metrics::BloomMetrics;
use crate::types::bloom::sizing::{MAX_NUM_BITS, words_for_bits};
use crate::types::bloom::{
    BloomObject, FilterUnit, HashKeys, MAX_FILTERS_PER_OBJECT, SEED_LEN, Scaling, SeedStrategy,
    SizeLimit, config_hash,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;

/// Current encoding version.
pub const CODEC_VERSION: u8 = 1;

const SEED_MODE_DETERMINISTIC: u8 = 0;
const SEED_MODE_RANDOM: u8 = 1;

/// Fixed bytes before the first unit, without the drawn seed.
const HEADER_LEN: usize = 1 + 4 + 8 + 8 + 8 + 1 + 4;
/// Fixed bytes of a unit header, without the bits.
const UNIT_HEADER_LEN: usize = 8 + 4 + 8 + 8 + 8 + 8 + 8;

/// Serialize an object.
pub fn encode(object: &BloomObject) -> Bytes {
    let bits_len: usize = object.filters().iter().map(|u| u.words().len() * 8).sum();
    let mut buf = BytesMut::with_capacity(
        HEADER_LEN + SEED_LEN + object.num_filters() * UNIT_HEADER_LEN + bits_len,
    );

    buf.put_u8(CODEC_VERSION);
    buf.put_u32_le(object.scaling().expansion());
    buf.put_f64_le(object.fp_rate());
    buf.put_f64_le(object.tightening_ratio());
    buf.put_i64_le(object.max_scaled_capacity());
    match object.seed().drawn() {
        Some(drawn) => {
            buf.put_u8(SEED_MODE_RANDOM);
            buf.put_slice(drawn);
        }
        None => buf.put_u8(SEED_MODE_DETERMINISTIC),
    }
    buf.put_u32_le(object.num_filters() as u32);

    for unit in object.filters() {
        buf.put_u64_le(unit.num_bits());
        buf.put_u32_le(unit.num_hashes());
        buf.put_i64_le(unit.capacity());
        buf.put_i64_le(unit.num_items());
        let keys = unit.keys();
        buf.put_u64_le(keys.primary);
        buf.put_u64_le(keys.secondary);
        buf.put_u64_le(unit.words().len() as u64 * 8);
        for word in unit.words() {
            buf.put_u64_le(*word);
        }
    }

    buf.freeze()
}

/// Rebuild an object from bytes written by [`encode`].
///
/// When `limit` is enforced, each unit and the running total must fit
/// within it. The returned object is registered with `metrics`.
pub fn decode(
    bytes: &[u8],
    limit: SizeLimit,
    metrics: &Arc<BloomMetrics>,
) -> Result<BloomObject, BloomError> {
    let mut reader = Reader::new(bytes);

    let version = reader.u8()?;
    if version != CODEC_VERSION {
        return Err(BloomError::DecodeUnsupportedVersion);
    }

    let scaling = Scaling::from_expansion(reader.u32()?);
    let fp_rate = reader.f64()?;
    let tightening_ratio = reader.f64()?;
    if !(fp_rate > 0.0 && fp_rate < 1.0) || !(tightening_ratio > 0.0 && tightening_ratio < 1.0) {
        return Err(BloomError::DecodeFailed);
    }
    let stored_max_scaled = reader.i64()?;
    if stored_max_scaled <= 0 {
        return Err(BloomError::DecodeFailed);
    }

    let drawn = match reader.u8()? {
        SEED_MODE_DETERMINISTIC => None,
        SEED_MODE_RANDOM => Some(SeedStrategy::from_drawn(reader.take(SEED_LEN)?)?),
        _ => return Err(BloomError::DecodeFailed),
    };

    let count = reader.u32()? as usize;
    if count == 0 || count > MAX_FILTERS_PER_OBJECT {
        return Err(BloomError::DecodeFailed);
    }
    if !scaling.is_scaling() && count > 1 {
        return Err(BloomError::DecodeFailed);
    }

    let mut memory = BloomObject::base_memory();
    let mut seed: Option<SeedStrategy> = drawn;
    let mut filters = Vec::with_capacity(count.min(64));

    for index in 0..count {
        let num_bits = reader.u64()?;
        let num_hashes = reader.u32()?;
        let capacity = reader.i64()?;
        let num_items = reader.i64()?;
        let keys = HashKeys {
            primary: reader.u64()?,
            secondary: reader.u64()?,
        };
        let byte_len = reader.u64()?;

        if num_bits == 0 || num_bits > MAX_NUM_BITS || num_hashes == 0 {
            return Err(BloomError::DecodeFailed);
        }
        if capacity <= 0 || num_items < 0 || num_items > capacity {
            return Err(BloomError::DecodeFailed);
        }
        let words = words_for_bits(num_bits);
        if byte_len != words * 8 {
            return Err(BloomError::DecodeFailed);
        }

        let unit_memory = FilterUnit::projected_memory(num_bits);
        memory = memory.saturating_add(unit_memory);
        if limit.enforce && (unit_memory > limit.memory_limit || memory > limit.memory_limit) {
            return Err(BloomError::ExceedsMemoryLimit);
        }

        // Deterministic keys depend on the first unit's capacity
        let strategy = seed.get_or_insert_with(|| {
            SeedStrategy::deterministic(config_hash(
                capacity,
                fp_rate,
                tightening_ratio,
                scaling.expansion(),
            ))
        });
        if strategy.unit_keys(index) != keys {
            return Err(BloomError::DecodeFailed);
        }

        let raw = reader.take(byte_len as usize)?;
        let bits: Box<[u64]> = raw
            .chunks_exact(8)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                u64::from_le_bytes(word)
            })
            .collect();

        filters.push(FilterUnit::from_parts(
            bits, num_bits, num_hashes, keys, capacity, num_items,
        ));
    }

    if !reader.is_empty() {
        return Err(BloomError::DecodeFailed);
    }
    let seed = seed.ok_or(BloomError::DecodeFailed)?;

    let total_capacity = filters
        .iter()
        .fold(0i64, |acc, unit| acc.saturating_add(unit.capacity()));
    // Frozen at creation; never below what the chain already holds
    let max_scaled_capacity = stored_max_scaled.max(total_capacity);

    Ok(BloomObject::register(
        filters,
        fp_rate,
        tightening_ratio,
        scaling,
        seed,
        max_scaled_capacity,
        metrics,
    ))
}

/// Decode a bloom object read back from a snapshot or the AOF.
///
/// Any failure means the persisted state cannot be trusted and is logged and
/// reported as [`StorageError::CorruptPersistedState`] for `key`.
pub fn decode_persisted(
    key: &[u8],
    bytes: &[u8],
    limit: SizeLimit,
    metrics: &Arc<BloomMetrics>,
) -> Result<BloomObject, StorageError> {
    decode(bytes, limit, metrics).map_err(|e| {
        let key = String::from_utf8_lossy(key).into_owned();
        let reason = match e {
            BloomError::ExceedsMemoryLimit => "object exceeds allowed memory limit".to_string(),
            other => other.to_string(),
        };
        tracing::error!(key = %key, reason = %reason, "bloom object failed validation");
        StorageError::CorruptPersistedState { key, reason }
    })
}

/// Bounds-checked little-endian reader.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], BloomError> {
        if self.buf.len() < len {
            return Err(BloomError::DecodeFailed);
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], BloomError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, BloomError> {
        Ok(self.array::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32, BloomError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, BloomError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, BloomError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64, BloomError> {
        Ok(f64::from_le_bytes(self.array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::bloom::{BloomOptions, SeedChoice};

    const LIMIT: u64 = 128 * 1024 * 1024;

    fn object(seed: SeedChoice, scaling: Scaling, metrics: &Arc<BloomMetrics>) -> BloomObject {
        let options = BloomOptions {
            capacity: 50,
            fp_rate: 0.01,
            tightening_ratio: 0.5,
            scaling,
            seed,
        };
        let limit = SizeLimit::enforced(LIMIT);
        let mut obj = BloomObject::new(options, None, limit, metrics).unwrap();
        let mut i = 0;
        while obj.num_filters() < 3 && scaling.is_scaling() || i < 40 {
            obj.add_item(format!("item:{i}").as_bytes(), limit).unwrap();
            i += 1;
        }
        obj
    }

    #[test]
    fn test_restores_identical_object() {
        let metrics = Arc::new(BloomMetrics::new());
        for seed in [SeedChoice::Fixed, SeedChoice::Random] {
            let original = object(seed, Scaling::Expansion(2), &metrics);
            let restored =
                decode(&encode(&original), SizeLimit::enforced(LIMIT), &metrics).unwrap();

            assert_eq!(restored.digest(), original.digest());
            assert_eq!(restored.cardinality(), original.cardinality());
            assert_eq!(restored.memory_usage(), original.memory_usage());
            assert_eq!(restored.max_scaled_capacity(), original.max_scaled_capacity());
            assert!(restored.item_exists(b"item:0"));
        }
    }

    #[test]
    fn test_non_scaling_restores() {
        let metrics = Arc::new(BloomMetrics::new());
        let original = object(SeedChoice::Fixed, Scaling::NonScaling, &metrics);
        let restored = decode(&encode(&original), SizeLimit::enforced(LIMIT), &metrics).unwrap();
        assert_eq!(restored.scaling(), Scaling::NonScaling);
        assert_eq!(restored.digest(), original.digest());
    }

    #[test]
    fn test_rejects_truncated_and_trailing() {
        let metrics = Arc::new(BloomMetrics::new());
        let bytes = encode(&object(SeedChoice::Fixed, Scaling::Expansion(2), &metrics));
        let limit = SizeLimit::enforced(LIMIT);

        for cut in [0, 1, HEADER_LEN, bytes.len() - 1] {
            assert_eq!(
                decode(&bytes[..cut], limit, &metrics).unwrap_err(),
                BloomError::DecodeFailed,
                "cut at {cut}"
            );
        }

        let mut extended = bytes.to_vec();
        extended.push(0);
        assert_eq!(
            decode(&extended, limit, &metrics).unwrap_err(),
            BloomError::DecodeFailed
        );
    }

    #[test]
    fn test_rejects_unknown_version() {
        let metrics = Arc::new(BloomMetrics::new());
        let mut bytes = encode(&object(SeedChoice::Fixed, Scaling::Expansion(2), &metrics)).to_vec();
        bytes[0] = 2;
        assert_eq!(
            decode(&bytes, SizeLimit::enforced(LIMIT), &metrics).unwrap_err(),
            BloomError::DecodeUnsupportedVersion
        );
    }

    #[test]
    fn test_rejects_tampered_fields() {
        let metrics = Arc::new(BloomMetrics::new());
        let bytes = encode(&object(SeedChoice::Fixed, Scaling::Expansion(2), &metrics)).to_vec();
        let limit = SizeLimit::enforced(LIMIT);

        // fp rate of 1.0
        let mut bad = bytes.clone();
        bad[5..13].copy_from_slice(&1.0f64.to_le_bytes());
        assert_eq!(decode(&bad, limit, &metrics).unwrap_err(), BloomError::DecodeFailed);

        // negative capacity ceiling
        let mut bad = bytes.clone();
        bad[21..29].copy_from_slice(&(-1i64).to_le_bytes());
        assert_eq!(decode(&bad, limit, &metrics).unwrap_err(), BloomError::DecodeFailed);

        // unknown seed mode
        let mut bad = bytes.clone();
        bad[29] = 7;
        assert_eq!(decode(&bad, limit, &metrics).unwrap_err(), BloomError::DecodeFailed);

        // zero units
        let mut bad = bytes.clone();
        bad[30..34].copy_from_slice(&0u32.to_le_bytes());
        assert_eq!(decode(&bad, limit, &metrics).unwrap_err(), BloomError::DecodeFailed);

        // first unit's k = 0
        let mut bad = bytes.clone();
        bad[42..46].copy_from_slice(&0u32.to_le_bytes());
        assert_eq!(decode(&bad, limit, &metrics).unwrap_err(), BloomError::DecodeFailed);

        // first unit's primary key altered
        let mut bad = bytes;
        bad[62] ^= 0xff;
        assert_eq!(decode(&bad, limit, &metrics).unwrap_err(), BloomError::DecodeFailed);
    }

    #[test]
    fn test_memory_limit_checked_before_allocation() {
        let metrics = Arc::new(BloomMetrics::new());
        let original = object(SeedChoice::Fixed, Scaling::Expansion(2), &metrics);
        let bytes = encode(&original);
        let objects = metrics.num_objects();

        let small = SizeLimit::enforced(original.memory_usage() - 1);
        assert_eq!(
            decode(&bytes, small, &metrics).unwrap_err(),
            BloomError::ExceedsMemoryLimit
        );
        assert_eq!(metrics.num_objects(), objects);

        // Replicated loads skip the check
        assert!(decode(&bytes, SizeLimit::unchecked(1), &metrics).is_ok());
    }

    #[test]
    fn test_capacity_ceiling_survives_smaller_limit() {
        let metrics = Arc::new(BloomMetrics::new());
        let original = object(SeedChoice::Fixed, Scaling::Expansion(2), &metrics);
        let bytes = encode(&original);

        let tight = SizeLimit::enforced(original.memory_usage() + 64);
        let restored = decode(&bytes, tight, &metrics).unwrap();
        assert_eq!(restored.max_scaled_capacity(), original.max_scaled_capacity());

        // A stored ceiling below the chain is raised to the chain's capacity
        let mut low = bytes.to_vec();
        low[21..29].copy_from_slice(&1i64.to_le_bytes());
        let restored = decode(&low, SizeLimit::enforced(LIMIT), &metrics).unwrap();
        assert_eq!(restored.max_scaled_capacity(), original.capacity());
    }

    #[test]
    fn test_persisted_failure_names_key() {
        let metrics = Arc::new(BloomMetrics::new());
        let original = object(SeedChoice::Fixed, Scaling::Expansion(2), &metrics);
        let mut bytes = encode(&original).to_vec();

        let small = SizeLimit::enforced(original.memory_usage() - 1);
        match decode_persisted(b"big", &bytes, small, &metrics) {
            Err(StorageError::CorruptPersistedState { key, reason }) => {
                assert_eq!(key, "big");
                assert_eq!(reason, "object exceeds allowed memory limit");
            }
            other => panic!("unexpected result: {:?}", other.map(|b| b.capacity())),
        }

        bytes[0] = 9;
        assert!(matches!(
            decode_persisted(b"k", &bytes, SizeLimit::enforced(LIMIT), &metrics),
            Err(StorageError::CorruptPersistedState { .. })
        ));
    }
}
