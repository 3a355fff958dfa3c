//! Columnar block encoding.
//!
//! A data file is a fixed binary header followed by the (optionally
//! compressed) column-major payload. Numeric cells are stored as raw f64
//! little-endian bits, so values survive a round trip bit-for-bit.
//!
//! Payload layout:
//!
//! ```text
//! u32 row_count
//! str cohort                      (whole block is one cohort)
//! row_count x str patient_id
//! row_count x i32 visit_date      (julian day)
//! row_count x u64 ingestion_timestamp
//! u32 column_count
//! per column:
//!   str name
//!   u64 cells_len                 (byte length, lets readers skip columns)
//!   row_count x cell              (u8 tag: 0 absent, 1 numeric, 2 categorical)
//! ```

use crate::error::{Error, Result};
use crate::partition::Codec;
use crate::record::{FeatureRecord, FeatureValue};
use std::collections::BTreeSet;
use time::Date;

pub const BLOCK_MAGIC: u32 = 0x4653_4231; // "FSB1"
pub const BLOCK_VERSION: u32 = 1;
pub(crate) const BLOCK_HEADER_LEN: usize = 24;

const CELL_ABSENT: u8 = 0;
const CELL_NUMERIC: u8 = 1;
const CELL_CATEGORICAL: u8 = 2;

/// Encode records (pre-sorted by natural key, all one cohort) into an
/// uncompressed columnar payload. Returns the payload and the column list
/// for the manifest.
pub fn encode_block(records: &[FeatureRecord]) -> (Vec<u8>, Vec<String>) {
    let columns: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.features.keys().map(|k| k.as_str()))
        .collect();
    let cohort = records.first().map(|r| r.cohort.as_str()).unwrap_or("");

    let mut buf = Vec::with_capacity(records.len() * 64);
    put_u32(&mut buf, records.len() as u32);
    put_str(&mut buf, cohort);
    for record in records {
        put_str(&mut buf, &record.patient_id);
    }
    for record in records {
        put_i32(&mut buf, record.visit_date.to_julian_day());
    }
    for record in records {
        put_u64(&mut buf, record.ingestion_timestamp);
    }
    put_u32(&mut buf, columns.len() as u32);
    for column in &columns {
        put_str(&mut buf, column);
        let mut cells = Vec::with_capacity(records.len() * 9);
        for record in records {
            match record.features.get(*column) {
                None => cells.push(CELL_ABSENT),
                Some(FeatureValue::Numeric(v)) => {
                    cells.push(CELL_NUMERIC);
                    cells.extend_from_slice(&v.to_bits().to_le_bytes());
                }
                Some(FeatureValue::Categorical(s)) => {
                    cells.push(CELL_CATEGORICAL);
                    put_str(&mut cells, s);
                }
            }
        }
        put_u64(&mut buf, cells.len() as u64);
        buf.extend_from_slice(&cells);
    }

    (buf, columns.into_iter().map(str::to_string).collect())
}

/// Decode a payload back into records. With `projection = Some(cols)` only
/// the named feature columns are decoded; other columns are skipped without
/// parsing their cells. Key columns always decode.
pub fn decode_block(payload: &[u8], projection: Option<&[String]>) -> Result<Vec<FeatureRecord>> {
    let mut cursor = Cursor::new(payload);
    let row_count = cursor.u32()? as usize;
    let cohort = cursor.str()?;

    let mut records = Vec::with_capacity(row_count);
    for _ in 0..row_count {
        let patient_id = cursor.str()?;
        records.push(FeatureRecord::new(patient_id, Date::MIN, cohort.clone()));
    }
    for record in records.iter_mut() {
        let julian = cursor.i32()?;
        record.visit_date = Date::from_julian_day(julian)
            .map_err(|_| Error::Corrupt("visit date out of range"))?;
    }
    for record in records.iter_mut() {
        record.ingestion_timestamp = cursor.u64()?;
    }

    let column_count = cursor.u32()? as usize;
    for _ in 0..column_count {
        let name = cursor.str()?;
        let cells_len = cursor.u64()? as usize;
        let wanted = projection.map_or(true, |cols| cols.iter().any(|c| *c == name));
        if !wanted {
            cursor.skip(cells_len)?;
            continue;
        }
        let end = cursor.pos + cells_len;
        for record in records.iter_mut() {
            match cursor.u8()? {
                CELL_ABSENT => {}
                CELL_NUMERIC => {
                    let bits = cursor.u64()?;
                    record
                        .features
                        .insert(name.clone(), FeatureValue::Numeric(f64::from_bits(bits)));
                }
                CELL_CATEGORICAL => {
                    let value = cursor.str()?;
                    record
                        .features
                        .insert(name.clone(), FeatureValue::Categorical(value));
                }
                _ => return Err(Error::Corrupt("unknown cell tag")),
            }
        }
        if cursor.pos != end {
            return Err(Error::Corrupt("column cell length mismatch"));
        }
    }

    Ok(records)
}

/// Wrap a payload in the block header, compressing with `codec`.
pub(crate) fn frame_block(payload: &[u8], codec: Codec, level: i32) -> Result<Vec<u8>> {
    let compressed = codec.compress(payload, level)?;
    let mut out = Vec::with_capacity(BLOCK_HEADER_LEN + compressed.len());
    put_u32(&mut out, BLOCK_MAGIC);
    put_u32(&mut out, BLOCK_VERSION);
    put_u32(&mut out, codec.id());
    put_u32(&mut out, crc32fast::hash(payload));
    put_u64(&mut out, payload.len() as u64);
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Validate the header of a framed block and return the verified payload.
pub(crate) fn unframe_block(bytes: &[u8]) -> Result<(Codec, Vec<u8>)> {
    if bytes.len() < BLOCK_HEADER_LEN {
        return Err(Error::Corrupt("data file shorter than block header"));
    }
    let mut cursor = Cursor::new(bytes);
    let magic = cursor.u32()?;
    if magic != BLOCK_MAGIC {
        return Err(Error::Corrupt("block magic mismatch"));
    }
    let version = cursor.u32()?;
    if version != BLOCK_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    let codec = Codec::from_id(cursor.u32()?)?;
    let crc = cursor.u32()?;
    let uncompressed_len = cursor.u64()? as usize;

    let payload = codec.decompress(&bytes[BLOCK_HEADER_LEN..], uncompressed_len)?;
    if crc32fast::hash(&payload) != crc {
        return Err(Error::Corrupt("block checksum mismatch"));
    }
    Ok((codec, payload))
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(Error::Corrupt("truncated block payload"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("slice length")))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().expect("slice length")))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("slice length")))
    }

    fn str(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::Corrupt("invalid utf-8 in block"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn sample_records() -> Vec<FeatureRecord> {
        let mut a = FeatureRecord::new("P001", date!(2024 - 03 - 01), "adni")
            .with_feature("mmse_score", 27.0)
            .with_feature("apoe4", "carrier");
        a.ingestion_timestamp = 10;
        let mut b = FeatureRecord::new("P002", date!(2024 - 03 - 09), "adni")
            .with_feature("mmse_score", 22.5)
            .with_feature("hippocampus_volume", 3.8112);
        b.ingestion_timestamp = 11;
        vec![a, b]
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let records = sample_records();
        let (payload, columns) = encode_block(&records);
        assert_eq!(columns, vec!["apoe4", "hippocampus_volume", "mmse_score"]);

        let decoded = decode_block(&payload, None).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn test_numeric_bits_preserved() {
        let mut record = FeatureRecord::new("P001", date!(2024 - 01 - 01), "adni")
            .with_feature("raw", 0.1 + 0.2)
            .with_feature("tiny", f64::MIN_POSITIVE)
            .with_feature("neg_zero", -0.0);
        record.ingestion_timestamp = 1;
        let (payload, _) = encode_block(std::slice::from_ref(&record));
        let decoded = decode_block(&payload, None).unwrap();
        for name in ["raw", "tiny", "neg_zero"] {
            let before = record.feature(name).unwrap().as_f64().unwrap();
            let after = decoded[0].feature(name).unwrap().as_f64().unwrap();
            assert_eq!(before.to_bits(), after.to_bits(), "column {}", name);
        }
    }

    #[test]
    fn test_projection_skips_columns() {
        let records = sample_records();
        let (payload, _) = encode_block(&records);
        let projection = vec!["mmse_score".to_string()];
        let decoded = decode_block(&payload, Some(&projection)).unwrap();
        assert_eq!(decoded[0].features.len(), 1);
        assert!(decoded[0].feature("mmse_score").is_some());
        assert!(decoded[0].feature("apoe4").is_none());
        // Key columns always present.
        assert_eq!(decoded[1].patient_id, "P002");
        assert_eq!(decoded[1].visit_date, date!(2024 - 03 - 09));
    }

    #[test]
    fn test_empty_projection_decodes_keys_only() {
        let records = sample_records();
        let (payload, _) = encode_block(&records);
        let decoded = decode_block(&payload, Some(&[])).unwrap();
        assert_eq!(decoded.len(), 2);
        assert!(decoded.iter().all(|r| r.features.is_empty()));
    }

    #[test]
    fn test_frame_unframe_round_trip() {
        let records = sample_records();
        let (payload, _) = encode_block(&records);
        for codec in [Codec::None, Codec::Zstd, Codec::Gzip] {
            let framed = frame_block(&payload, codec, 3).unwrap();
            let (read_codec, restored) = unframe_block(&framed).unwrap();
            assert_eq!(read_codec, codec);
            assert_eq!(restored, payload);
        }
    }

    #[test]
    fn test_unframe_rejects_bad_magic() {
        let records = sample_records();
        let (payload, _) = encode_block(&records);
        let mut framed = frame_block(&payload, Codec::Zstd, 3).unwrap();
        framed[0] ^= 0xff;
        assert!(unframe_block(&framed).is_err());
    }

    #[test]
    fn test_unframe_rejects_corrupt_payload() {
        let records = sample_records();
        let (payload, _) = encode_block(&records);
        let mut framed = frame_block(&payload, Codec::None, 0).unwrap();
        let len = framed.len();
        framed[len - 1] ^= 0xff;
        assert!(unframe_block(&framed).is_err());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let records = sample_records();
        let (payload, _) = encode_block(&records);
        assert!(decode_block(&payload[..payload.len() - 3], None).is_err());
    }
}
