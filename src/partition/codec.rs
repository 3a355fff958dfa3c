//! Compression codecs for partition data files.

use crate::error::{Error, Result};
use std::io::{Read, Write};

/// Codec applied to the columnar payload of a data file.
///
/// The default is zstd at a low level: decode speed matters more than the
/// last few percent of ratio on the query path.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    None,
    Zstd,
    Gzip,
}

impl Codec {
    /// Numeric id stored in the data-file header.
    pub fn id(self) -> u32 {
        match self {
            Codec::None => 0,
            Codec::Zstd => 1,
            Codec::Gzip => 2,
        }
    }

    pub fn from_id(id: u32) -> Result<Self> {
        match id {
            0 => Ok(Codec::None),
            1 => Ok(Codec::Zstd),
            2 => Ok(Codec::Gzip),
            _ => Err(Error::Corrupt("unknown codec id in block header")),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::None => "none",
            Codec::Zstd => "zstd",
            Codec::Gzip => "gzip",
        }
    }

    /// Compress `payload`. `level` is interpreted per codec; zstd accepts
    /// 1-22, gzip 0-9 (clamped).
    pub fn compress(self, payload: &[u8], level: i32) -> Result<Vec<u8>> {
        match self {
            Codec::None => Ok(payload.to_vec()),
            Codec::Zstd => zstd::bulk::compress(payload, level)
                .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e))),
            Codec::Gzip => {
                let level = level.clamp(0, 9) as u32;
                let mut encoder = flate2::write::GzEncoder::new(
                    Vec::new(),
                    flate2::Compression::new(level),
                );
                encoder.write_all(payload)?;
                encoder.finish().map_err(Error::Io)
            }
        }
    }

    /// Decompress into exactly `uncompressed_len` bytes.
    pub fn decompress(self, compressed: &[u8], uncompressed_len: usize) -> Result<Vec<u8>> {
        let out = match self {
            Codec::None => compressed.to_vec(),
            Codec::Zstd => zstd::bulk::decompress(compressed, uncompressed_len)
                .map_err(|_| Error::Corrupt("zstd decompression failed"))?,
            Codec::Gzip => {
                let mut decoder = flate2::read::GzDecoder::new(compressed);
                let mut out = Vec::with_capacity(uncompressed_len);
                decoder
                    .read_to_end(&mut out)
                    .map_err(|_| Error::Corrupt("gzip decompression failed"))?;
                out
            }
        };
        if out.len() != uncompressed_len {
            return Err(Error::Corrupt("decompressed length mismatch"));
        }
        Ok(out)
    }
}

impl Default for Codec {
    fn default() -> Self {
        Codec::Zstd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        b"longitudinal feature data ".repeat(64)
    }

    #[test]
    fn test_zstd_round_trip() {
        let payload = sample();
        let compressed = Codec::Zstd.compress(&payload, 3).unwrap();
        assert!(compressed.len() < payload.len());
        let restored = Codec::Zstd.decompress(&compressed, payload.len()).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn test_gzip_round_trip() {
        let payload = sample();
        let compressed = Codec::Gzip.compress(&payload, 6).unwrap();
        assert!(compressed.len() < payload.len());
        let restored = Codec::Gzip.decompress(&compressed, payload.len()).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn test_none_is_identity() {
        let payload = sample();
        let compressed = Codec::None.compress(&payload, 0).unwrap();
        assert_eq!(compressed, payload);
    }

    #[test]
    fn test_codec_id_round_trip() {
        for codec in [Codec::None, Codec::Zstd, Codec::Gzip] {
            assert_eq!(Codec::from_id(codec.id()).unwrap(), codec);
        }
        assert!(Codec::from_id(9).is_err());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let payload = sample();
        let compressed = Codec::Zstd.compress(&payload, 3).unwrap();
        assert!(Codec::Zstd.decompress(&compressed, payload.len() + 1).is_err());
    }
}
