//! Per-entry payload compression
//!
//! Every entry payload is packed on its own. Payloads under `min_size` are
//! stored as they are, and so is anything the codec cannot shrink below
//! `max_ratio` of its original length. The method actually applied is kept
//! on the entry so readers never guess.

use crate::error::{FsError, Result};
use serde::{Deserialize, Serialize};
use std::io;

/// Zstd needs a bound on the unpacked size; entries beyond it are refused
const ZSTD_UNPACK_LIMIT: usize = 256 * 1024 * 1024;

/// How an entry payload is packed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    #[default]
    None,
    Lz4,
    Zstd,
}

impl CompressionMethod {
    fn pack(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionMethod::None => Ok(data.to_vec()),
            CompressionMethod::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            CompressionMethod::Zstd => zstd::bulk::compress(data, 3).map_err(FsError::Io),
        }
    }

    fn unpack(self, payload: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionMethod::None => Ok(payload.to_vec()),
            CompressionMethod::Lz4 => lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| invalid(format!("bad lz4 payload: {}", e))),
            CompressionMethod::Zstd => {
                zstd::bulk::decompress(payload, ZSTD_UNPACK_LIMIT).map_err(FsError::Io)
            }
        }
    }
}

fn invalid(msg: String) -> FsError {
    FsError::Io(io::Error::new(io::ErrorKind::InvalidData, msg))
}

/// Packing policy of one driver
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub method: CompressionMethod,
    /// Smaller payloads are stored as they are
    pub min_size: usize,
    /// Packed length over original length must stay below this
    pub max_ratio: f32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self::lz4()
    }
}

impl CompressionConfig {
    /// Store everything as is
    pub fn none() -> Self {
        CompressionConfig {
            method: CompressionMethod::None,
            min_size: usize::MAX,
            max_ratio: 0.0,
        }
    }

    pub fn lz4() -> Self {
        CompressionConfig {
            method: CompressionMethod::Lz4,
            min_size: 512,
            max_ratio: 0.9,
        }
    }

    /// Zstd costs more per call, so it only pays off on larger entries
    pub fn zstd() -> Self {
        CompressionConfig {
            method: CompressionMethod::Zstd,
            min_size: 1024,
            max_ratio: 0.85,
        }
    }

    /// Pack one payload, returning the bytes to store and the method applied
    pub fn encode(&self, data: &[u8]) -> Result<(Vec<u8>, CompressionMethod)> {
        if self.method == CompressionMethod::None || data.len() < self.min_size {
            return Ok((data.to_vec(), CompressionMethod::None));
        }
        let packed = self.method.pack(data)?;
        if (packed.len() as f32) < data.len() as f32 * self.max_ratio {
            Ok((packed, self.method))
        } else {
            Ok((data.to_vec(), CompressionMethod::None))
        }
    }
}

/// Unpack a payload stored with `method`
pub fn decode(payload: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    method.unpack(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Vec<u8> {
        br#"{"entry":"docs/readme.txt","size":1024}"#.repeat(40)
    }

    #[test]
    fn test_each_method_restores_payload() {
        let data = manifest();
        for method in [CompressionMethod::Lz4, CompressionMethod::Zstd] {
            let config = CompressionConfig {
                method,
                min_size: 0,
                max_ratio: 1.0,
            };
            let (packed, used) = config.encode(&data).unwrap();
            assert_eq!(used, method);
            assert!(packed.len() < data.len());
            assert_eq!(decode(&packed, used).unwrap(), data);
        }
    }

    #[test]
    fn test_small_entries_are_stored() {
        let (stored, used) = CompressionConfig::zstd().encode(b"mimetype").unwrap();
        assert_eq!(used, CompressionMethod::None);
        assert_eq!(stored, b"mimetype");
    }

    #[test]
    fn test_incompressible_entries_are_stored() {
        let mut noise = vec![0u8; 4096];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut noise);
        let (stored, used) = CompressionConfig::lz4().encode(&noise).unwrap();
        assert_eq!(used, CompressionMethod::None);
        assert_eq!(stored, noise);
    }

    #[test]
    fn test_none_policy_never_packs() {
        let data = manifest();
        let (stored, used) = CompressionConfig::none().encode(&data).unwrap();
        assert_eq!(used, CompressionMethod::None);
        assert_eq!(stored.len(), data.len());
    }

    #[test]
    fn test_damaged_lz4_payload_is_an_error() {
        assert!(decode(&[0xff, 0xff, 0xff, 0x7f, 1, 2], CompressionMethod::Lz4).is_err());
    }
}
