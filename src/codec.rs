//! Block payload codecs keyed by compression name

use crate::error::{IdxError, Result};
use crate::types::DType;
use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression as FlateCompression;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

/// Compression level (0-9, where 0 is no compression and 9 is maximum)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    pub fn new(level: u8) -> Self {
        Self(level.min(9))
    }

    pub fn fast() -> Self {
        Self(1)
    }

    pub fn best() -> Self {
        Self(9)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(6)
    }
}

/// Encode/decode service for one compression name
pub trait Codec: Send + Sync {
    /// Encode `nsamples` samples of `dtype`
    fn encode(&self, data: &[u8], dtype: DType, nsamples: u64) -> Result<Vec<u8>>;

    /// Decode into exactly `nsamples` samples of `dtype`
    fn decode(&self, data: &[u8], dtype: DType, nsamples: u64) -> Result<Vec<u8>>;

    fn name(&self) -> &str;
}

fn check_decoded_len(codec: &str, decoded: &[u8], dtype: DType, nsamples: u64) -> Result<()> {
    let expected = dtype.byte_size(nsamples);
    if decoded.len() != expected {
        return Err(IdxError::Decode(format!(
            "{} payload decoded to {} bytes, expected {} ({} samples of {})",
            if codec.is_empty() { "raw" } else { codec },
            decoded.len(),
            expected,
            nsamples,
            dtype
        )));
    }
    Ok(())
}

/// Identity codec, name `""` or `raw`
#[derive(Debug, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    fn encode(&self, data: &[u8], _dtype: DType, _nsamples: u64) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decode(&self, data: &[u8], dtype: DType, nsamples: u64) -> Result<Vec<u8>> {
        check_decoded_len("", data, dtype, nsamples)?;
        Ok(data.to_vec())
    }

    fn name(&self) -> &str {
        ""
    }
}

/// zlib stream, name `zip`
#[derive(Debug, Default)]
pub struct ZipCodec {
    level: CompressionLevel,
}

impl ZipCodec {
    pub fn new(level: CompressionLevel) -> Self {
        Self { level }
    }
}

impl Codec for ZipCodec {
    fn encode(&self, data: &[u8], _dtype: DType, _nsamples: u64) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(data, FlateCompression::new(self.level.value() as u32));
        let mut compressed = Vec::new();
        encoder
            .read_to_end(&mut compressed)
            .map_err(|e| IdxError::Encode(e.to_string()))?;
        Ok(compressed)
    }

    fn decode(&self, data: &[u8], dtype: DType, nsamples: u64) -> Result<Vec<u8>> {
        let mut decoder = ZlibDecoder::new(data);
        let mut decompressed = Vec::with_capacity(dtype.byte_size(nsamples));
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| IdxError::Decode(e.to_string()))?;
        check_decoded_len("zip", &decompressed, dtype, nsamples)?;
        Ok(decompressed)
    }

    fn name(&self) -> &str {
        "zip"
    }
}

/// Explicit codec registry handed to the storage layer
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn Codec>>,
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.codecs.keys().collect();
        names.sort();
        f.debug_struct("CodecRegistry").field("codecs", &names).finish()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("", Arc::new(RawCodec));
        registry.register("raw", Arc::new(RawCodec));
        registry.register("zip", Arc::new(ZipCodec::default()));
        registry
    }
}

impl CodecRegistry {
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, codec: Arc<dyn Codec>) {
        self.codecs.insert(name.into(), codec);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_ok()
    }

    /// Exact name first, then the part before the first `-` (`zfp-precision=32` -> `zfp`)
    pub fn get(&self, name: &str) -> Result<Arc<dyn Codec>> {
        if let Some(codec) = self.codecs.get(name) {
            return Ok(codec.clone());
        }
        let base = name.split('-').next().unwrap_or(name);
        self.codecs.get(base).cloned().ok_or_else(|| {
            IdxError::Unsupported(format!("no codec registered for compression '{}'", name))
        })
    }

    pub fn encode(&self, name: &str, data: &[u8], dtype: DType, nsamples: u64) -> Result<Vec<u8>> {
        self.get(name)?.encode(data, dtype, nsamples)
    }

    pub fn decode(&self, name: &str, data: &[u8], dtype: DType, nsamples: u64) -> Result<Vec<u8>> {
        self.get(name)?.decode(data, dtype, nsamples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    #[test]
    fn test_raw() {
        let registry = CodecRegistry::default();
        let dtype = DType::scalar(DataType::U8);
        let data = b"Hello, world!";
        let encoded = registry.encode("", data, dtype, data.len() as u64).unwrap();
        assert_eq!(encoded, data);
        let decoded = registry.decode("raw", &encoded, dtype, data.len() as u64).unwrap();
        assert_eq!(decoded, data);
        assert!(registry.decode("", data, dtype, 3).is_err());
    }

    #[test]
    fn test_zip() {
        let registry = CodecRegistry::default();
        let dtype = DType::scalar(DataType::U16);
        let data = b"Hello, world! ".repeat(100);
        let nsamples = (data.len() / 2) as u64;
        let compressed = registry.encode("zip", &data, dtype, nsamples).unwrap();
        assert!(compressed.len() < data.len());
        let decompressed = registry.decode("zip", &compressed, dtype, nsamples).unwrap();
        assert_eq!(decompressed, data);
        assert!(registry.decode("zip", b"garbage", dtype, nsamples).is_err());
    }

    #[test]
    fn test_unregistered_names() {
        let registry = CodecRegistry::default();
        let dtype = DType::scalar(DataType::F32);
        let err = registry.decode("lz4", &[0u8; 8], dtype, 2).unwrap_err();
        assert!(matches!(err, IdxError::Unsupported(_)));
        assert!(err.to_string().contains("lz4"));
        assert!(!registry.contains("zfp-precision=32"));

        let mut registry = registry;
        registry.register("zfp", Arc::new(RawCodec));
        assert!(registry.contains("zfp-precision=32"));
    }
}
