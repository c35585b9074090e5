use crate::core::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::debug;

/// Compression algorithm selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Stored as-is
    None,
    /// LZ4 - Fast compression/decompression (default)
    #[default]
    Lz4,
    /// Zstandard - Better compression ratio
    Zstd,
}

impl CompressionAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }
}

/// Compression configuration, applied to policies with `compression_enabled`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Algorithm used for new writes
    pub algorithm: CompressionAlgorithm,
    /// Zstd compression level (1-22)
    pub zstd_level: i32,
    /// Payloads smaller than this are stored uncompressed (bytes)
    pub min_payload_size: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Lz4,
            zstd_level: 3, // Balanced compression
            min_payload_size: 0,
        }
    }
}

/// Payload compressor
#[derive(Debug, Clone)]
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    /// Create new compressor with configuration
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Compress with the configured algorithm.
    ///
    /// Returns the output together with the algorithm actually applied, which is
    /// `None` for payloads under `min_payload_size`.
    pub fn compress(&self, data: &[u8]) -> Result<(Vec<u8>, CompressionAlgorithm)> {
        if data.len() < self.config.min_payload_size {
            debug!("Skipping compression: size={} bytes", data.len());
            return Ok((data.to_vec(), CompressionAlgorithm::None));
        }

        let algo = self.config.algorithm;
        let compressed = match algo {
            CompressionAlgorithm::None => data.to_vec(),
            CompressionAlgorithm::Lz4 => self.compress_lz4(data)?,
            CompressionAlgorithm::Zstd => self.compress_zstd(data)?,
        };

        Ok((compressed, algo))
    }

    /// Decompress data produced with `algorithm`
    pub fn decompress(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
        match algorithm {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::Lz4 => self.decompress_lz4(data),
            CompressionAlgorithm::Zstd => self.decompress_zstd(data),
        }
    }

    /// Compress using LZ4
    fn compress_lz4(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = lz4::EncoderBuilder::new()
            .level(4) // Fast compression
            .build(Vec::new())
            .map_err(transform_err)?;

        encoder.write_all(data).map_err(transform_err)?;
        let (compressed, result) = encoder.finish();
        result.map_err(transform_err)?;

        debug!(
            "LZ4 compressed: {} → {} bytes (ratio: {:.2}x)",
            data.len(),
            compressed.len(),
            compression_ratio(data.len(), compressed.len())
        );

        Ok(compressed)
    }

    /// Decompress using LZ4
    fn decompress_lz4(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = lz4::Decoder::new(data).map_err(transform_err)?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(transform_err)?;

        Ok(decompressed)
    }

    /// Compress using Zstd
    fn compress_zstd(&self, data: &[u8]) -> Result<Vec<u8>> {
        let compressed = zstd::encode_all(data, self.config.zstd_level).map_err(transform_err)?;

        debug!(
            "Zstd compressed: {} → {} bytes (ratio: {:.2}x)",
            data.len(),
            compressed.len(),
            compression_ratio(data.len(), compressed.len())
        );

        Ok(compressed)
    }

    /// Decompress using Zstd
    fn decompress_zstd(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::decode_all(data).map_err(transform_err)
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}

fn compression_ratio(original: usize, compressed: usize) -> f64 {
    if compressed == 0 {
        return 1.0;
    }
    original as f64 / compressed as f64
}

fn transform_err(err: std::io::Error) -> CacheError {
    CacheError::Transform(format!("compression failed: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressor(algorithm: CompressionAlgorithm, min_payload_size: usize) -> Compressor {
        Compressor::new(CompressionConfig {
            algorithm,
            min_payload_size,
            ..Default::default()
        })
    }

    #[test]
    fn test_lz4_compression() {
        let compressor = compressor(CompressionAlgorithm::Lz4, 10);

        let data = b"Hello, World! This is a test string that should compress well.".repeat(10);
        let (compressed, algo) = compressor.compress(&data).unwrap();

        assert_eq!(algo, CompressionAlgorithm::Lz4);
        assert!(compressed.len() < data.len());

        let decompressed = compressor.decompress(&compressed, algo).unwrap();
        assert_eq!(data.to_vec(), decompressed);
    }

    #[test]
    fn test_zstd_compression() {
        let compressor = compressor(CompressionAlgorithm::Zstd, 10);

        let data = b"Hello, World! This is a test string that should compress well.".repeat(10);
        let (compressed, algo) = compressor.compress(&data).unwrap();

        assert_eq!(algo, CompressionAlgorithm::Zstd);
        assert!(compressed.len() < data.len());

        let decompressed = compressor.decompress(&compressed, algo).unwrap();
        assert_eq!(data.to_vec(), decompressed);
    }

    #[test]
    fn test_skip_small_payloads() {
        let compressor = compressor(CompressionAlgorithm::Lz4, 1024);

        let (result, algo) = compressor.compress(b"Small").unwrap();

        assert_eq!(algo, CompressionAlgorithm::None);
        assert_eq!(result, b"Small");
    }

    #[test]
    fn test_decompress_garbage_fails() {
        let compressor = Compressor::default();
        assert!(
            compressor
                .decompress(b"definitely not lz4", CompressionAlgorithm::Lz4)
                .is_err()
        );
    }
}
