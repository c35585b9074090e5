//! Payload compression for policies with `compression_enabled`

pub mod compressor;

pub use compressor::{CompressionAlgorithm, CompressionConfig, Compressor};
