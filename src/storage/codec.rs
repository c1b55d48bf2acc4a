// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// Payload compression for the record log
///
/// Every log frame carries the tag of the codec that produced its payload,
/// so changing the configured compression never affects records already on
/// disk.
///
/// - LZ4: fast, moderate ratio. Suited to high ingest rates.
/// - Zstd: slower, better ratio. Suited to long retention.
/// - None: payload stored as received.
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::error::{Result, StoreError};

/// Compression level (0-4)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum CompressionLevel {
    Fastest = 0,
    Fast = 1,
    #[default]
    Default = 2,
    Slow = 3,
    Slowest = 4,
}

impl CompressionLevel {
    pub fn from_u8(level: u8) -> Option<Self> {
        match level {
            0 => Some(CompressionLevel::Fastest),
            1 => Some(CompressionLevel::Fast),
            2 => Some(CompressionLevel::Default),
            3 => Some(CompressionLevel::Slow),
            4 => Some(CompressionLevel::Slowest),
            _ => None,
        }
    }

    pub fn to_zstd_level(self) -> i32 {
        match self {
            CompressionLevel::Fastest => 1,
            CompressionLevel::Fast => 3,
            CompressionLevel::Default => 5,
            CompressionLevel::Slow => 10,
            CompressionLevel::Slowest => 19,
        }
    }

    pub fn to_lz4_level(self) -> u32 {
        match self {
            CompressionLevel::Fastest => 1,
            CompressionLevel::Fast => 3,
            CompressionLevel::Default => 5,
            CompressionLevel::Slow => 9,
            CompressionLevel::Slowest => 12,
        }
    }
}

/// Compression type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    None,
    Lz4,
    Zstd,
}

impl CompressionType {
    /// Tag written into each log frame
    pub fn tag(self) -> u32 {
        match self {
            CompressionType::None => 0,
            CompressionType::Lz4 => 1,
            CompressionType::Zstd => 2,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Lz4),
            2 => Some(CompressionType::Zstd),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadCodec {
    compression_type: CompressionType,
    compression_level: CompressionLevel,
}

impl PayloadCodec {
    pub fn new(compression_type: CompressionType, compression_level: CompressionLevel) -> Self {
        Self {
            compression_type,
            compression_level,
        }
    }

    pub fn compression_type(&self) -> CompressionType {
        self.compression_type
    }

    /// Compress `data`, returning the codec tag alongside the encoded bytes
    pub fn encode(&self, data: &[u8]) -> Result<(u32, Vec<u8>)> {
        let encoded = match self.compression_type {
            CompressionType::None => data.to_vec(),
            CompressionType::Lz4 => self.compress_lz4(data)?,
            CompressionType::Zstd => zstd::encode_all(data, self.compression_level.to_zstd_level())
                .map_err(|e| StoreError::Codec(format!("zstd compression failed: {}", e)))?,
        };
        Ok((self.compression_type.tag(), encoded))
    }

    fn compress_lz4(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = lz4::EncoderBuilder::new()
            .level(self.compression_level.to_lz4_level())
            .build(Vec::with_capacity(data.len() / 2))
            .map_err(|e| StoreError::Codec(format!("failed to create LZ4 encoder: {}", e)))?;
        encoder
            .write_all(data)
            .map_err(|e| StoreError::Codec(format!("LZ4 compression failed: {}", e)))?;
        let (compressed, result) = encoder.finish();
        result.map_err(|e| StoreError::Codec(format!("LZ4 compression failed: {}", e)))?;
        Ok(compressed)
    }

    /// Reverse `encode` for a frame written with codec `tag`
    pub fn decode(tag: u32, data: &[u8], raw_len: usize) -> Result<Vec<u8>> {
        let decoded = match CompressionType::from_tag(tag) {
            Some(CompressionType::None) => data.to_vec(),
            Some(CompressionType::Lz4) => {
                let mut decoder = lz4::Decoder::new(data)
                    .map_err(|e| StoreError::Codec(format!("LZ4 decoder setup failed: {}", e)))?;
                let mut out = Vec::with_capacity(raw_len);
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| StoreError::Codec(format!("LZ4 decompression failed: {}", e)))?;
                out
            }
            Some(CompressionType::Zstd) => zstd::decode_all(data)
                .map_err(|e| StoreError::Codec(format!("zstd decompression failed: {}", e)))?,
            None => return Err(StoreError::Codec(format!("unknown codec tag {}", tag))),
        };
        if decoded.len() != raw_len {
            return Err(StoreError::Codec(format!(
                "decoded {} bytes, expected {}",
                decoded.len(),
                raw_len
            )));
        }
        Ok(decoded)
    }
}
