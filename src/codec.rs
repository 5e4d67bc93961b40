//! Record Codec
//!
//! Converts rows to and from the table file's record block:
//! - Framing: each record is a `u32` little-endian length followed by its
//!   `bincode` payload, records laid out in live-set order
//! - Compression: optional gzip over the whole block
//! - Encryption: optional, delegated to an external [`BlockCipher`]

use crate::error::{Result, StoreError};
use crate::schema::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use std::sync::Arc;

/// Length prefix in front of every record payload
pub const FRAME_PREFIX_LEN: usize = 4;

/// External cipher given only the registry's opaque key
pub trait BlockCipher: Send + Sync {
    fn encrypt(&self, key: &str, plain: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, key: &str, sealed: &[u8]) -> Result<Vec<u8>>;
}

/// Bytes one row occupies in the uncompressed record block
pub fn encoded_size<R: Serialize>(row: &R) -> Result<u64> {
    Ok(FRAME_PREFIX_LEN as u64 + bincode::serialized_size(row)?)
}

/// Append one framed record to `out`
pub fn encode_record_into<R: Serialize>(row: &R, out: &mut Vec<u8>) -> Result<()> {
    let payload = bincode::serialize(row)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| StoreError::Encoding(format!("record of {} bytes is too large", payload.len())))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(())
}

/// Encode the whole live set into an uncompressed record block
pub fn encode_records<R: Serialize>(rows: &[R]) -> Result<Vec<u8>> {
    let mut block = Vec::new();
    for row in rows {
        encode_record_into(row, &mut block)?;
    }
    Ok(block)
}

/// Decode an uncompressed record block
pub fn decode_records<R: DeserializeOwned>(block: &[u8]) -> Result<Vec<R>> {
    let mut rows = Vec::new();
    let mut offset = 0usize;

    while offset < block.len() {
        if block.len() - offset < FRAME_PREFIX_LEN {
            return Err(StoreError::Encoding(format!(
                "truncated record frame at offset {}",
                offset
            )));
        }
        let mut len_bytes = [0u8; FRAME_PREFIX_LEN];
        len_bytes.copy_from_slice(&block[offset..offset + FRAME_PREFIX_LEN]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        offset += FRAME_PREFIX_LEN;

        if block.len() - offset < len {
            return Err(StoreError::Encoding(format!(
                "record at offset {} claims {} bytes, only {} remain",
                offset - FRAME_PREFIX_LEN,
                len,
                block.len() - offset
            )));
        }
        rows.push(bincode::deserialize(&block[offset..offset + len])?);
        offset += len;
    }

    Ok(rows)
}

pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            use flate2::write::GzEncoder;

            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
    }
}

pub fn decompress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            use flate2::read::GzDecoder;

            let mut decoder = GzDecoder::new(data);
            let mut result = Vec::new();
            decoder.read_to_end(&mut result)?;
            Ok(result)
        }
    }
}

/// Per-table pipeline from record block to stored bytes
#[derive(Clone)]
pub struct RecordCodec {
    compression: Compression,
    cipher: Option<(Arc<dyn BlockCipher>, String)>,
}

impl RecordCodec {
    pub fn new(compression: Compression) -> Self {
        RecordCodec {
            compression,
            cipher: None,
        }
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn BlockCipher>, key: String) -> Self {
        self.cipher = Some((cipher, key));
        self
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Compress then encrypt an uncompressed block
    pub fn seal(&self, block: &[u8]) -> Result<Vec<u8>> {
        let compressed = compress(self.compression, block)?;
        match &self.cipher {
            Some((cipher, key)) => cipher.encrypt(key, &compressed),
            None => Ok(compressed),
        }
    }

    /// Reverse [`RecordCodec::seal`]
    pub fn unseal(&self, stored: &[u8]) -> Result<Vec<u8>> {
        let compressed = match &self.cipher {
            Some((cipher, key)) => cipher.decrypt(key, stored)?,
            None => stored.to_vec(),
        };
        decompress(self.compression, &compressed)
    }
}

impl std::fmt::Debug for RecordCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCodec")
            .field("compression", &self.compression)
            .field("encrypted", &self.cipher.is_some())
            .finish()
    }
}
