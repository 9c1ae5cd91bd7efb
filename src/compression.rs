//! Payload compression shared by both remote transports.
//!
//! Payloads above [`COMPRESSION_THRESHOLD`] bytes are zlib-compressed and
//! prefixed with [`TAG`]. Anything not starting with the tag is raw.

use anyhow::bail;
use bytes::Bytes;
use flate2::Compression;
use std::{
    borrow::Cow,
    io::{Read, Write},
};

/// Marks a compressed payload.
pub const TAG: &[u8; 4] = b"ABG:";

/// Payloads strictly larger than this are compressed.
pub const COMPRESSION_THRESHOLD: usize = 400;

/// Limit to avoid out-of-memory DOS from a hostile inflate.
pub const DECOMPRESSED_LIMIT: usize = 16 * 1024 * 1024; // 16 MiB

const COMPRESSION_LEVEL: Compression = Compression::best();

/// Upper bound on the zlib-compressed size of `len` input bytes,
/// computable without running the compressor.
pub fn worst_case_compressed_size(len: usize) -> usize {
    len + (len >> 12) + (len >> 14) + (len >> 25) + 13
}

/// Compresses and tags `payload` if it exceeds the threshold,
/// otherwise returns it unchanged.
pub fn encode_payload(payload: &[u8]) -> anyhow::Result<Cow<'_, [u8]>> {
    if payload.len() <= COMPRESSION_THRESHOLD {
        return Ok(Cow::Borrowed(payload));
    }

    let mut buf = Vec::with_capacity(TAG.len() + payload.len() / 2);
    buf.extend_from_slice(TAG);
    let mut encoder = flate2::write::ZlibEncoder::new(buf, COMPRESSION_LEVEL);
    encoder.write_all(payload)?;
    Ok(Cow::Owned(encoder.finish()?))
}

/// Strips the tag and inflates a tagged payload. Untagged payloads pass through.
pub fn decode_payload(payload: Bytes) -> anyhow::Result<Bytes> {
    if !payload.starts_with(TAG) {
        return Ok(payload);
    }
    let compressed = &payload[TAG.len()..];

    let mut buf = Vec::new();
    flate2::read::ZlibDecoder::new(compressed)
        .take(DECOMPRESSED_LIMIT as u64 + 1)
        .read_to_end(&mut buf)?;
    if buf.len() > DECOMPRESSED_LIMIT {
        bail!("decompressed payload exceeds {DECOMPRESSED_LIMIT} bytes");
    }
    Ok(buf.into())
}
