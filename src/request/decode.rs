//! Response body content decoding.

use crate::base::neterror::NetError;
use bytes::Bytes;
use std::io::Read;

/// Decode a complete response body per its Content-Encoding. Identity
/// and unknown encodings pass through untouched.
pub fn decode_body(content_encoding: Option<&str>, body: Bytes) -> Result<Bytes, NetError> {
    match content_encoding.map(|e| e.trim().to_ascii_lowercase()).as_deref() {
        Some("br") => {
            let mut out = Vec::new();
            let mut decoder = brotli::Decompressor::new(&body[..], 4096);
            decoder
                .read_to_end(&mut out)
                .map_err(|_| NetError::ContentDecodingFailed)?;
            Ok(Bytes::from(out))
        }
        Some("gzip") => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(&body[..])
                .read_to_end(&mut out)
                .map_err(|_| NetError::ContentDecodingFailed)?;
            Ok(Bytes::from(out))
        }
        Some("deflate") => {
            let mut out = Vec::new();
            flate2::read::ZlibDecoder::new(&body[..])
                .read_to_end(&mut out)
                .map_err(|_| NetError::ContentDecodingFailed)?;
            Ok(Bytes::from(out))
        }
        _ => Ok(body),
    }
}
