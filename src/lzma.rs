//! Raw LZMA2 decompression behind a single capability trait.
//!
//! Block payloads carry a raw LZMA2 chunk stream (no XZ container, default
//! dictionary). [`NativeDecoder`] binds liblzma's raw decoder via `xz2` —
//! liblzma is the only stack crate that exposes headerless LZMA2 directly.
//! The block engine is generic over [`Lzma2Decoder`] and never inspects
//! which implementation it got, so hosts can substitute their own.

use thiserror::Error;
use xz2::stream::{Action, Filters, LzmaOptions, Status, Stream};

#[derive(Error, Debug)]
pub enum LzmaError {
    #[error("bad LZMA2 stream: {0}")]
    BadStream(String),
    #[error("truncated LZMA2 stream")]
    Truncated,
}

/// Decompress one raw LZMA2 stream into a byte vector.
pub trait Lzma2Decoder: Send + Sync {
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, LzmaError>;
}

/// The decoder used when the host does not supply one.
pub type DefaultDecoder = NativeDecoder;

/// liblzma raw decoder configured with the single LZMA2 filter at the
/// default (preset 6) dictionary size.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeDecoder;

fn lzma2_filters() -> Result<Filters, LzmaError> {
    let opts = LzmaOptions::new_preset(6).map_err(|e| LzmaError::BadStream(e.to_string()))?;
    let mut filters = Filters::new();
    filters.lzma2(&opts);
    Ok(filters)
}

impl Lzma2Decoder for NativeDecoder {
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, LzmaError> {
        let mut stream = Stream::new_raw_decoder(&lzma2_filters()?)
            .map_err(|e| LzmaError::BadStream(e.to_string()))?;

        // Grow the output geometrically; liblzma reports StreamEnd when the
        // LZMA2 end marker is reached.
        let mut out = Vec::with_capacity(data.len().saturating_mul(4).max(64 * 1024));
        loop {
            let in_before = stream.total_in();
            let out_before = stream.total_out();
            let status = stream
                .process_vec(&data[in_before as usize..], &mut out, Action::Finish)
                .map_err(|e| LzmaError::BadStream(e.to_string()))?;
            if matches!(status, Status::StreamEnd) {
                return Ok(out);
            }
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(64 * 1024));
            } else if stream.total_in() == in_before && stream.total_out() == out_before {
                // No progress with input exhausted and output space free.
                return Err(LzmaError::Truncated);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Raw LZMA2 encoder counterpart, test-only.
    fn lzma2_compress(data: &[u8]) -> Vec<u8> {
        let mut stream = Stream::new_raw_encoder(&lzma2_filters().unwrap()).unwrap();
        let mut out = Vec::with_capacity(data.len() + 1024);
        loop {
            let consumed = stream.total_in() as usize;
            let status = stream
                .process_vec(&data[consumed..], &mut out, Action::Finish)
                .unwrap();
            match status {
                Status::StreamEnd => return out,
                _ => {
                    if out.len() == out.capacity() {
                        out.reserve(out.capacity().max(1024));
                    }
                }
            }
        }
    }

    #[test]
    fn roundtrip() {
        let data: Vec<u8> = (0u8..=255).cycle().take(70_000).collect();
        assert_eq!(NativeDecoder.decompress(&lzma2_compress(&data)).unwrap(), data);
        assert!(NativeDecoder.decompress(&lzma2_compress(b"")).unwrap().is_empty());
    }

    #[test]
    fn rejects_garbage() {
        assert!(NativeDecoder.decompress(&[0xFF, 0xFE, 0xFD, 0xFC]).is_err());
    }

    #[test]
    fn truncated_stream_detected() {
        let compressed = lzma2_compress(&[0x42u8; 4096]);
        // Drop the tail (including the end marker).
        let err = NativeDecoder.decompress(&compressed[..compressed.len() / 2]).unwrap_err();
        assert!(matches!(err, LzmaError::Truncated | LzmaError::BadStream(_)));
    }
}
