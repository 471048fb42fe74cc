//! Optional gzip envelope around encoded delta frames
//!
//! The envelope is a single marker byte followed by either the raw frame or its
//! gzip stream. Frames are only compressed when they are large enough and the
//! result is actually smaller.

use crate::error::{ReplicationError, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};

const ENVELOPE_RAW: u8 = 0;
const ENVELOPE_GZIP: u8 = 1;

/// Wrap `frame`, gzip-compressing it when that pays off
pub fn pack(frame: &[u8], enabled: bool, min_size: usize) -> Result<Vec<u8>> {
    if enabled && frame.len() >= min_size {
        let mut encoder = GzEncoder::new(
            Vec::with_capacity(frame.len() / 2 + 1),
            Compression::default(),
        );
        encoder.write_all(frame)?;
        let compressed = encoder.finish()?;

        if compressed.len() < frame.len() {
            let mut packed = Vec::with_capacity(compressed.len() + 1);
            packed.push(ENVELOPE_GZIP);
            packed.extend_from_slice(&compressed);
            return Ok(packed);
        }
    }

    let mut packed = Vec::with_capacity(frame.len() + 1);
    packed.push(ENVELOPE_RAW);
    packed.extend_from_slice(frame);
    Ok(packed)
}

/// Undo [`pack`]
pub fn unpack(packed: &[u8]) -> Result<Vec<u8>> {
    match packed.split_first() {
        Some((&ENVELOPE_RAW, frame)) => Ok(frame.to_vec()),
        Some((&ENVELOPE_GZIP, compressed)) => {
            let mut decoder = GzDecoder::new(compressed);
            let mut frame = Vec::new();
            decoder.read_to_end(&mut frame).map_err(|e| {
                ReplicationError::MalformedContent(format!(
                    "Failed to decompress delta frame: {}",
                    e
                ))
            })?;
            Ok(frame)
        }
        Some((marker, _)) => Err(ReplicationError::MalformedContent(format!(
            "Unknown delta envelope marker {}",
            marker
        ))),
        None => Err(ReplicationError::MalformedContent(
            "Empty delta envelope".to_string(),
        )),
    }
}

/// Whether a packed envelope carries a compressed frame
pub fn is_compressed(packed: &[u8]) -> bool {
    packed.first() == Some(&ENVELOPE_GZIP)
}
