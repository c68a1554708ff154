//! Chunked binary framing for large WebSocket payloads.
//! Some browser WebSocket stacks choke on large binary frames, so catch-up
//! payloads are gzip-compressed and split into at most 255 sequenced chunks,
//! each framed as `[0x02, index, total, payload...]`.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::protocol::FRAME_CHUNK;

/// Default chunk payload size.
pub const DEFAULT_CHUNK_BYTES: usize = 8192;
/// Floor for the chunk payload size; requests below this are raised to it.
const MIN_CHUNK_BYTES: usize = 512;
/// Chunk index and total are single bytes on the wire.
const MAX_CHUNKS: usize = 255;

/// Split `payload` into `[0x02, index, total, ...]` frames of the default
/// chunk size.
pub fn chunk_frames(payload: &[u8]) -> Vec<Vec<u8>> {
    chunk_frames_with(payload, DEFAULT_CHUNK_BYTES)
}

/// Split `payload` into frames of roughly `chunk_size` bytes each. The size
/// is clamped to at least 512 bytes and grown further when the count would
/// exceed 255 chunks. An empty payload yields one empty chunk.
pub fn chunk_frames_with(payload: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    if payload.is_empty() {
        return vec![vec![FRAME_CHUNK, 0, 1]];
    }

    let mut chunk_size = chunk_size.max(MIN_CHUNK_BYTES);
    if payload.len().div_ceil(chunk_size) > MAX_CHUNKS {
        chunk_size = payload.len().div_ceil(MAX_CHUNKS);
    }
    let total = payload.len().div_ceil(chunk_size);

    let mut frames = Vec::with_capacity(total);
    for (index, piece) in payload.chunks(chunk_size).enumerate() {
        let mut frame = Vec::with_capacity(3 + piece.len());
        frame.push(FRAME_CHUNK);
        frame.push(index as u8);
        frame.push(total as u8);
        frame.extend_from_slice(piece);
        frames.push(frame);
    }
    frames
}

/// Reassemble frames produced by [`chunk_frames`], in any arrival order.
/// Mirrors the browser-side decoder; returns None on malformed or missing
/// chunks.
pub fn reassemble(frames: &[Vec<u8>]) -> Option<Vec<u8>> {
    let total = match frames.first() {
        Some(f) if f.len() >= 3 && f[0] == FRAME_CHUNK => f[2] as usize,
        _ => return None,
    };
    if total == 0 {
        return None;
    }

    let mut slots: Vec<Option<&[u8]>> = vec![None; total];
    for frame in frames {
        if frame.len() < 3 || frame[0] != FRAME_CHUNK || frame[2] as usize != total {
            return None;
        }
        let index = frame[1] as usize;
        if index >= total {
            return None;
        }
        slots[index] = Some(&frame[3..]);
    }

    let mut out = Vec::new();
    for slot in slots {
        out.extend_from_slice(slot?);
    }
    Some(out)
}

/// Gzip-compress `data` for the catch-up path.
pub fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Gzip a catch-up payload and frame it: the whole server-to-client pipeline
/// for one large message. CPU-bound; callers run it off the async reactor and
/// outside any session lock.
pub fn compressed_frames(payload: &[u8]) -> std::io::Result<Vec<Vec<u8>>> {
    Ok(chunk_frames(&gzip(payload)?))
}

/// Inverse of [`gzip`]; what the browser runs on a reassembled payload.
pub fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_is_one_chunk() {
        let frames = chunk_frames(b"hello");
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..3], &[FRAME_CHUNK, 0, 1]);
        assert_eq!(&frames[0][3..], b"hello");
    }

    #[test]
    fn empty_payload_is_one_empty_chunk() {
        let frames = chunk_frames(b"");
        assert_eq!(frames, vec![vec![FRAME_CHUNK, 0, 1]]);
        assert_eq!(reassemble(&frames), Some(Vec::new()));
    }

    #[test]
    fn twenty_kilobytes_is_three_default_chunks() {
        let payload = vec![7u8; 20_000];
        let frames = chunk_frames(&payload);
        assert_eq!(frames.len(), 3);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame[0], FRAME_CHUNK);
            assert_eq!(frame[1], i as u8);
            assert_eq!(frame[2], 3);
        }
        assert_eq!(frames[0].len() - 3, 8192);
        assert_eq!(frames[2].len() - 3, 20_000 - 2 * 8192);
        assert_eq!(reassemble(&frames), Some(payload));
    }

    #[test]
    fn requested_size_is_clamped_to_the_floor() {
        let payload = vec![1u8; 2048];
        let frames = chunk_frames_with(&payload, 16);
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].len() - 3, MIN_CHUNK_BYTES);
    }

    #[test]
    fn chunk_size_grows_to_keep_count_under_256() {
        // 200_000 bytes at 512 per chunk would need 391 chunks.
        let payload: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
        let frames = chunk_frames_with(&payload, 512);
        assert!(frames.len() <= 255);
        assert!(frames[0].len() - 3 >= MIN_CHUNK_BYTES);
        assert_eq!(reassemble(&frames), Some(payload));
    }

    #[test]
    fn reassembles_out_of_order() {
        let payload: Vec<u8> = (0..4096u32).map(|i| (i * 31) as u8).collect();
        let mut frames = chunk_frames_with(&payload, 512);
        frames.reverse();
        assert_eq!(reassemble(&frames), Some(payload));
    }

    #[test]
    fn reassemble_rejects_missing_chunk() {
        let payload = vec![1u8; 2048];
        let mut frames = chunk_frames_with(&payload, 512);
        frames.remove(1);
        assert_eq!(reassemble(&frames), None);
    }

    #[test]
    fn gzip_roundtrip_through_chunks() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let compressed = gzip(&payload).unwrap();
        let frames = chunk_frames(&compressed);
        let rebuilt = reassemble(&frames).unwrap();
        assert_eq!(gunzip(&rebuilt).unwrap(), payload);
    }

    #[test]
    fn compressed_frames_reconstruct_the_payload() {
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 13) as u8).collect();
        let frames = compressed_frames(&payload).unwrap();
        let rebuilt = reassemble(&frames).unwrap();
        assert_eq!(gunzip(&rebuilt).unwrap(), payload);
    }
}
