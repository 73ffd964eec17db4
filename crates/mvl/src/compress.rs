//! Streaming zlib plumbing for data-block payloads.
//!
//! Each compressed data block is one complete zlib stream. Writing is a
//! one-shot deflate of a flushed staging ring; reading keeps a
//! `Decompress` state object alive on the channel so a single block's
//! inflation can continue across multiple fill calls without resetting
//! the dictionary.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::Result;
use crate::ring::StagingRing;

const DEFLATE_CHUNK: usize = 0x400;
const DEFLATE_OUT: usize = 0x800;

/// Drain `ring` through a fresh deflate stream and return the complete
/// compressed payload for one data block.
pub(crate) fn deflate_block(ring: &mut StagingRing) -> Result<Vec<u8>> {
    let mut stream = Compress::new(Compression::best(), true);
    let mut out = Vec::with_capacity(ring.len() / 2 + 64);
    let mut chunk = [0u8; DEFLATE_CHUNK];
    let mut zbuf = [0u8; DEFLATE_OUT];

    while !ring.is_empty() {
        let n = ring.read(&mut chunk);
        let mut fed = 0;
        while fed < n {
            let before_in = stream.total_in();
            let before_out = stream.total_out();
            stream.compress(&chunk[fed..n], &mut zbuf, FlushCompress::None)?;
            fed += (stream.total_in() - before_in) as usize;
            let produced = (stream.total_out() - before_out) as usize;
            out.extend_from_slice(&zbuf[..produced]);
        }
    }

    loop {
        let before_out = stream.total_out();
        let status = stream.compress(&[], &mut zbuf, FlushCompress::Finish)?;
        let produced = (stream.total_out() - before_out) as usize;
        out.extend_from_slice(&zbuf[..produced]);
        if matches!(status, Status::StreamEnd) {
            break;
        }
    }
    Ok(out)
}

/// Per-channel inflate state for the compressed block currently being
/// consumed. Dropped at stream end or on corruption.
#[derive(Debug)]
pub(crate) struct ChannelInflater {
    stream: Decompress,
}

impl ChannelInflater {
    pub fn new() -> Self {
        Self {
            // Matching zlib header written by `deflate_block`.
            stream: Decompress::new(true),
        }
    }

    /// One inflate step. Returns `(consumed, produced, status)`;
    /// a decompression error surfaces as `None` status.
    pub fn step(&mut self, input: &[u8], output: &mut [u8]) -> (usize, usize, Option<Status>) {
        let before_in = self.stream.total_in();
        let before_out = self.stream.total_out();
        let status = self
            .stream
            .decompress(input, output, FlushDecompress::None)
            .ok();
        let consumed = (self.stream.total_in() - before_in) as usize;
        let produced = (self.stream.total_out() - before_out) as usize;
        (consumed, produced, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_of(data: &[u8]) -> StagingRing {
        let mut ring = StagingRing::with_capacity(data.len().next_power_of_two());
        assert_eq!(ring.write(data), data.len());
        ring
    }

    #[test]
    fn deflate_block_inflates_back() {
        let payload: Vec<u8> = (0..4096u32).flat_map(|v| (v % 251).to_le_bytes()).collect();
        let compressed = deflate_block(&mut ring_of(&payload)).unwrap();
        assert!(compressed.len() < payload.len());

        let mut inflater = ChannelInflater::new();
        let mut out = Vec::new();
        let mut zbuf = [0u8; 256];
        let mut offset = 0;
        loop {
            let (consumed, produced, status) = inflater.step(&compressed[offset..], &mut zbuf);
            offset += consumed;
            out.extend_from_slice(&zbuf[..produced]);
            match status {
                Some(Status::StreamEnd) => break,
                Some(_) => {}
                None => panic!("inflate error"),
            }
        }
        assert_eq!(out, payload);
    }

    #[test]
    fn garbage_input_reports_error_status() {
        let mut inflater = ChannelInflater::new();
        let mut zbuf = [0u8; 64];
        // Not a zlib header; the step must fail rather than loop.
        let (_, _, status) = inflater.step(&[0x00, 0x11, 0x22, 0x33], &mut zbuf);
        assert!(status.is_none());
    }
}
