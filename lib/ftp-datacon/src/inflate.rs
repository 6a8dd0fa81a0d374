/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ftp-datacon authors
 */

use flate2::{Decompress, FlushDecompress, Status};
use log::warn;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InflateError {
    /// The compressed stream is damaged. Output produced so far cannot be
    /// trusted.
    #[error("corrupted deflate stream: {0}")]
    Corrupted(String),
}

/// Result of one bounded decompression step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InflateStep {
    /// compressed input bytes consumed by this step
    pub consumed: usize,
    /// decompressed bytes appended to the output buffer
    pub produced: usize,
    /// the zlib stream end marker was reached
    pub stream_end: bool,
}

/// Incremental zlib decompressor for MODE Z data transfers.
///
/// A transfer feeds arbitrarily fragmented compressed chunks through
/// [`inflate_step`](StreamInflater::inflate_step); output is bounded by the
/// spare capacity of the caller's buffer so a highly compressed input cannot
/// blow up memory in one call. Servers that never terminate the zlib stream
/// are tolerated: correctness is covered by the control connection reply and
/// a clean TCP close.
pub struct StreamInflater {
    stream: Decompress,
    stream_ended: bool,
}

impl Default for StreamInflater {
    fn default() -> Self {
        StreamInflater::new()
    }
}

impl StreamInflater {
    pub fn new() -> Self {
        StreamInflater {
            stream: Decompress::new(true),
            stream_ended: false,
        }
    }

    /// Drop any leftover stream state and start a fresh zlib stream.
    pub fn reset(&mut self) {
        self.stream.reset(true);
        self.stream_ended = false;
    }

    pub fn stream_ended(&self) -> bool {
        self.stream_ended
    }

    /// Decompress as much of `input` as fits into the spare capacity of
    /// `out`. Returns how much input was consumed and output produced; the
    /// caller loops with the unconsumed remainder once it made room in `out`.
    /// Input arriving after the stream end is discarded with a diagnostic.
    pub fn inflate_step(
        &mut self,
        input: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<InflateStep, InflateError> {
        if self.stream_ended {
            if !input.is_empty() {
                warn!(
                    "ignoring {} bytes received after end of compressed stream",
                    input.len()
                );
            }
            return Ok(InflateStep {
                consumed: input.len(),
                produced: 0,
                stream_end: true,
            });
        }

        let in_before = self.stream.total_in();
        let out_before = self.stream.total_out();
        let status = self
            .stream
            .decompress_vec(input, out, FlushDecompress::None)
            .map_err(|e| InflateError::Corrupted(e.to_string()))?;
        let mut consumed = (self.stream.total_in() - in_before) as usize;
        let produced = (self.stream.total_out() - out_before) as usize;

        if status == Status::StreamEnd {
            self.stream_ended = true;
            if consumed < input.len() {
                warn!(
                    "ignoring {} bytes received after end of compressed stream",
                    input.len() - consumed
                );
                consumed = input.len();
            }
        }
        Ok(InflateStep {
            consumed,
            produced,
            stream_end: self.stream_ended,
        })
    }

    /// Decompress a complete in-memory buffer, growing the output as needed.
    /// Used for transfers collected in memory (directory listings). A stream
    /// that runs out of input without the end marker is returned as-is.
    pub fn inflate_to_end(input: &[u8], grow_step: usize) -> Result<Vec<u8>, InflateError> {
        let mut stream = Decompress::new(true);
        // assume a 50% compression ratio for the first allocation
        let mut out = Vec::with_capacity(2 * grow_step.max(64));
        let mut offset = 0usize;
        loop {
            let in_before = stream.total_in();
            let out_before = out.len();
            let status = stream
                .decompress_vec(&input[offset..], &mut out, FlushDecompress::None)
                .map_err(|e| InflateError::Corrupted(e.to_string()))?;
            let consumed = (stream.total_in() - in_before) as usize;
            offset += consumed;
            match status {
                Status::StreamEnd => {
                    if offset < input.len() {
                        warn!(
                            "ignoring {} bytes received after end of compressed stream",
                            input.len() - offset
                        );
                    }
                    return Ok(out);
                }
                Status::Ok | Status::BufError => {
                    if offset >= input.len() {
                        // stream without a proper end marker, tolerated
                        return Ok(out);
                    }
                    if out.capacity() == out.len() {
                        out.reserve(grow_step.max(64));
                    } else if consumed == 0 && out.len() == out_before {
                        // no forward progress with room available: treat the
                        // remainder as an unterminated tail
                        return Ok(out);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn whole_buffer_round_trip() {
        let data = b"directory listing line\r\nanother line\r\n".repeat(100);
        let packed = deflate(&data);
        let out = StreamInflater::inflate_to_end(&packed, 4096).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn chunked_round_trip_any_fragmentation() {
        let data: Vec<u8> = (0..64 * 1024u32).map(|v| (v % 251) as u8).collect();
        let packed = deflate(&data);
        for chunk_size in [1usize, 3, 7, 64, 511, 4096] {
            let mut inflater = StreamInflater::new();
            let mut out = Vec::with_capacity(1024);
            let mut all = Vec::new();
            for chunk in packed.chunks(chunk_size) {
                let mut rest = chunk;
                while !rest.is_empty() {
                    let step = inflater.inflate_step(rest, &mut out).unwrap();
                    rest = &rest[step.consumed..];
                    if out.capacity() == out.len() {
                        all.append(&mut out);
                    }
                    if step.consumed == 0 && step.produced == 0 && !step.stream_end {
                        // no progress possible until output space is freed
                        all.append(&mut out);
                    }
                }
            }
            all.append(&mut out);
            assert_eq!(all, data, "chunk size {chunk_size}");
            assert!(inflater.stream_ended());
        }
    }

    #[test]
    fn corrupted_stream() {
        let data = b"some file content that will be damaged in transit".repeat(50);
        let mut packed = deflate(&data);
        let len = packed.len();
        for b in &mut packed[len - 10..] {
            *b = !*b;
        }
        let mut inflater = StreamInflater::new();
        let mut out = Vec::with_capacity(64 * 1024);
        let mut rest = packed.as_slice();
        let mut failed = false;
        while !rest.is_empty() {
            match inflater.inflate_step(rest, &mut out) {
                Ok(step) => {
                    if step.stream_end {
                        break;
                    }
                    assert!(step.consumed > 0 || step.produced > 0);
                    rest = &rest[step.consumed..];
                }
                Err(InflateError::Corrupted(_)) => {
                    failed = true;
                    break;
                }
            }
        }
        assert!(failed);
    }

    #[test]
    fn missing_stream_end_tolerated() {
        let data = b"stream cut off before the zlib trailer".repeat(20);
        let packed = deflate(&data);
        let cut = &packed[..packed.len() - 8];
        let out = StreamInflater::inflate_to_end(cut, 4096).unwrap();
        assert!(data.starts_with(&out));
    }

    #[test]
    fn trailing_garbage_discarded() {
        let data = b"listing";
        let mut packed = deflate(data);
        packed.extend_from_slice(b"GARBAGE");
        let out = StreamInflater::inflate_to_end(&packed, 4096).unwrap();
        assert_eq!(out, data);

        let mut inflater = StreamInflater::new();
        let mut step_out = Vec::with_capacity(1024);
        let step = inflater.inflate_step(&packed, &mut step_out).unwrap();
        assert!(step.stream_end);
        assert_eq!(step.consumed, packed.len());
        assert_eq!(step_out, data);
    }
}
