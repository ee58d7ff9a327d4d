//! Receiver session: frame stream in, recovered file out.
//!
//! [`DecodeSession`] reads frames (see [`crate::frame`]), optionally drops a
//! fraction of them to simulate a lossy link, and feeds the rest into a
//! [`PeelingDecoder`].  The first accepted frame fixes the transfer
//! geometry (`file_size`, `block_size`, and from them `k`); a frame that
//! disagrees with it is rejected.
//!
//! The session stops reading as soon as the decoder reports completion, or
//! once `max_blocks` frames have been processed.  A stream that ends before
//! completion is not an error by itself; asking for the output of an
//! incomplete decode is.
//!
//! Recovered output is the concatenation of every source block in id order,
//! truncated to `file_size` so the padding in the last block is dropped.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::config::{ConfigError, SessionOptions};
use crate::decoder::{DecodeError, PeelingDecoder};
use crate::frame::{Frame, FrameError, FrameHeader, FrameReader};

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(
        "Frame geometry {got_file_size}/{got_block_size} does not match \
         session geometry {file_size}/{block_size}"
    )]
    InconsistentGeometry {
        file_size:      u32,
        block_size:     u32,
        got_file_size:  u32,
        got_block_size: u32,
    },
    #[error("No frames were processed")]
    NoFrames,
    #[error("Decode stalled: {resolved}/{k} source blocks after {frames_processed} frames")]
    Stalled { frames_processed: u64, resolved: usize, k: u32 },
}

// ── Geometry ─────────────────────────────────────────────────────────────────

/// Transfer layout fixed by the first accepted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Geometry {
    pub file_size:     u32,
    pub block_size:    u32,
    pub source_blocks: u32,
}

impl From<&FrameHeader> for Geometry {
    fn from(h: &FrameHeader) -> Self {
        Geometry {
            file_size:     h.file_size,
            block_size:    h.block_size,
            source_blocks: h.source_blocks(),
        }
    }
}

#[derive(Debug)]
struct Active {
    geometry: Geometry,
    decoder:  PeelingDecoder,
}

impl Active {
    fn new(header: &FrameHeader) -> Self {
        let geometry = Geometry::from(header);
        Self {
            decoder: PeelingDecoder::with_block_len(geometry.source_blocks, geometry.block_size as usize),
            geometry,
        }
    }

    fn check(&self, header: &FrameHeader) -> Result<(), SessionError> {
        let g = &self.geometry;
        if header.file_size != g.file_size || header.block_size != g.block_size {
            return Err(SessionError::InconsistentGeometry {
                file_size:      g.file_size,
                block_size:     g.block_size,
                got_file_size:  header.file_size,
                got_block_size: header.block_size,
            });
        }
        Ok(())
    }
}

// ── Stats ────────────────────────────────────────────────────────────────────

/// Summary of one transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferStats {
    pub elapsed_ms:       f64,
    pub file_size:        u64,
    pub block_size:       u32,
    pub source_blocks:    u32,
    /// Frames read off the stream, dropped or not.
    pub frames_received:  u64,
    pub frames_processed: u64,
    pub frames_dropped:   u64,
    /// Processed frames that carried no new information.
    pub frames_redundant: u64,
    pub bytes_received:   u64,
    /// `file_size / bytes_received`.
    pub code_rate:        f64,
    pub resolved:         usize,
    pub complete:         bool,
    /// BLAKE3 of the reassembled output, once complete.
    pub output_blake3:    Option<String>,
}

impl TransferStats {
    /// Mean payload bytes per processed frame.
    pub fn bytes_per_frame(&self) -> u64 {
        if self.frames_processed == 0 { return 0; }
        self.bytes_received / self.frames_processed
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Multi-line report for display.
    pub fn summary(&self) -> String {
        let time = if self.elapsed_ms > 1000.0 {
            format!("{:.4}s", self.elapsed_ms / 1000.0)
        } else {
            format!("{:.4}ms", self.elapsed_ms)
        };
        let mut out = String::new();
        out.push_str(&format!("Transmission Time: {time}\n"));
        out.push_str(&format!("Total size:        {}\n", self.file_size));
        out.push_str(&format!(
            "Decoded:           {}/{} blocks{}\n",
            self.resolved,
            self.source_blocks,
            if self.complete { "" } else { " (incomplete)" },
        ));
        out.push_str("Packet Stats:\n");
        out.push_str(&format!("\tPackets Received:  {}\n", self.frames_received));
        out.push_str(&format!("\tPackets Processed: {}\n", self.frames_processed));
        out.push_str(&format!("\tPackets Dropped:   {}\n", self.frames_dropped));
        out.push_str(&format!("\tPackets Redundant: {}\n", self.frames_redundant));
        out.push_str("Data Stats\n");
        out.push_str(&format!("\tBytes/packet: {}\n", self.bytes_per_frame()));
        out.push_str(&format!("\tBytes Total:  {}\n", self.bytes_received));
        out.push_str(&format!("Code Rate: {:1.4}", self.code_rate));
        if let Some(hash) = &self.output_blake3 {
            out.push_str(&format!("\nBLAKE3:    {hash}"));
        }
        out
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

pub struct DecodeSession {
    options:          SessionOptions,
    rng:              StdRng,
    active:           Option<Active>,
    frames_received:  u64,
    frames_processed: u64,
    frames_dropped:   u64,
    bytes_received:   u64,
    started:          Option<Instant>,
    finished:         Option<Duration>,
}

impl DecodeSession {
    pub fn new(options: SessionOptions) -> Result<Self, SessionError> {
        options.validate()?;
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None       => StdRng::from_os_rng(),
        };
        Ok(Self {
            options,
            rng,
            active:           None,
            frames_received:  0,
            frames_processed: 0,
            frames_dropped:   0,
            bytes_received:   0,
            started:          None,
            finished:         None,
        })
    }

    /// Handle one received frame.  Returns `Ok(true)` once decoding is
    /// complete; frames offered after that are ignored.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<bool, SessionError> {
        if self.is_complete() {
            return Ok(true);
        }
        self.started.get_or_insert_with(Instant::now);
        self.frames_received += 1;

        if self.options.drop_rate > 0.0 && self.rng.random::<f64>() < self.options.drop_rate {
            self.frames_dropped += 1;
            trace!(frame = self.frames_received, "frame dropped");
            return Ok(false);
        }

        // A rejected frame neither counts as processed nor fixes the geometry.
        let mut fresh = None;
        let active = match self.active.as_mut() {
            Some(active) => {
                active.check(&frame.header)?;
                active
            }
            None => fresh.insert(Active::new(&frame.header)),
        };
        let degree = frame.dependencies.len();
        let done = active.decoder.is_complete()
            || active.decoder.add_block(&frame.dependencies, frame.payload)?;
        let (resolved, pending) = (active.decoder.resolved_count(), active.decoder.pending_count());

        if let Some(active) = fresh {
            debug!(
                file_size = active.geometry.file_size,
                block_size = active.geometry.block_size,
                k = active.geometry.source_blocks,
                "transfer geometry fixed"
            );
            self.active = Some(active);
        }
        self.frames_processed += 1;
        self.bytes_received += u64::from(frame.header.block_size);
        debug!(frame = self.frames_received, degree, resolved, pending, "frame processed");

        if done {
            self.stop_clock();
            info!(frames = self.frames_processed, "transfer decoded");
        }
        Ok(done)
    }

    /// Read frames from `reader` until the decode completes, the block
    /// budget runs out, or the stream ends.  Returns whether it completed.
    pub fn run<R: Read>(&mut self, reader: R) -> Result<bool, SessionError> {
        for frame in FrameReader::new(reader) {
            if self.handle_frame(frame?)? {
                return Ok(true);
            }
            if let Some(max) = self.options.max_blocks {
                if self.frames_processed >= max {
                    warn!(max_blocks = max, "block budget exhausted before decode completed");
                    self.stop_clock();
                    return Ok(false);
                }
            }
        }
        self.stop_clock();
        if !self.is_complete() {
            let (resolved, k) = self
                .decoder()
                .map_or((0, 0), |d| (d.resolved_count(), d.k()));
            warn!(resolved, k, "stream ended before decode completed");
        }
        Ok(self.is_complete())
    }

    fn stop_clock(&mut self) {
        if self.finished.is_none() {
            self.finished = self.started.map(|t| t.elapsed());
        }
    }

    pub fn is_complete(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.decoder.is_complete())
    }

    pub fn decoder(&self) -> Option<&PeelingDecoder> {
        self.active.as_ref().map(|a| &a.decoder)
    }

    pub fn geometry(&self) -> Option<Geometry> {
        self.active.as_ref().map(|a| a.geometry)
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    // ── Output ──────────────────────────────────────────────────────────────

    /// Write the recovered file to `out`.  Returns the number of bytes written.
    pub fn write_output<W: Write>(&self, out: &mut W) -> Result<u64, SessionError> {
        let active = self.completed()?;
        let mut left = u64::from(active.geometry.file_size);
        for block in active.decoder.sequence() {
            if left == 0 {
                break;
            }
            let n = (block.len() as u64).min(left) as usize;
            out.write_all(&block[..n])?;
            left -= n as u64;
        }
        Ok(u64::from(active.geometry.file_size) - left)
    }

    /// Write the recovered file to `path`.  The file is only created (or
    /// truncated) once the decode is known to be complete.
    pub fn save_output(&self, path: &Path) -> Result<u64, SessionError> {
        self.completed()?;
        let mut w = BufWriter::new(File::create(path)?);
        let n = self.write_output(&mut w)?;
        w.flush()?;
        Ok(n)
    }

    /// The recovered file as one buffer.
    pub fn reassemble(&self) -> Result<Vec<u8>, SessionError> {
        let mut buf = Vec::with_capacity(self.geometry().map_or(0, |g| g.file_size as usize));
        self.write_output(&mut buf)?;
        Ok(buf)
    }

    fn completed(&self) -> Result<&Active, SessionError> {
        let active = self.active.as_ref().ok_or(SessionError::NoFrames)?;
        if !active.decoder.is_complete() {
            return Err(SessionError::Stalled {
                frames_processed: self.frames_processed,
                resolved:         active.decoder.resolved_count(),
                k:                active.geometry.source_blocks,
            });
        }
        Ok(active)
    }

    pub fn stats(&self) -> TransferStats {
        let elapsed = self
            .finished
            .or_else(|| self.started.map(|t| t.elapsed()))
            .unwrap_or_default();
        let geometry = self.geometry();
        let file_size = geometry.map_or(0, |g| u64::from(g.file_size));
        let (resolved, redundant) = self
            .decoder()
            .map_or((0, 0), |d| (d.resolved_count(), d.stats().blocks_redundant));
        let code_rate = if self.bytes_received == 0 {
            0.0
        } else {
            file_size as f64 / self.bytes_received as f64
        };
        let output_blake3 = if self.is_complete() {
            let mut hasher = blake3::Hasher::new();
            self.write_output(&mut hasher).ok().map(|_| hasher.finalize().to_hex().to_string())
        } else {
            None
        };

        TransferStats {
            elapsed_ms:       elapsed.as_secs_f64() * 1000.0,
            file_size,
            block_size:       geometry.map_or(0, |g| g.block_size),
            source_blocks:    geometry.map_or(0, |g| g.source_blocks),
            frames_received:  self.frames_received,
            frames_processed: self.frames_processed,
            frames_dropped:   self.frames_dropped,
            frames_redundant: redundant,
            bytes_received:   self.bytes_received,
            code_rate,
            resolved,
            complete:         self.is_complete(),
            output_blake3,
        }
    }
}
