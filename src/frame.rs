//! Wire framing for received encoded blocks.
//!
//! ```text
//! offset  size        field
//! 0       4           file_size   (u32 BE)  total source bytes
//! 4       4           block_size  (u32 BE)  payload bytes per block
//! 8       4           degree      (u32 BE)  number of source ids
//! 12      4 * degree  ids         (u32 BE each)
//! ..      block_size  payload
//! ```
//!
//! All fields are network byte order.  A stream is a plain concatenation of
//! frames with no outer header.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use thiserror::Error;

use crate::graph::SourceBlockId;

pub const FRAME_HEADER_SIZE: usize = 12;
/// Upper bounds on `degree` and `block_size`, so a corrupt header cannot
/// force a huge allocation.
pub const MAX_DEGREE: u32 = 1 << 20;
pub const MAX_BLOCK_SIZE: u32 = 1 << 26;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Stream ended in the middle of a frame")]
    Truncated,
    #[error("Frame declares a zero block size")]
    ZeroBlockSize,
    #[error("Frame block size {0} exceeds the maximum of 64 MiB")]
    BlockSizeTooLarge(u32),
    #[error("Frame carries no source block ids")]
    EmptyDependencies,
    #[error("Frame degree {0} exceeds the maximum of 2^20")]
    DegreeTooLarge(u32),
    #[error("Frame lists {got} ids but the header declares {declared}")]
    DegreeMismatch { declared: u32, got: usize },
    #[error("Payload is {got} bytes but the header declares {declared}")]
    PayloadSize { declared: u32, got: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub file_size:  u32,
    pub block_size: u32,
    pub degree:     u32,
}

impl FrameHeader {
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<BigEndian>(self.file_size)?;
        writer.write_u32::<BigEndian>(self.block_size)?;
        writer.write_u32::<BigEndian>(self.degree)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        Ok(Self {
            file_size:  reader.read_u32::<BigEndian>()?,
            block_size: reader.read_u32::<BigEndian>()?,
            degree:     reader.read_u32::<BigEndian>()?,
        })
    }

    /// Number of source blocks implied by this header: `ceil(file_size / block_size)`.
    pub fn source_blocks(&self) -> u32 {
        if self.block_size == 0 {
            return 0;
        }
        self.file_size.div_ceil(self.block_size)
    }

    fn validate(&self) -> Result<(), FrameError> {
        if self.block_size == 0 {
            return Err(FrameError::ZeroBlockSize);
        }
        if self.block_size > MAX_BLOCK_SIZE {
            return Err(FrameError::BlockSizeTooLarge(self.block_size));
        }
        if self.degree == 0 {
            return Err(FrameError::EmptyDependencies);
        }
        if self.degree > MAX_DEGREE {
            return Err(FrameError::DegreeTooLarge(self.degree));
        }
        Ok(())
    }
}

/// One received encoded block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header:       FrameHeader,
    pub dependencies: Vec<SourceBlockId>,
    pub payload:      Vec<u8>,
}

impl Frame {
    pub fn new(file_size: u32, dependencies: Vec<SourceBlockId>, payload: Vec<u8>) -> Self {
        let header = FrameHeader {
            file_size,
            block_size: payload.len() as u32,
            degree:     dependencies.len() as u32,
        };
        Self { header, dependencies, payload }
    }

    /// Size of this frame on the wire.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + 4 * self.dependencies.len() + self.payload.len()
    }
}

/// Read the next frame.  Returns `Ok(None)` on a clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Frame>, FrameError> {
    let mut hdr_buf = [0u8; FRAME_HEADER_SIZE];
    let got = read_up_to(reader, &mut hdr_buf)?;
    if got == 0 {
        return Ok(None);
    }
    if got < FRAME_HEADER_SIZE {
        return Err(FrameError::Truncated);
    }
    let header = FrameHeader::read(&hdr_buf[..])?;
    header.validate()?;

    let mut dependencies = Vec::with_capacity(header.degree as usize);
    for _ in 0..header.degree {
        dependencies.push(reader.read_u32::<BigEndian>().map_err(truncated)?);
    }
    let mut payload = vec![0u8; header.block_size as usize];
    reader.read_exact(&mut payload).map_err(truncated)?;

    Ok(Some(Frame { header, dependencies, payload }))
}

/// Write `frame`, checking that its header agrees with its contents.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), FrameError> {
    frame.header.validate()?;
    if frame.header.degree as usize != frame.dependencies.len() {
        return Err(FrameError::DegreeMismatch {
            declared: frame.header.degree,
            got:      frame.dependencies.len(),
        });
    }
    if frame.header.block_size as usize != frame.payload.len() {
        return Err(FrameError::PayloadSize {
            declared: frame.header.block_size,
            got:      frame.payload.len(),
        });
    }
    frame.header.write(&mut *writer)?;
    for &id in &frame.dependencies {
        writer.write_u32::<BigEndian>(id)?;
    }
    writer.write_all(&frame.payload)?;
    Ok(())
}

/// Iterator over every frame in a stream.  Stops after the first error.
pub struct FrameReader<R: Read> {
    inner:  R,
    failed: bool,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, failed: false }
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = Result<Frame, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match read_frame(&mut self.inner) {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None)        => None,
            Err(e)          => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0)  => break,
            Ok(n)  => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn truncated(e: io::Error) -> FrameError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FrameError::Truncated
    } else {
        FrameError::Io(e)
    }
}
