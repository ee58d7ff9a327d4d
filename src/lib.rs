pub mod xor;
pub mod graph;
pub mod decoder;
pub mod frame;
pub mod config;
pub mod session;

pub use graph::SourceBlockId;
pub use decoder::{PeelingDecoder, DecodeError, DecoderStats};
pub use frame::{Frame, FrameHeader, FrameError, FrameReader, read_frame, write_frame};
pub use config::SessionOptions;
pub use session::{DecodeSession, SessionError, TransferStats};
