//! MPEG framing and ICY metadata codec
//!
//! Finds frame boundaries in raw MPEG audio and encodes or strips the
//! in-band `StreamTitle` blocks of the ICY protocol.

pub mod mpeg;
pub mod encoder;
pub mod decoder;

pub use mpeg::{find_frame, parse_header, split_frames, split_frames_before, FrameHeader};
pub use encoder::{Interleaver, MetadataEncoder};
pub use decoder::{parse_stream_title, MetadataDecoder};
