//! MPEG audio frame scanner
//!
//! Locates frame boundaries in a raw byte stream. Only the 32-bit frame
//! header is interpreted; frame payloads are passed through untouched.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Size of an MPEG audio frame header
pub const HEADER_LEN: usize = 4;

/// Largest frame the tables can produce (MPEG 2.5 Layer 3, 160 kbps, 8 kHz, padded)
pub const MAX_FRAME_LEN: usize = 2881;

/// Sample rates in Hz, indexed by [version][sample-rate code]
const SAMPLE_RATES: [[u32; 3]; 4] = [
    [11025, 12000, 8000], // MPEG 2.5
    [0, 0, 0],            // reserved
    [22050, 24000, 16000], // MPEG 2
    [44100, 48000, 32000], // MPEG 1
];

/// Bit rates in kbps, indexed by [version][layer][bit-rate code]
const BIT_RATES: [[[u16; 16]; 4]; 4] = [
    [
        // MPEG 2.5
        [0; 16],
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0],
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0],
        [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256, 0],
    ],
    // reserved version
    [[0; 16]; 4],
    [
        // MPEG 2
        [0; 16],
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0],
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0],
        [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256, 0],
    ],
    [
        // MPEG 1
        [0; 16],
        [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0],
        [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 0],
        [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448, 0],
    ],
];

/// Layer code for Layer 1 (the codes run backwards: 3 = I, 2 = II, 1 = III)
pub const LAYER_1: u8 = 3;

/// Why a byte window does not hold a usable frame header
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    #[error("Fewer than {HEADER_LEN} bytes available")]
    Truncated,

    #[error("Missing frame sync")]
    NoSync,

    #[error("Reserved MPEG version")]
    ReservedVersion,

    #[error("Reserved layer")]
    ReservedLayer,

    #[error("Unsupported bit rate index {0}")]
    UnsupportedBitRate(u8),

    #[error("Reserved sample rate index")]
    ReservedSampleRate,
}

/// A parsed MPEG audio frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// 2-bit version code (0 = 2.5, 2 = 2, 3 = 1)
    pub version_id: u8,
    /// 2-bit layer code (1 = III, 2 = II, 3 = I)
    pub layer_id: u8,
    /// CRC protection is absent when set
    pub protection_absent: bool,
    pub bit_rate_kbps: u32,
    pub sample_rate_hz: u32,
    pub padding: u8,
    pub channel_mode: u8,
    pub mode_extension: u8,
    pub copyright: bool,
    pub original: bool,
    pub emphasis: u8,
}

impl FrameHeader {
    /// Frame length in bytes, header included
    pub fn frame_len(&self) -> usize {
        let bit_rate = self.bit_rate_kbps * 1000;
        let padding = u32::from(self.padding);
        let len = if self.layer_id == LAYER_1 {
            (12 * bit_rate / self.sample_rate_hz + padding) * 4
        } else {
            144 * bit_rate / self.sample_rate_hz + padding
        };
        len as usize
    }
}

/// Parse the frame header starting at `offset`.
pub fn parse_header(bytes: &[u8], offset: usize) -> Result<FrameHeader, HeaderError> {
    let raw = bytes
        .get(offset..offset + HEADER_LEN)
        .ok_or(HeaderError::Truncated)?;
    let word = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);

    if word >> 21 != 0x7ff {
        return Err(HeaderError::NoSync);
    }

    let version_id = ((word >> 19) & 0b11) as u8;
    let layer_id = ((word >> 17) & 0b11) as u8;
    let protection_absent = (word >> 16) & 1 == 1;
    let bit_rate_index = ((word >> 12) & 0b1111) as u8;
    let sample_rate_index = ((word >> 10) & 0b11) as u8;
    let padding = ((word >> 9) & 1) as u8;
    // bit 8 is the private bit
    let channel_mode = ((word >> 6) & 0b11) as u8;
    let mode_extension = ((word >> 4) & 0b11) as u8;
    let copyright = (word >> 3) & 1 == 1;
    let original = (word >> 2) & 1 == 1;
    let emphasis = (word & 0b11) as u8;

    if version_id == 1 {
        return Err(HeaderError::ReservedVersion);
    }
    if layer_id == 0 {
        return Err(HeaderError::ReservedLayer);
    }

    let bit_rate_kbps =
        BIT_RATES[version_id as usize][layer_id as usize][bit_rate_index as usize];
    if bit_rate_kbps == 0 {
        return Err(HeaderError::UnsupportedBitRate(bit_rate_index));
    }

    let sample_rate_hz = SAMPLE_RATES[version_id as usize]
        .get(sample_rate_index as usize)
        .copied()
        .filter(|rate| *rate != 0)
        .ok_or(HeaderError::ReservedSampleRate)?;

    Ok(FrameHeader {
        version_id,
        layer_id,
        protection_absent,
        bit_rate_kbps: u32::from(bit_rate_kbps),
        sample_rate_hz,
        padding,
        channel_mode,
        mode_extension,
        copyright,
        original,
        emphasis,
    })
}

/// A complete frame located inside a byte window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLocation {
    pub header: FrameHeader,
    /// Offset of the first header byte
    pub start: usize,
    /// Offset one past the last frame byte
    pub end: usize,
}

/// Find the first complete frame in `window`.
///
/// Bytes before the first valid sync are skipped. Returns `None` when no header
/// is found or the frame runs past the end of the window; the caller should
/// wait for more data in both cases.
pub fn find_frame(window: &[u8]) -> Option<FrameLocation> {
    let mut from = 0;
    while from + 1 < window.len() {
        let pos = window[from..]
            .windows(2)
            .position(|pair| pair[0] == 0xff && pair[1] & 0xe0 == 0xe0)?;
        let start = from + pos;

        match parse_header(window, start) {
            Ok(header) => {
                let end = start + header.frame_len();
                return (end <= window.len()).then_some(FrameLocation { header, start, end });
            }
            Err(HeaderError::Truncated) => return None,
            Err(_) => from = start + 1,
        }
    }
    None
}

/// Drain every complete frame from the front of `buf`.
///
/// Returns the frames and the number of bytes removed from `buf`, which
/// includes any garbage skipped ahead of a sync word. An incomplete trailing
/// frame stays in `buf`.
pub fn split_frames(buf: &mut BytesMut) -> (Vec<Bytes>, usize) {
    split_frames_before(buf, usize::MAX)
}

/// Drain the complete frames that end within the first `limit` bytes of `buf`.
pub fn split_frames_before(buf: &mut BytesMut, limit: usize) -> (Vec<Bytes>, usize) {
    let mut frames = Vec::new();
    let mut consumed = 0;

    loop {
        let window = (limit - consumed).min(buf.len());
        let Some(location) = find_frame(&buf[..window]) else {
            break;
        };
        let mut chunk = buf.split_to(location.end);
        frames.push(chunk.split_off(location.start).freeze());
        consumed += location.end;
    }

    (frames, consumed)
}

/// Build a zero-filled frame with the given header fields.
#[cfg(test)]
pub(crate) fn synth_frame(
    version_id: u8,
    layer_id: u8,
    bit_rate_index: u8,
    sample_rate_index: u8,
    padding: u8,
) -> Vec<u8> {
    let header = [
        0xff,
        0xe0 | (version_id << 3) | (layer_id << 1) | 1,
        (bit_rate_index << 4) | (sample_rate_index << 2) | (padding << 1),
        0b0100_0100,
    ];
    let len = parse_header(&header, 0)
        .expect("synthesized header must be valid")
        .frame_len();
    let mut frame = vec![0u8; len];
    frame[..HEADER_LEN].copy_from_slice(&header);
    frame
}

/// MPEG 1 Layer 3, 128 kbps, 48 kHz: 384 bytes
#[cfg(test)]
pub(crate) fn frame_384() -> Vec<u8> {
    synth_frame(3, 1, 9, 1, 0)
}

/// MPEG 1 Layer 3, 96 kbps, 32 kHz: 432 bytes
#[cfg(test)]
pub(crate) fn frame_432() -> Vec<u8> {
    synth_frame(3, 1, 7, 2, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_mpeg1_layer3() {
        let frame = synth_frame(3, 1, 9, 0, 1);
        let header = parse_header(&frame, 0).unwrap();

        assert_eq!(frame[1], 0xfb);
        assert_eq!(header.bit_rate_kbps, 128);
        assert_eq!(header.sample_rate_hz, 44100);
        assert_eq!(header.padding, 1);
        assert_eq!(header.channel_mode, 1);
        assert_eq!(header.frame_len(), 418);
    }

    #[test]
    fn test_layer1_frame_length() {
        // MPEG 1 Layer 1, 384 kbps, 48 kHz, padded
        let frame = synth_frame(3, LAYER_1, 12, 1, 1);
        let header = parse_header(&frame, 0).unwrap();
        assert_eq!(header.frame_len(), (12 * 384_000 / 48_000 + 1) * 4);
    }

    #[test]
    fn test_known_test_frames() {
        assert_eq!(frame_384().len(), 384);
        assert_eq!(frame_432().len(), 432);
    }

    #[test]
    fn test_reject_invalid_headers() {
        assert_eq!(parse_header(&[0xff, 0xfb], 0), Err(HeaderError::Truncated));
        assert_eq!(parse_header(&[0x12, 0x34, 0x56, 0x78], 0), Err(HeaderError::NoSync));
        // reserved version
        assert_eq!(parse_header(&[0xff, 0xeb, 0x90, 0x00], 0), Err(HeaderError::ReservedVersion));
        // reserved layer
        assert_eq!(parse_header(&[0xff, 0xf9, 0x90, 0x00], 0), Err(HeaderError::ReservedLayer));
        // free format and bad bit rate
        assert_eq!(
            parse_header(&[0xff, 0xfb, 0x00, 0x00], 0),
            Err(HeaderError::UnsupportedBitRate(0))
        );
        assert_eq!(
            parse_header(&[0xff, 0xfb, 0xf0, 0x00], 0),
            Err(HeaderError::UnsupportedBitRate(15))
        );
        // reserved sample rate
        assert_eq!(
            parse_header(&[0xff, 0xfb, 0x9c, 0x00], 0),
            Err(HeaderError::ReservedSampleRate)
        );
    }

    #[test]
    fn test_parse_at_offset() {
        let mut data = vec![0x00, 0x11, 0x22];
        data.extend(frame_384());
        assert!(parse_header(&data, 3).is_ok());
        assert!(parse_header(&data, 0).is_err());
    }

    #[test]
    fn test_find_frame_skips_garbage() {
        let mut window = vec![0x01, 0xff, 0x00, 0x42];
        window.extend(frame_384());

        let found = find_frame(&window).unwrap();
        assert_eq!(found.start, 4);
        assert_eq!(found.end, 4 + 384);
    }

    #[test]
    fn test_find_frame_exact_fit() {
        let frame = frame_432();
        let found = find_frame(&frame).unwrap();
        assert_eq!((found.start, found.end), (0, 432));
    }

    #[test]
    fn test_find_frame_incomplete() {
        let frame = frame_384();
        assert!(find_frame(&frame[..383]).is_none());
        assert!(find_frame(&frame[..2]).is_none());
        assert!(find_frame(&[]).is_none());
    }

    #[test]
    fn test_split_frames_keeps_partial_tail() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame_384());
        buf.extend_from_slice(&frame_432());
        buf.extend_from_slice(&frame_384()[..100]);

        let (frames, consumed) = split_frames(&mut buf);

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), 384);
        assert_eq!(frames[1].len(), 432);
        assert_eq!(consumed, 816);
        assert_eq!(buf.len(), 100);
    }

    #[test]
    fn test_split_frames_before_limit() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame_384());
        buf.extend_from_slice(&frame_432());

        // the second frame ends past the limit and stays
        let (frames, consumed) = split_frames_before(&mut buf, 500);
        assert_eq!(frames.len(), 1);
        assert_eq!(consumed, 384);
        assert_eq!(buf.len(), 432);

        let (frames, _) = split_frames_before(&mut buf, 432);
        assert_eq!(frames.len(), 1);
        assert!(buf.is_empty());
    }

    fn valid_header_fields() -> impl Strategy<Value = (u8, u8, u8, u8, u8)> {
        (
            prop_oneof![Just(0u8), Just(2u8), Just(3u8)],
            1u8..=3,
            1u8..=14,
            0u8..=2,
            0u8..=1,
        )
    }

    proptest! {
        #[test]
        fn prop_header_round_trip((version, layer, br, sr, pad) in valid_header_fields()) {
            let mut stream = synth_frame(version, layer, br, sr, pad);
            let first_len = stream.len();
            stream.extend(synth_frame(version, layer, br, sr, pad));

            let header = parse_header(&stream, 0).unwrap();
            prop_assert_eq!(
                header.bit_rate_kbps,
                u32::from(BIT_RATES[version as usize][layer as usize][br as usize])
            );
            prop_assert_eq!(header.sample_rate_hz, SAMPLE_RATES[version as usize][sr as usize]);
            prop_assert_eq!(header.frame_len(), first_len);
            prop_assert!(header.frame_len() <= MAX_FRAME_LEN);

            let next = parse_header(&stream, header.frame_len()).unwrap();
            prop_assert_eq!(next, header);
        }
    }
}
