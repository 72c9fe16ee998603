//! ICY metadata encoder
//!
//! Builds in-band `StreamTitle` blocks and interleaves them into a
//! listener's audio stream every `icy-metaint` bytes.

use bytes::BytesMut;

/// Size of one ICY metadata block unit
pub const BLOCK_UNIT: usize = 16;

/// Longest payload the single length byte can describe
pub const MAX_PAYLOAD_LEN: usize = 255 * BLOCK_UNIT;

const TITLE_PREFIX: &str = "StreamTitle='";
const TITLE_SUFFIX: &str = "';";

/// Build the `StreamTitle='...';` payload.
///
/// The title is inserted verbatim. Quotes are not escaped, which is what
/// SHOUTcast servers and players expect on the wire. Titles too long for a
/// single block are cut at a character boundary.
pub fn stream_title_payload(title: &str) -> String {
    let room = MAX_PAYLOAD_LEN - TITLE_PREFIX.len() - TITLE_SUFFIX.len();
    let mut end = title.len().min(room);
    while !title.is_char_boundary(end) {
        end -= 1;
    }
    format!("{TITLE_PREFIX}{}{TITLE_SUFFIX}", &title[..end])
}

/// Encode a payload as a length byte followed by zero-padded 16-byte units.
pub fn encode_block(payload: &str) -> Vec<u8> {
    let bytes = &payload.as_bytes()[..payload.len().min(MAX_PAYLOAD_LEN)];
    let units = bytes.len().div_ceil(BLOCK_UNIT);

    let mut block = Vec::with_capacity(1 + units * BLOCK_UNIT);
    block.push(units as u8);
    block.extend_from_slice(bytes);
    block.resize(1 + units * BLOCK_UNIT, 0);
    block
}

/// Per-listener metadata block producer with duplicate suppression
#[derive(Debug, Default)]
pub struct MetadataEncoder {
    last_payload: Option<String>,
}

impl MetadataEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next block for `title`: a full block when it changed since the last
    /// call, otherwise the single zero byte meaning "no change".
    pub fn next_block(&mut self, title: &str) -> Vec<u8> {
        let payload = stream_title_payload(title);
        if self.last_payload.as_deref() == Some(payload.as_str()) {
            return vec![0];
        }
        let block = encode_block(&payload);
        self.last_payload = Some(payload);
        block
    }

    /// Payload of the last full block sent
    pub fn last_payload(&self) -> Option<&str> {
        self.last_payload.as_deref()
    }
}

/// Injects metadata blocks into an outgoing audio stream.
///
/// Never lets more than `interval` audio bytes pass between two blocks.
#[derive(Debug)]
pub struct Interleaver {
    interval: Option<usize>,
    audio_bytes: u64,
    blocks_sent: u64,
    encoder: MetadataEncoder,
}

impl Interleaver {
    /// `interval` is `None` for listeners that did not ask for metadata
    pub fn new(interval: Option<usize>) -> Self {
        Self {
            interval: interval.filter(|i| *i > 0),
            audio_bytes: 0,
            blocks_sent: 0,
            encoder: MetadataEncoder::new(),
        }
    }

    /// Append `audio` to `out`, inserting a metadata block for `title`
    /// each time an interval boundary is reached.
    pub fn write(&mut self, audio: &[u8], title: &str, out: &mut BytesMut) {
        let Some(interval) = self.interval else {
            out.extend_from_slice(audio);
            self.audio_bytes += audio.len() as u64;
            return;
        };

        let mut rest = audio;
        while !rest.is_empty() {
            let before_boundary = interval - (self.audio_bytes % interval as u64) as usize;
            if rest.len() < before_boundary {
                out.extend_from_slice(rest);
                self.audio_bytes += rest.len() as u64;
                return;
            }

            out.extend_from_slice(&rest[..before_boundary]);
            self.audio_bytes += before_boundary as u64;
            out.extend_from_slice(&self.encoder.next_block(title));
            self.blocks_sent += 1;
            rest = &rest[before_boundary..];
        }
    }

    pub fn interval(&self) -> Option<usize> {
        self.interval
    }

    /// Audio bytes written so far, metadata excluded
    pub fn audio_bytes(&self) -> u64 {
        self.audio_bytes
    }

    /// Audio bytes written since the last metadata boundary
    pub fn bytes_since_metadata(&self) -> usize {
        match self.interval {
            Some(interval) => (self.audio_bytes % interval as u64) as usize,
            None => self.audio_bytes as usize,
        }
    }

    pub fn blocks_sent(&self) -> u64 {
        self.blocks_sent
    }
}
