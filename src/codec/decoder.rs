//! ICY metadata decoder
//!
//! Removes metadata blocks from an upstream server's interleaved stream,
//! reassembling blocks that arrive split over several reads.

use bytes::BytesMut;

use crate::codec::encoder::BLOCK_UNIT;

/// Outcome of one extraction pass
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Extraction {
    /// Non-empty metadata payloads removed from the buffer, in stream order
    pub payloads: Vec<String>,
    /// A block is only partially buffered. No audio may be taken from the
    /// buffer until more data arrives.
    pub need_more: bool,
}

/// Result of removing at most one metadata block
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// A block was removed; `None` when it was empty
    Block(Option<String>),
    /// The next block is only partially buffered
    Incomplete,
    /// The buffer ends before the next block
    Pending,
}

/// De-interleaver for a stream negotiated with `icy-metaint`
#[derive(Debug)]
pub struct MetadataDecoder {
    interval: usize,
    /// Offset into the receive buffer of the next length byte
    until_metadata: usize,
}

impl MetadataDecoder {
    /// An `interval` of zero disables de-interleaving
    pub fn new(interval: usize) -> Self {
        Self {
            interval,
            until_metadata: interval,
        }
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    /// Offset into the receive buffer of the next metadata block, `None`
    /// when de-interleaving is disabled
    pub fn boundary(&self) -> Option<usize> {
        (self.interval > 0).then_some(self.until_metadata)
    }

    /// Strip every complete metadata block out of `buf`.
    pub fn extract(&mut self, buf: &mut BytesMut) -> Extraction {
        let mut extraction = Extraction::default();
        loop {
            match self.extract_next(buf) {
                Step::Block(Some(payload)) => extraction.payloads.push(payload),
                Step::Block(None) => {}
                Step::Incomplete => {
                    extraction.need_more = true;
                    return extraction;
                }
                Step::Pending => return extraction,
            }
        }
    }

    /// Remove the block at [`boundary`](Self::boundary) if it is fully buffered.
    pub fn extract_next(&mut self, buf: &mut BytesMut) -> Step {
        if self.interval == 0 {
            return Step::Pending;
        }

        let pos = self.until_metadata;
        if buf.len() < pos {
            return Step::Pending;
        }
        if buf.len() == pos {
            return Step::Incomplete;
        }

        let len = buf[pos] as usize * BLOCK_UNIT;
        if pos + 1 + len > buf.len() {
            return Step::Incomplete;
        }

        let mut tail = buf.split_off(pos);
        let block = tail.split_to(1 + len);
        buf.extend_from_slice(&tail);
        self.until_metadata = pos + self.interval;

        if len == 0 {
            return Step::Block(None);
        }
        let raw = &block[1..];
        let trimmed = &raw[..raw.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1)];
        Step::Block(Some(String::from_utf8_lossy(trimmed).into_owned()))
    }

    /// Record that `n` audio bytes were taken from the front of the buffer
    pub fn consume(&mut self, n: usize) {
        if self.interval == 0 {
            return;
        }
        debug_assert!(n <= self.until_metadata, "audio consumed past a metadata block");
        self.until_metadata = self.until_metadata.saturating_sub(n);
    }
}

/// Extract the title from a `StreamTitle='...';` payload.
///
/// Titles are not escaped, so the closing `';` is the first one followed by
/// the end of the payload or by another `Key='` field such as `StreamUrl`.
pub fn parse_stream_title(payload: &str) -> Option<String> {
    let rest = payload.strip_prefix("StreamTitle='")?;

    let mut search = 0;
    while let Some(found) = rest[search..].find("';") {
        let end = search + found;
        let after = &rest[end + 2..];
        if after.is_empty() || starts_with_field(after) {
            return Some(rest[..end].to_string());
        }
        search = end + 1;
    }
    None
}

fn starts_with_field(s: &str) -> bool {
    match s.find("='") {
        Some(eq) => eq > 0 && s[..eq].bytes().all(|b| b.is_ascii_alphanumeric()),
        None => false,
    }
}

/// Decode a standalone block (length byte included) into its title.
pub fn decode_block(block: &[u8]) -> Option<String> {
    let (&units, rest) = block.split_first()?;
    let payload = rest.get(..units as usize * BLOCK_UNIT)?;
    let end = payload.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    let text = std::str::from_utf8(&payload[..end]).ok()?;
    parse_stream_title(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encoder::{encode_block, stream_title_payload, MetadataEncoder};

    fn block_for(title: &str) -> Vec<u8> {
        encode_block(&stream_title_payload(title))
    }

    #[test]
    fn test_round_trip_titles() {
        for title in ["", "Plain Song", "It's a 'quoted' title", "Sigur Rós – Hoppípolla", "日本語のタイトル"] {
            assert_eq!(decode_block(&block_for(title)).as_deref(), Some(title));
        }
    }

    #[test]
    fn test_no_change_block_decodes_to_nothing() {
        let mut encoder = MetadataEncoder::new();
        encoder.next_block("Song");
        let second = encoder.next_block("Song");
        assert_eq!(second, vec![0]);
        assert_eq!(decode_block(&second), None);
    }

    #[test]
    fn test_parse_with_trailing_fields() {
        assert_eq!(
            parse_stream_title("StreamTitle='Band - Track';StreamUrl='http://x/y';").as_deref(),
            Some("Band - Track")
        );
        assert_eq!(
            parse_stream_title("StreamTitle='Don';t stop';").as_deref(),
            Some("Don';t stop")
        );
        assert_eq!(parse_stream_title("StreamUrl='x';"), None);
        assert_eq!(parse_stream_title("StreamTitle='unterminated"), None);
    }

    #[test]
    fn test_disabled_interval_is_noop() {
        let mut decoder = MetadataDecoder::new(0);
        let mut buf = BytesMut::from(&[1u8; 500][..]);
        assert_eq!(decoder.extract(&mut buf), Extraction::default());
        assert_eq!(decoder.boundary(), None);
        assert_eq!(buf.len(), 500);
    }

    #[test]
    fn test_extract_single_block() {
        let mut decoder = MetadataDecoder::new(10);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[1u8; 10]);
        buf.extend_from_slice(&block_for("Hello"));
        buf.extend_from_slice(&[2u8; 4]);

        let extraction = decoder.extract(&mut buf);

        assert_eq!(extraction.payloads, vec!["StreamTitle='Hello';".to_string()]);
        assert!(!extraction.need_more);
        assert_eq!(buf.as_ref(), [[1u8; 10].as_slice(), &[2u8; 4]].concat().as_slice());
    }

    #[test]
    fn test_length_byte_not_yet_received() {
        let mut decoder = MetadataDecoder::new(10);
        let mut buf = BytesMut::from(&[1u8; 10][..]);

        let extraction = decoder.extract(&mut buf);
        assert!(extraction.need_more);
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn test_block_split_across_reads() {
        let mut decoder = MetadataDecoder::new(8);
        let block = block_for("Split");
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[1u8; 8]);
        buf.extend_from_slice(&block[..5]);

        let first = decoder.extract(&mut buf);
        assert!(first.need_more);
        assert!(first.payloads.is_empty());
        assert_eq!(buf.len(), 13);

        buf.extend_from_slice(&block[5..]);
        buf.extend_from_slice(&[3u8; 2]);
        let second = decoder.extract(&mut buf);
        assert!(!second.need_more);
        assert_eq!(second.payloads, vec!["StreamTitle='Split';".to_string()]);
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn test_multiple_blocks_in_one_buffer() {
        let mut decoder = MetadataDecoder::new(4);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[1u8; 4]);
        buf.extend_from_slice(&block_for("One"));
        buf.extend_from_slice(&[2u8; 4]);
        buf.extend_from_slice(&[0]);
        buf.extend_from_slice(&[3u8; 4]);
        buf.extend_from_slice(&block_for("Two"));
        buf.extend_from_slice(&[4u8; 1]);

        let extraction = decoder.extract(&mut buf);

        assert_eq!(extraction.payloads.len(), 2);
        assert!(extraction.payloads[1].contains("Two"));
        assert_eq!(buf.len(), 13);
        assert_eq!(decoder.boundary(), Some(16));
    }

    #[test]
    fn test_extract_next_one_block_at_a_time() {
        let mut decoder = MetadataDecoder::new(4);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[1u8; 4]);
        buf.extend_from_slice(&block_for("One"));
        buf.extend_from_slice(&[2u8; 4]);
        buf.extend_from_slice(&[0]);
        buf.extend_from_slice(&[3u8; 2]);

        assert_eq!(
            decoder.extract_next(&mut buf),
            Step::Block(Some("StreamTitle='One';".to_string()))
        );
        assert_eq!(buf.len(), 11);
        assert_eq!(decoder.extract_next(&mut buf), Step::Block(None));
        assert_eq!(decoder.extract_next(&mut buf), Step::Pending);
        assert_eq!(buf.len(), 10);

        buf.extend_from_slice(&[3u8; 2]);
        assert_eq!(decoder.extract_next(&mut buf), Step::Incomplete);
    }

    #[test]
    fn test_consume_moves_boundary() {
        let mut decoder = MetadataDecoder::new(10);
        let mut buf = BytesMut::from(&[1u8; 6][..]);
        assert!(!decoder.extract(&mut buf).need_more);

        let _ = buf.split_to(6);
        decoder.consume(6);
        assert_eq!(decoder.boundary(), Some(4));

        buf.extend_from_slice(&[1u8; 4]);
        buf.extend_from_slice(&block_for("Next"));
        let extraction = decoder.extract(&mut buf);
        assert_eq!(extraction.payloads, vec!["StreamTitle='Next';".to_string()]);
        assert_eq!(buf.len(), 4);
    }
}
