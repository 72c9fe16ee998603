//! Wire-level constants and shared data types
//!
//! Covers the three text protocols the server speaks: the SHOUTcast source
//! login, the ICY listener handshake and the outbound relay request.

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Status line for a successful ICY response
pub const ICY_OK: &str = "ICY 200 OK";

/// Reply sent to a source after its password was accepted
pub const SOURCE_ACK: &[u8] = b"OK2\r\nicy-caps:11\r\n\r\n";

/// Longest password or header line accepted before the peer is dropped
pub const MAX_LINE_LEN: usize = 4096;

/// Longest listener request head accepted
pub const MAX_REQUEST_LEN: usize = 8192;

/// Stream-wide metadata shown to listeners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub song_title: String,
    pub station_name: String,
    pub station_url: String,
    pub station_genre: String,
    pub bitrate_kbps: u32,
}

impl Default for StreamMetadata {
    fn default() -> Self {
        Self {
            song_title: String::new(),
            station_name: "N/A".to_string(),
            station_url: "http://www.example.com".to_string(),
            station_genre: "Various".to_string(),
            bitrate_kbps: 0,
        }
    }
}

/// Station fields a source may set through its headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationField {
    Name,
    Url,
    Genre,
    Bitrate,
}

impl StationField {
    /// Map a source header name to the field it sets
    pub fn from_header(key: &str) -> Option<Self> {
        match key.to_ascii_lowercase().as_str() {
            "icy-name" => Some(Self::Name),
            "icy-url" => Some(Self::Url),
            "icy-genre" => Some(Self::Genre),
            "icy-br" => Some(Self::Bitrate),
            _ => None,
        }
    }
}

/// How the active audio feed reaches the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Inbound,
    Relay,
}

/// Public view of the active source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub kind: SourceKind,
    /// Remote address of the encoder, or the upstream `host:port`
    pub address: String,
    pub connected_at: DateTime<Utc>,
}

impl SourceInfo {
    /// Seconds since the source connected
    pub fn age_secs(&self) -> i64 {
        (Utc::now() - self.connected_at).num_seconds()
    }
}

/// Public view of one listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub remote_ip: String,
    pub user_agent: Option<String>,
    pub bytes_sent: u64,
    pub wants_metadata: bool,
    pub connected_at: DateTime<Utc>,
}

/// Accumulates raw bytes and yields `\n`-terminated lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete line, trimmed of surrounding whitespace.
    ///
    /// Fails once more than [`MAX_LINE_LEN`] bytes are pending without a
    /// line terminator.
    pub fn next_line(&mut self) -> Result<Option<String>, ProtocolError> {
        match self.buf.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                let line = self.buf.split_to(pos + 1);
                Ok(Some(String::from_utf8_lossy(&line).trim().to_string()))
            }
            None if self.buf.len() > MAX_LINE_LEN => {
                Err(ProtocolError::LineTooLong { limit: MAX_LINE_LEN })
            }
            None => Ok(None),
        }
    }

    /// Remove and return everything buffered
    pub fn take(&mut self) -> BytesMut {
        self.buf.split()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Split a `key: value` header line. Everything after the first colon is
/// the value, so URLs survive intact. A line without a colon is a key with
/// an empty value.
pub fn split_header_line(line: &str) -> Result<(String, String), ProtocolError> {
    let (key, value) = line.split_once(':').unwrap_or((line, ""));
    let key = key.trim();
    if key.is_empty() {
        return Err(ProtocolError::InvalidHeader(line.to_string()));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

/// Request line and headers sent by a listener
#[derive(Debug, Clone)]
pub struct PlaybackRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl PlaybackRequest {
    /// Parse a request head (everything before the blank line)
    pub fn parse(head: &str) -> Result<Self, ProtocolError> {
        let mut lines = head.lines().map(str::trim).filter(|l| !l.is_empty());

        let request_line = lines
            .next()
            .ok_or_else(|| ProtocolError::MalformedRequest("empty request".to_string()))?;
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
            return Err(ProtocolError::MalformedRequest(request_line.to_string()));
        };

        let headers = lines
            .map(split_header_line)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            headers,
        })
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn wants_metadata(&self) -> bool {
        self.header("icy-metadata") == Some("1")
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }

    /// Only `/` and `/;` start a stream
    pub fn is_stream_request(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET") && matches!(self.path.as_str(), "/" | "/;")
    }
}

/// ICY response head for a listener
pub fn icy_response_head(metadata: &StreamMetadata, meta_interval: Option<usize>) -> String {
    let mut head = format!(
        "{ICY_OK}\r\nicy-name: {}\r\nicy-url: {}\r\nicy-genre: {}\r\ncontent-type: audio/mpeg\r\n",
        metadata.station_name, metadata.station_url, metadata.station_genre
    );
    if let Some(interval) = meta_interval {
        head.push_str(&format!("icy-metaint: {interval}\r\n"));
    }
    head.push_str("\r\n");
    head
}

/// Request sent to an upstream ICY server
pub fn relay_request(path: &str, host: &str, user_agent: &str) -> String {
    format!(
        "GET {path} HTTP/1.0\r\nIcy-MetaData: 1\r\nUser-Agent: {user_agent}\r\nHost: {host}\r\n\r\n"
    )
}
