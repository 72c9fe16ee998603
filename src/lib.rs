//! # ICY Relay
//!
//! Live MPEG audio relay speaking the ICY/SHOUTcast protocol.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────┐        ┌──────────────────────┐
//! │  Encoder (DJ)        │   or   │  Upstream ICY server │
//! │  password + headers  │        │  GET / Icy-MetaData  │
//! └──────────┬───────────┘        └──────────┬───────────┘
//!            │ port + 1                      │ outbound
//!            ▼                               ▼
//! ┌──────────────────────┐        ┌──────────────────────┐
//! │ InboundSource        │        │ RelaySource          │
//! │ (network::inbound)   │        │ (network::relay)     │
//! │                      │        │ strips metadata,     │
//! │ raw audio            │        │ cuts frames          │
//! └──────────┬───────────┘        └──────────┬───────────┘
//!            │         SourceEvent           │
//!            └───────────────┬───────────────┘
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                 StreamCore (stream)                      │
//! │  frame alignment ─► BacklogBuffer (audio::buffer)        │
//! │                  └► BroadcastManager (clients::manager)  │
//! │  station metadata, source registry, admin queries        │
//! └───────────────────────────┬─────────────────────────────┘
//!                             │ per-session bounded queue
//!            ┌────────────────┼────────────────┐
//!            ▼                ▼                ▼
//!     ┌────────────┐   ┌────────────┐   ┌────────────┐
//!     │ Session    │   │ Session    │   │ Session    │
//!     │ Interleaver│   │ Interleaver│   │ (no meta)  │
//!     └─────┬──────┘   └─────┬──────┘   └─────┬──────┘
//!           ▼                ▼                ▼
//!        player           player           player
//! ```

pub mod audio;
pub mod auth;
pub mod clients;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod server;
pub mod stream;
pub mod ui;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default playback port; sources connect on the next one
    pub const DEFAULT_PORT: u16 = 8000;

    /// Default admin API port
    pub const DEFAULT_ADMIN_PORT: u16 = 8080;

    /// Default audio bytes between metadata blocks
    pub const DEFAULT_META_INTERVAL: usize = 8192;

    /// Default backlog capacity in bytes
    pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

    /// Default delay before a dropped relay reconnects
    pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 2;
}
