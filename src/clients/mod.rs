//! Listener sessions and broadcast fan-out

pub mod manager;
pub mod session;

pub use manager::BroadcastManager;
pub use session::{ClientSession, SessionId};
