//! Admin HTTP surface

pub mod server;
pub mod handlers;

pub use server::AdminServer;
