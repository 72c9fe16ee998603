//! Hooks into the embedding application
//!
//! Authentication and song title filtering are owned by whoever runs the
//! server. Both are asynchronous so an implementation may consult an
//! external service without stalling the connection that asked.

use futures_util::future::{self, BoxFuture, FutureExt};
use std::net::IpAddr;
use std::sync::Arc;

use crate::config::PasswordConfig;

/// Decisions delegated to the embedding application
pub trait ControlHooks: Send + Sync + 'static {
    /// Decide whether `password` grants access. `admin` is set for the
    /// admin surface and clear for sources.
    fn authenticate(&self, ip: Option<IpAddr>, password: String, admin: bool) -> BoxFuture<'static, bool>;

    /// Filter or delay a song title before it is shown to listeners.
    /// The returned title is applied as-is.
    fn update_song_title(&self, candidate: String) -> BoxFuture<'static, String> {
        future::ready(candidate).boxed()
    }
}

pub type SharedHooks = Arc<dyn ControlHooks>;

/// Checks passwords against the configured DJ and admin passwords.
///
/// The admin password also works for sources unless `strict_admin` is set.
#[derive(Debug, Clone)]
pub struct PasswordAuthenticator {
    dj: String,
    admin: String,
    strict_admin: bool,
}

impl PasswordAuthenticator {
    pub fn new(config: &PasswordConfig) -> Self {
        Self {
            dj: config.dj.clone(),
            admin: config.admin.clone(),
            strict_admin: config.strict_admin,
        }
    }

    fn check(&self, password: &str, admin: bool) -> bool {
        if password == self.admin {
            admin || !self.strict_admin
        } else {
            !admin && password == self.dj
        }
    }
}

impl ControlHooks for PasswordAuthenticator {
    fn authenticate(&self, _ip: Option<IpAddr>, password: String, admin: bool) -> BoxFuture<'static, bool> {
        future::ready(self.check(&password, admin)).boxed()
    }
}
