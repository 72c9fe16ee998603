//! Server bootstrap
//!
//! Binds every socket up front so configuration mistakes surface before
//! anything is spawned, then runs the stream core with its listeners.

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::auth::SharedHooks;
use crate::config::{AppConfig, RelayConfig};
use crate::error::{NetworkError, Result};
use crate::network::{PlaybackListener, RelayClient, RelayHandle, SourceListener};
use crate::stream::{StreamCore, StreamHandle};
use crate::ui::AdminServer;

async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|source| {
        NetworkError::BindFailed {
            addr: addr.to_string(),
            source,
        }
        .into()
    })
}

/// Where the audio comes from
enum Feed {
    Source(SourceListener),
    Relay(RelayConfig),
}

/// A fully bound server, ready to run
pub struct Server {
    core: StreamCore,
    stream: StreamHandle,
    playback: PlaybackListener,
    feed: Feed,
    admin: Option<(AdminServer, TcpListener)>,
    playback_addr: SocketAddr,
    source_addr: Option<SocketAddr>,
    admin_addr: Option<SocketAddr>,
}

impl Server {
    /// Bind all sockets described by `config`
    pub async fn bind(config: &AppConfig, hooks: SharedHooks) -> Result<Self> {
        config.validate()?;
        let (core, stream) = StreamCore::new(&config.stream, hooks.clone());

        let playback_socket = bind(config.network.playback_addr()?).await?;
        let playback_addr = playback_socket.local_addr()?;
        let playback = PlaybackListener::new(playback_socket, stream.clone(), config.stream.meta_interval);

        let (feed, source_addr) = match config.relay() {
            Some(relay) => (Feed::Relay(relay.clone()), None),
            None => {
                let socket = bind(config.network.source_addr()?).await?;
                let addr = socket.local_addr()?;
                let listener = SourceListener::new(socket, hooks.clone(), stream.sender());
                (Feed::Source(listener), Some(addr))
            }
        };

        let (admin, admin_addr) = if config.admin.enabled {
            let server = AdminServer::new(config.admin.clone(), stream.clone(), hooks);
            let socket = server.bind().await?;
            let addr = socket.local_addr()?;
            (Some((server, socket)), Some(addr))
        } else {
            (None, None)
        };

        Ok(Self {
            core,
            stream,
            playback,
            feed,
            admin,
            playback_addr,
            source_addr,
            admin_addr,
        })
    }

    pub fn playback_addr(&self) -> SocketAddr {
        self.playback_addr
    }

    /// Source port, absent in relay mode
    pub fn source_addr(&self) -> Option<SocketAddr> {
        self.source_addr
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_addr
    }

    pub fn stream(&self) -> StreamHandle {
        self.stream.clone()
    }

    /// Start everything. Dropping the returned handle stops the server.
    pub fn start(self) -> RunningServer {
        let mut tasks = Vec::new();

        let relay = match self.feed {
            Feed::Source(listener) => {
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = listener.run().await {
                        error!("Source listener failed: {}", e);
                    }
                }));
                None
            }
            Feed::Relay(config) => {
                info!("Relaying http://{}:{}{}", config.host, config.port, config.path);
                let (client, handle) = RelayClient::new(config, self.stream.sender());
                tasks.push(tokio::spawn(client.run()));
                Some(handle)
            }
        };

        let playback = self.playback;
        tasks.push(tokio::spawn(async move {
            if let Err(e) = playback.run().await {
                error!("Playback listener failed: {}", e);
            }
        }));

        if let Some((admin, socket)) = self.admin {
            tasks.push(tokio::spawn(async move {
                if let Err(e) = admin.run(socket).await {
                    error!("Admin server failed: {}", e);
                }
            }));
        }

        RunningServer {
            core: tokio::spawn(self.core.run()),
            tasks,
            stream: self.stream,
            relay,
        }
    }
}

/// Tasks of a started [`Server`]
pub struct RunningServer {
    core: tokio::task::JoinHandle<Result<()>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    stream: StreamHandle,
    /// Dropping the handle stops the relay
    relay: Option<RelayHandle>,
}

impl RunningServer {
    pub fn stream(&self) -> StreamHandle {
        self.stream.clone()
    }

    /// Control handle of the relay, when relaying
    pub fn relay(&self) -> Option<&RelayHandle> {
        self.relay.as_ref()
    }

    /// Wait for the stream core to stop, which only happens on a fatal
    /// backlog error
    pub async fn wait(&mut self) -> Result<()> {
        match (&mut self.core).await {
            Ok(result) => result,
            Err(e) => {
                error!("Stream core panicked: {}", e);
                Err(NetworkError::Closed.into())
            }
        }
    }

    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
        self.core.abort();
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
