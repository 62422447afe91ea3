//! Listener bootstrap: builds the routing tables, binds every configured port
//! and runs one accept loop per server.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{net::TcpListener, task::JoinSet, time::sleep};
use tracing::{info, warn};

use crate::{
    broker::{Broker, ConnectionId},
    config::{Config, ProxyConfig},
    link,
    location::LocationTable,
    upstream::RoutingContext,
    ProxyError, Result,
};

/// Pause after an accept error that is not tied to a single connection, such
/// as running out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long to wait before accepting again after `e`.
fn accept_backoff(e: &io::Error) -> Option<Duration> {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted => None,
        _ => Some(ACCEPT_BACKOFF),
    }
}

/// Everything a connection accepted by one server needs.
#[derive(Debug)]
pub struct ServerContext {
    pub name: String,
    pub proxy: ProxyConfig,
    pub routing: Arc<RoutingContext>,
    pub locations: LocationTable,
    pub broker: Arc<Broker>,
}

#[derive(Debug)]
pub struct ProxyServer {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
}

impl ProxyServer {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Accepts until the task is dropped; accept errors never end the loop.
    async fn serve(self) -> Result<()> {
        loop {
            let (socket, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept on {} failed: {}", self.ctx.name, e);
                    if let Some(pause) = accept_backoff(&e) {
                        sleep(pause).await;
                    }
                    continue;
                }
            };
            let id = ConnectionId::next();
            info!("Accepted connection {} from {} on {}", id, peer, self.ctx.name);
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                if let Err(e) = link::serve(id, socket, peer, ctx).await {
                    warn!("Connection {} from {} ended with error: {}", id, peer, e);
                }
            });
        }
    }
}

/// All servers of one configuration, bound and ready to accept.
#[derive(Debug)]
pub struct Proxy {
    servers: Vec<ProxyServer>,
    routing: Arc<RoutingContext>,
    broker: Arc<Broker>,
}

impl Proxy {
    /// Builds the upstream registry and every location table first, so a bad
    /// configuration fails before any port is bound. Any bind failure aborts.
    pub async fn bind(config: &Config) -> Result<Self> {
        let routing = Arc::new(RoutingContext::from_config(config)?);
        let broker = Arc::new(Broker::new(
            config.proxy.connect_timeout(),
            config.proxy.max_content_length,
        ));

        let mut contexts = Vec::with_capacity(config.servers.len());
        for server in &config.servers {
            let locations =
                LocationTable::build(&server.location, &routing, config.proxy.location_match)?;
            let addr = config.proxy.listen_addr(server.listen);
            let name = server.server_name.clone().unwrap_or_else(|| addr.to_string());
            contexts.push((
                addr,
                Arc::new(ServerContext {
                    name,
                    proxy: config.proxy.clone(),
                    routing: Arc::clone(&routing),
                    locations,
                    broker: Arc::clone(&broker),
                }),
            ));
        }

        let mut servers = Vec::with_capacity(contexts.len());
        for (addr, ctx) in contexts {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| ProxyError::Bind { addr, source })?;
            info!(
                "Listening on {} for {} ({} locations)",
                listener.local_addr()?,
                ctx.name,
                ctx.locations.len()
            );
            servers.push(ProxyServer { listener, ctx });
        }

        Ok(Self {
            servers,
            routing,
            broker,
        })
    }

    /// Bound addresses, in configuration order.
    pub fn local_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.servers.iter().map(ProxyServer::local_addr).collect()
    }

    pub fn servers(&self) -> &[ProxyServer] {
        &self.servers
    }

    pub fn routing(&self) -> &Arc<RoutingContext> {
        &self.routing
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Accepts connections on every server until a server task fails.
    pub async fn run(self) -> Result<()> {
        let mut set = JoinSet::new();
        for server in self.servers {
            set.spawn(server.serve());
        }
        while let Some(joined) = set.join_next().await {
            joined.map_err(io::Error::other)??;
        }
        Ok(())
    }
}
