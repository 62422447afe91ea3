//! Per-connection proxy link: resolves a backend on the first request,
//! keeps it for the rest of the connection and answers locally when no
//! backend can be used.

use std::{net::SocketAddr, sync::Arc};

use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt, Stream, StreamExt};
use http::{HeaderValue, StatusCode};
use serde::Deserialize;
use strum::Display;
use tokio::{net::TcpStream, sync::mpsc::UnboundedReceiver};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    broker::{ConnectionId, DownstreamPass, Outbound},
    error::CodecError,
    http::{HttpRequest, HttpResponse, Inbound, ServerCodec, HOST},
    server::ServerContext,
    upstream::{PoolKey, UpstreamServer},
    Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LinkState {
    New,
    RouteResolving,
    Bridging,
    Closed,
}

/// What the client sees when the chosen backend cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ConnectFailurePolicy {
    /// Answer `502 Bad Gateway` and keep the connection for the next request.
    #[default]
    BadGateway,
    /// Close the client connection without a response.
    Close,
}

/// Drops every `Host` field and appends one naming the backend.
pub fn rewrite_request(request: &mut HttpRequest, backend: &UpstreamServer) {
    request.headers.remove(HOST);
    match HeaderValue::from_str(backend.address()) {
        Ok(host) => request.headers.append(HOST, host),
        Err(e) => warn!("Backend address {} is not a valid Host: {}", backend, e),
    }
}

#[derive(Debug)]
pub struct ProxyLink {
    id: ConnectionId,
    peer: SocketAddr,
    created_at: DateTime<Utc>,
    state: LinkState,
    backend: Option<UpstreamServer>,
    pool_key: Option<PoolKey>,
    pass: DownstreamPass,
    ctx: Arc<ServerContext>,
}

impl ProxyLink {
    pub fn new(
        id: ConnectionId,
        peer: SocketAddr,
        pass: DownstreamPass,
        ctx: Arc<ServerContext>,
    ) -> Self {
        Self {
            id,
            peer,
            created_at: Utc::now(),
            state: LinkState::New,
            backend: None,
            pool_key: None,
            pass,
            ctx,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    async fn run<S>(&mut self, requests: &mut S) -> Result<()>
    where
        S: Stream<Item = std::result::Result<Inbound, CodecError>> + Unpin,
    {
        while let Some(inbound) = requests.next().await {
            let request = match inbound {
                Ok(Inbound::Request(request)) => request,
                Ok(Inbound::Continue) => {
                    self.pass.forward(HttpResponse::new(StatusCode::CONTINUE));
                    self.pass.flush();
                    continue;
                }
                Err(CodecError::TooLarge { limit }) => {
                    warn!("Request body from {} exceeds {} bytes", self.peer, limit);
                    self.reply(StatusCode::PAYLOAD_TOO_LARGE);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            if !self.handle(request).await? {
                break;
            }
        }
        Ok(())
    }

    /// Routes one complete request. Returns false when the connection should
    /// be closed.
    async fn handle(&mut self, mut request: HttpRequest) -> Result<bool> {
        let mut fresh = false;
        loop {
            if let (LinkState::Bridging, Some(backend)) = (self.state, self.backend.clone()) {
                rewrite_request(&mut request, &backend);
                match self.ctx.broker.forward(self.id, request) {
                    Ok(()) => return Ok(true),
                    Err(returned) if fresh => {
                        drop(returned);
                        warn!("Upstream {} closed before the first request", backend);
                        self.invalidate();
                        self.reply(StatusCode::BAD_GATEWAY);
                        return Ok(true);
                    }
                    Err(returned) => {
                        debug!("Upstream {} is gone, resolving again", backend);
                        self.invalidate();
                        request = returned;
                    }
                }
            }

            self.state = LinkState::RouteResolving;
            let path = request.path();
            let rule = match self.ctx.locations.resolve(&path) {
                Ok(rule) => rule,
                Err(e) => {
                    debug!("{}", e);
                    self.reply(StatusCode::NOT_FOUND);
                    self.state = LinkState::New;
                    return Ok(true);
                }
            };
            let pool_key = rule.pool_key().clone();
            let backend = self.ctx.routing.next(&pool_key).inspect_err(|e| {
                error!("Location {} points at a missing pool: {}", rule.prefix(), e);
            })?;

            match self.ctx.broker.connect(self.id, &backend).await {
                Ok(upstream) => {
                    debug!("{} -> pool {} -> {} (upstream {})", path, pool_key, backend, upstream);
                    self.state = LinkState::Bridging;
                    self.backend = Some(backend);
                    self.pool_key = Some(pool_key);
                    fresh = true;
                }
                Err(e) => {
                    warn!("Failed to reach {} for {}: {}", backend, path, e);
                    self.invalidate();
                    return Ok(match self.ctx.proxy.connect_failure {
                        ConnectFailurePolicy::BadGateway => {
                            self.reply(StatusCode::BAD_GATEWAY);
                            true
                        }
                        ConnectFailurePolicy::Close => false,
                    });
                }
            }
        }
    }

    fn invalidate(&mut self) {
        self.ctx.broker.release_upstream(self.id);
        self.backend = None;
        self.pool_key = None;
        self.state = LinkState::New;
    }

    fn reply(&self, status: StatusCode) {
        self.pass.forward(HttpResponse::empty(status));
        self.pass.flush();
    }

    fn close(&mut self) {
        self.ctx.broker.close_downstream(self.id);
        self.pass.close();
        self.state = LinkState::Closed;
        let lifetime = Utc::now() - self.created_at;
        info!(
            "Closed connection from {} after {}ms (pool {})",
            self.peer,
            lifetime.num_milliseconds(),
            self.pool_key.as_ref().map_or("-", PoolKey::as_str)
        );
    }
}

/// Serves one accepted client connection until it closes.
#[instrument(name = "link", skip_all, fields(%id, %peer))]
pub async fn serve(
    id: ConnectionId,
    socket: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
) -> Result<()> {
    let codec = ServerCodec::new(ctx.proxy.max_content_length, ctx.proxy.compression.clone());
    let (sink, mut requests) = Framed::new(socket, codec).split();

    let (pass, outbound) = DownstreamPass::new(id);
    ctx.broker.register_downstream(pass.clone());
    let writer = tokio::spawn(write_downstream(sink, outbound));

    let mut link = ProxyLink::new(id, peer, pass, ctx);
    let result = link.run(&mut requests).await;
    link.close();

    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Writing to {} failed: {}", peer, e),
        Err(e) => warn!("Writer for {} panicked: {}", peer, e),
    }
    result
}

/// Writes queued responses to the client. Responses are only flushed on an
/// explicit `Flush` so a burst goes out in one write.
async fn write_downstream<S>(
    mut sink: S,
    mut outbound: UnboundedReceiver<Outbound>,
) -> std::result::Result<(), CodecError>
where
    S: Sink<HttpResponse, Error = CodecError> + Unpin,
{
    while let Some(message) = outbound.recv().await {
        match message {
            Outbound::Response(response) => sink.feed(response).await?,
            Outbound::Flush => sink.flush().await?,
            Outbound::Close => break,
        }
    }
    sink.close().await
}
