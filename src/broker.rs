//! Connection broker: pairs every downstream connection with at most one
//! upstream connection and relays responses back along that pairing.
//!
//! Two maps are kept. `downstream` is keyed by the client connection id and
//! exists from accept until the client goes away; `upstream` is keyed by the
//! backend connection id and only exists while that backend connection is
//! open. A response read from a backend is routed by looking its connection
//! id up in `upstream`.

use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use derive_more::Display;
use futures::{FutureExt, SinkExt, StreamExt};
use http::StatusCode;
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time,
};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::{
    http::{ClientCodec, HttpRequest, HttpResponse},
    upstream::UpstreamServer,
    ProxyError, Result,
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of a downstream or upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Instructions for a downstream writer task.
#[derive(Debug)]
pub enum Outbound {
    Response(HttpResponse),
    Flush,
    Close,
}

/// Write side of a downstream connection.
#[derive(Debug, Clone)]
pub struct DownstreamPass {
    id: ConnectionId,
    tx: UnboundedSender<Outbound>,
}

impl DownstreamPass {
    pub fn new(id: ConnectionId) -> (Self, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a response; it reaches the socket on the next flush.
    /// Returns false once the connection's writer is gone.
    pub fn forward(&self, response: HttpResponse) -> bool {
        self.tx.send(Outbound::Response(response)).is_ok()
    }

    pub fn flush(&self) {
        let _ = self.tx.send(Outbound::Flush);
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

/// Handle on an open upstream connection. Dropping it lets the relay task
/// wind down and close the socket.
#[derive(Debug)]
struct UpstreamLink {
    id: ConnectionId,
    backend: UpstreamServer,
    requests: UnboundedSender<HttpRequest>,
}

#[derive(Debug)]
struct DownstreamEntry {
    pass: DownstreamPass,
    upstream: Option<UpstreamLink>,
}

#[derive(Debug)]
pub struct Broker {
    downstream: DashMap<ConnectionId, DownstreamEntry>,
    upstream: DashMap<ConnectionId, DownstreamPass>,
    connect_timeout: Option<Duration>,
    max_content_length: usize,
    connects: AtomicU64,
}

impl Broker {
    pub fn new(connect_timeout: Option<Duration>, max_content_length: usize) -> Self {
        Self {
            downstream: DashMap::new(),
            upstream: DashMap::new(),
            connect_timeout,
            max_content_length,
            connects: AtomicU64::new(0),
        }
    }

    pub fn register_downstream(&self, pass: DownstreamPass) {
        self.downstream.insert(
            pass.id(),
            DownstreamEntry {
                pass,
                upstream: None,
            },
        );
    }

    /// Opens a connection to `backend` on behalf of `downstream` and starts
    /// relaying its responses. Returns the new upstream connection id.
    pub async fn connect(
        self: &Arc<Self>,
        downstream: ConnectionId,
        backend: &UpstreamServer,
    ) -> Result<ConnectionId> {
        let connect = TcpStream::connect((backend.address(), backend.port()));
        let stream = match self.connect_timeout {
            Some(limit) => time::timeout(limit, connect)
                .await
                .map_err(|_| ProxyError::UpstreamConnectTimeout(backend.to_string()))?,
            None => connect.await,
        }
        .map_err(|source| ProxyError::UpstreamConnect {
            backend: backend.to_string(),
            source,
        })?;
        self.connects.fetch_add(1, Ordering::Relaxed);

        let id = ConnectionId::next();
        let (tx, rx) = mpsc::unbounded_channel();
        let pass = {
            let Some(mut entry) = self.downstream.get_mut(&downstream) else {
                return Err(ProxyError::Io(io::ErrorKind::NotConnected.into()));
            };
            if let Some(stale) = entry.upstream.take() {
                self.upstream.remove(&stale.id);
            }
            entry.upstream = Some(UpstreamLink {
                id,
                backend: backend.clone(),
                requests: tx,
            });
            entry.pass.clone()
        };
        self.upstream.insert(id, pass.clone());
        info!("Connected upstream {} ({}) for downstream {}", id, backend, downstream);

        let framed = Framed::new(stream, ClientCodec::new(self.max_content_length));
        tokio::spawn(Arc::clone(self).relay(id, framed, rx, pass));
        Ok(id)
    }

    /// Hands `request` to the upstream paired with `downstream`. The request
    /// comes back untouched when there is no live upstream to take it.
    pub fn forward(
        &self,
        downstream: ConnectionId,
        request: HttpRequest,
    ) -> std::result::Result<(), HttpRequest> {
        let Some(entry) = self.downstream.get(&downstream) else {
            return Err(request);
        };
        match &entry.upstream {
            Some(link) => link.requests.send(request).map_err(|e| e.0),
            None => Err(request),
        }
    }

    /// Backend currently paired with `downstream`, if any.
    pub fn backend_of(&self, downstream: ConnectionId) -> Option<UpstreamServer> {
        self.downstream
            .get(&downstream)
            .and_then(|entry| entry.upstream.as_ref().map(|link| link.backend.clone()))
    }

    /// Drops the upstream side of `downstream`, keeping the downstream entry.
    pub fn release_upstream(&self, downstream: ConnectionId) {
        let link = self
            .downstream
            .get_mut(&downstream)
            .and_then(|mut entry| entry.upstream.take());
        if let Some(link) = link {
            self.upstream.remove(&link.id);
            debug!("Released upstream {} of downstream {}", link.id, downstream);
        }
    }

    /// Removes both map entries of `downstream`; its upstream connection, if
    /// any, is closed.
    pub fn close_downstream(&self, downstream: ConnectionId) {
        if let Some((_, entry)) = self.downstream.remove(&downstream) {
            if let Some(link) = entry.upstream {
                self.upstream.remove(&link.id);
                debug!("Closing upstream {} with downstream {}", link.id, downstream);
            }
        }
    }

    /// Forgets a closed upstream connection. The paired downstream stays open
    /// and will resolve a new upstream for its next request.
    pub fn close_upstream(&self, upstream: ConnectionId) {
        let Some((_, pass)) = self.upstream.remove(&upstream) else {
            return;
        };
        if let Some(mut entry) = self.downstream.get_mut(&pass.id()) {
            if entry.upstream.as_ref().is_some_and(|link| link.id == upstream) {
                entry.upstream = None;
            }
        }
    }

    /// Writes a response from `upstream` to its paired downstream. Returns
    /// false when the pairing is gone.
    pub fn route_response(&self, upstream: ConnectionId, response: HttpResponse) -> bool {
        match self.upstream.get(&upstream) {
            Some(pass) => pass.forward(response),
            None => {
                debug!("Dropping response from unpaired upstream {}", upstream);
                false
            }
        }
    }

    fn flush(&self, upstream: ConnectionId) {
        if let Some(pass) = self.upstream.get(&upstream) {
            pass.flush();
        }
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn downstream_count(&self) -> usize {
        self.downstream.len()
    }

    pub fn upstream_count(&self) -> usize {
        self.upstream.len()
    }

    /// Drives one upstream connection until either side lets go.
    async fn relay(
        self: Arc<Self>,
        id: ConnectionId,
        framed: Framed<TcpStream, ClientCodec>,
        mut requests: UnboundedReceiver<HttpRequest>,
        pass: DownstreamPass,
    ) {
        let (mut sink, mut responses) = framed.split();
        // Requests written but not yet answered.
        let mut unanswered = 0usize;

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => {
                        unanswered += 1;
                        if let Err(e) = sink.send(request).await {
                            warn!("Failed to write to upstream {}: {}", id, e);
                            break;
                        }
                    }
                    None => {
                        debug!("Upstream {} released by its downstream", id);
                        break;
                    }
                },
                response = responses.next() => {
                    let Some(first) = response else {
                        debug!("Upstream {} closed the connection", id);
                        break;
                    };
                    // Route everything already decodable, then flush once.
                    let mut ended = false;
                    let mut next = Some(first);
                    while let Some(response) = next.take() {
                        match response {
                            Ok(response) => {
                                unanswered = unanswered.saturating_sub(1);
                                self.route_response(id, response);
                            }
                            Err(e) => {
                                warn!("Upstream {} sent an unreadable response: {}", id, e);
                                ended = true;
                                break;
                            }
                        }
                        match responses.next().now_or_never() {
                            Some(Some(response)) => next = Some(response),
                            Some(None) => ended = true,
                            None => {}
                        }
                    }
                    self.flush(id);
                    if ended {
                        break;
                    }
                }
            }
        }

        self.close_upstream(id);
        fail_unanswered(&pass, unanswered, &mut requests);
        let _ = sink.close().await;
    }
}

/// Answers requests a closed upstream will never answer, so the downstream
/// keeps one response per request.
fn fail_unanswered(
    pass: &DownstreamPass,
    unanswered: usize,
    requests: &mut UnboundedReceiver<HttpRequest>,
) {
    requests.close();
    let mut lost = unanswered;
    while requests.try_recv().is_ok() {
        lost += 1;
    }
    if lost == 0 {
        return;
    }
    warn!("Answering {} request(s) lost with their upstream", lost);
    for _ in 0..lost {
        pass.forward(HttpResponse::empty(StatusCode::BAD_GATEWAY));
    }
    pass.flush();
}
