use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use http::{HeaderValue, Method, StatusCode};
use minginx::{
    broker::Broker,
    compression::{self, CompressionConfig, Encoding},
    http::{ClientCodec, HttpRequest, HttpResponse, Inbound, ServerCodec},
    Config, Proxy,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};
use tokio_util::codec::Framed;

const WAIT: Duration = Duration::from_secs(5);

/// A loopback HTTP backend that describes every request it receives.
struct Backend {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl Backend {
    async fn start(name: &'static str) -> Self {
        Self::start_on(Ipv4Addr::LOCALHOST, name).await
    }

    async fn start_on(ip: Ipv4Addr, name: &'static str) -> Self {
        let listener = TcpListener::bind((IpAddr::V4(ip), 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));

        let (accepted_c, closed_c) = (accepted.clone(), closed.clone());
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                accepted_c.fetch_add(1, Ordering::SeqCst);
                let closed = closed_c.clone();
                tokio::spawn(async move {
                    let codec = ServerCodec::new(1024 * 1024, CompressionConfig::disabled());
                    let mut framed = Framed::new(socket, codec);
                    while let Some(Ok(inbound)) = framed.next().await {
                        let Inbound::Request(request) = inbound else {
                            continue;
                        };
                        let response = describe(name, &request);
                        if framed.send(response).await.is_err() {
                            break;
                        }
                        if request.uri.ends_with("/bye") {
                            break;
                        }
                    }
                    closed.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            addr,
            accepted,
            closed,
        }
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

fn describe(name: &'static str, request: &HttpRequest) -> HttpResponse {
    let host = request.headers.get_str("host").unwrap_or("-");
    let body = if request.uri.ends_with("/big") {
        "lorem ipsum dolor sit amet ".repeat(200)
    } else {
        format!(
            "{} {} host={} body={}",
            request.method,
            request.uri,
            host,
            String::from_utf8_lossy(&request.body)
        )
    };
    let mut response = HttpResponse::with_body(StatusCode::OK, body);
    response
        .headers
        .append("X-Backend", HeaderValue::from_static(name));
    response
}

struct Running {
    addr: SocketAddr,
    broker: Arc<Broker>,
}

async fn start_proxy(yaml: &str) -> Running {
    let config = Config::from_yaml(yaml).unwrap();
    let proxy = Proxy::bind(&config).await.unwrap();
    let addr = proxy.local_addrs().unwrap()[0];
    let broker = proxy.broker().clone();
    tokio::spawn(proxy.run());
    Running { addr, broker }
}

type Client = Framed<TcpStream, ClientCodec>;

async fn client(addr: SocketAddr) -> Client {
    let stream = TcpStream::connect(addr).await.unwrap();
    Framed::new(stream, ClientCodec::raw(1024 * 1024))
}

async fn get(client: &mut Client, uri: &str) -> HttpResponse {
    client
        .send(HttpRequest::new(Method::GET, uri))
        .await
        .unwrap();
    timeout(WAIT, client.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
}

fn body(response: &HttpResponse) -> String {
    String::from_utf8_lossy(&response.body).into_owned()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

/// Binds and releases a port so nothing listens on it.
async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn single_route(backend: SocketAddr, extra: &str) -> String {
    format!(
        r#"
proxy:
  bind: 127.0.0.1
{extra}
servers:
  - listen: 0
    location:
      /api: {{ proxyPass: "http://{backend}" }}
"#
    )
}

#[tokio::test]
async fn one_upstream_connection_serves_the_whole_client_connection() {
    let backend = Backend::start("a").await;
    let proxy = start_proxy(&single_route(backend.addr, "")).await;

    let mut client = client(proxy.addr).await;
    let first = get(&mut client, "/api/one").await;
    let second = get(&mut client, "/api/two?x=1").await;

    assert_eq!(first.status, StatusCode::OK);
    assert!(body(&first).starts_with("GET /api/one host=127.0.0.1"));
    assert!(body(&second).starts_with("GET /api/two?x=1"));
    assert_eq!(backend.accepted(), 1);
    assert_eq!(proxy.broker.connects(), 1);
}

#[tokio::test]
async fn unmatched_paths_get_404_and_the_connection_stays_usable() {
    let backend = Backend::start("a").await;
    let proxy = start_proxy(&single_route(backend.addr, "")).await;

    let mut client = client(proxy.addr).await;
    let missing = get(&mut client, "/nothing/here").await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.content_length(), Some(0));
    assert!(missing.body.is_empty());
    assert_eq!(backend.accepted(), 0);

    // Only the first segment counts, case-insensitively.
    let found = get(&mut client, "/API/deeper/path").await;
    assert_eq!(found.status, StatusCode::OK);
    assert_eq!(backend.accepted(), 1);
}

#[tokio::test]
async fn pool_members_share_connections_round_robin() {
    let a = Backend::start("a").await;
    let b = Backend::start_on(Ipv4Addr::new(127, 0, 0, 2), "b").await;
    let proxy = start_proxy(&format!(
        r#"
proxy:
  bind: 127.0.0.1
upstream:
  backend1:
    server: ["{}", "{}"]
servers:
  - listen: 0
    location:
      /api: {{ proxyPass: "http://backend1:9000" }}
"#,
        a.addr, b.addr
    ))
    .await;

    let mut served = Vec::new();
    for _ in 0..4 {
        let mut client = client(proxy.addr).await;
        let response = get(&mut client, "/api/x").await;
        let name = response.headers.get_str("x-backend").unwrap().to_string();
        // Each member sees its own address as Host.
        let host = if name == "a" { "127.0.0.1" } else { "127.0.0.2" };
        assert_eq!(body(&response), format!("GET /api/x host={host} body="));
        served.push(name);
    }

    assert_eq!(served.iter().filter(|b| *b == "a").count(), 2);
    assert_eq!(served.iter().filter(|b| *b == "b").count(), 2);
    assert_eq!(a.accepted(), 2);
    assert_eq!(b.accepted(), 2);
}

#[tokio::test]
async fn failed_connect_answers_502_and_the_next_request_resolves_again() {
    let alive = Backend::start("alive").await;
    let dead = dead_port().await;
    let proxy = start_proxy(&format!(
        r#"
proxy:
  bind: 127.0.0.1
  connectTimeoutMs: 1000
upstream:
  mixed:
    server: ["127.0.0.1:{dead}", "{}"]
servers:
  - listen: 0
    location:
      /api: {{ proxyPass: "http://mixed" }}
"#,
        alive.addr
    ))
    .await;

    let mut client = client(proxy.addr).await;
    let failed = get(&mut client, "/api/x").await;
    assert_eq!(failed.status, StatusCode::BAD_GATEWAY);
    assert_eq!(failed.content_length(), Some(0));

    let retried = get(&mut client, "/api/x").await;
    assert_eq!(retried.status, StatusCode::OK);
    assert_eq!(retried.headers.get_str("x-backend"), Some("alive"));
}

#[tokio::test]
async fn close_policy_drops_the_client_on_connect_failure() {
    let dead = dead_port().await;
    let proxy = start_proxy(&format!(
        r#"
proxy:
  bind: 127.0.0.1
  connectFailure: close
servers:
  - listen: 0
    location:
      /api: {{ proxyPass: "http://127.0.0.1:{dead}" }}
"#
    ))
    .await;

    let mut client = client(proxy.addr).await;
    client
        .send(HttpRequest::new(Method::GET, "/api"))
        .await
        .unwrap();
    let next = timeout(WAIT, client.next()).await.unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn closing_the_client_closes_its_upstream() {
    let backend = Backend::start("a").await;
    let proxy = start_proxy(&single_route(backend.addr, "")).await;

    let mut client = client(proxy.addr).await;
    get(&mut client, "/api").await;
    assert_eq!(backend.closed(), 0);
    drop(client);

    eventually(|| backend.closed() == 1).await;
    eventually(|| proxy.broker.downstream_count() == 0).await;
    assert_eq!(proxy.broker.upstream_count(), 0);
}

#[tokio::test]
async fn upstream_close_keeps_the_client_and_reconnects() {
    let backend = Backend::start("a").await;
    let proxy = start_proxy(&single_route(backend.addr, "")).await;

    let mut client = client(proxy.addr).await;
    let first = get(&mut client, "/api/bye").await;
    assert_eq!(first.status, StatusCode::OK);
    eventually(|| backend.closed() == 1).await;
    eventually(|| proxy.broker.upstream_count() == 0).await;
    assert_eq!(proxy.broker.downstream_count(), 1);

    let again = get(&mut client, "/api/again").await;
    assert_eq!(again.status, StatusCode::OK);
    assert_eq!(backend.accepted(), 2);
}

#[tokio::test]
async fn responses_are_gzipped_for_clients_that_accept_it() {
    let backend = Backend::start("a").await;
    let proxy = start_proxy(&single_route(backend.addr, "")).await;

    let mut client = client(proxy.addr).await;
    let mut request = HttpRequest::new(Method::GET, "/api/big");
    request
        .headers
        .append("Accept-Encoding", HeaderValue::from_static("gzip, deflate"));
    client.send(request).await.unwrap();
    let response = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();

    assert_eq!(response.headers.get_str("content-encoding"), Some("gzip"));
    assert_eq!(response.content_length(), Some(response.body.len()));
    let plain = compression::decompress(&response.body, Encoding::Gzip).unwrap();
    assert_eq!(plain, "lorem ipsum dolor sit amet ".repeat(200).into_bytes());

    // Without Accept-Encoding the body goes out as-is.
    let plain = get(&mut client, "/api/big").await;
    assert!(!plain.headers.contains("content-encoding"));
    assert_eq!(plain.body.len(), 27 * 200);
}

#[tokio::test]
async fn chunked_requests_reach_the_backend_aggregated() {
    let backend = Backend::start("a").await;
    let proxy = start_proxy(&single_route(backend.addr, "")).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(
            b"POST /api/upload HTTP/1.1\r\nHost: proxy\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        )
        .await
        .unwrap();
    let mut client = Framed::new(stream, ClientCodec::raw(1024 * 1024));
    let response = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();

    assert_eq!(
        body(&response),
        "POST /api/upload host=127.0.0.1 body=hello world"
    );
}

#[tokio::test]
async fn oversized_requests_get_413_and_are_closed() {
    let backend = Backend::start("a").await;
    let proxy = start_proxy(&single_route(backend.addr, "  maxContentLength: 16")).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(b"POST /api HTTP/1.1\r\nHost: proxy\r\nContent-Length: 100\r\n\r\n")
        .await
        .unwrap();
    let mut client = Framed::new(stream, ClientCodec::raw(1024));
    let response = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(response.status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(response.content_length(), Some(0));
    assert!(timeout(WAIT, client.next()).await.unwrap().is_none());
    assert_eq!(backend.accepted(), 0);
}

#[tokio::test]
async fn expect_continue_gets_an_interim_response_before_the_body() {
    let backend = Backend::start("a").await;
    let proxy = start_proxy(&single_route(backend.addr, "")).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(
            b"POST /api/upload HTTP/1.1\r\nHost: proxy\r\nContent-Length: 5\r\n\
              Expect: 100-continue\r\n\r\n",
        )
        .await
        .unwrap();
    let mut interim = [0u8; 25];
    timeout(WAIT, stream.read_exact(&mut interim))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&interim, b"HTTP/1.1 100 Continue\r\n\r\n");
    assert_eq!(backend.accepted(), 0);

    stream.write_all(b"hello").await.unwrap();
    let mut client = Framed::new(stream, ClientCodec::raw(1024 * 1024));
    let response = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(
        body(&response),
        "POST /api/upload host=127.0.0.1 body=hello"
    );
}
