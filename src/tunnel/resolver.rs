//! Upstream DNS resolution.
//!
//! `UpstreamResolver` forwards raw DNS packets to the configured upstream
//! servers over UDP, TCP, DoT (TLS), or DoH (HTTPS) and returns the raw
//! response. Resolutions are independent per call: many may be in flight
//! concurrently and a slow exchange never blocks another.

use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use hickory_proto::op::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use crate::config;
use crate::error::TunnelError;
use crate::tunnel::upstream::{Upstream, UpstreamProtocol};

/// Maximum UDP DNS response size.
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

/// Maximum TCP/DoT DNS response size.
const MAX_TCP_RESPONSE_SIZE: usize = u16::MAX as usize;

fn query_timeout() -> Duration {
    Duration::from_secs(config::DNS_QUERY_TIMEOUT_SECS)
}

/// Shared transport state for a started resolver session.
struct ResolverInner {
    upstreams: Vec<Upstream>,
    http_client: reqwest::Client,
    tls_config: Arc<rustls::ClientConfig>,
    encrypted: bool,
}

/// Forwards raw DNS packets to upstream servers.
///
/// `start` builds the transports, `resolve` performs one exchange, and
/// `stop` tears the session down. A resolve racing a stop simply returns
/// no response.
pub struct UpstreamResolver {
    inner: RwLock<Option<Arc<ResolverInner>>>,
}

impl UpstreamResolver {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    /// Start a resolver session against the given upstreams. An empty list
    /// substitutes the builtin default servers.
    pub fn start(&self, mut upstreams: Vec<Upstream>) -> Result<(), TunnelError> {
        if upstreams.is_empty() {
            tracing::info!(
                "No upstreams configured, substituting {} builtin servers",
                config::BUILTIN_DNS_SERVERS.len()
            );
            upstreams = config::BUILTIN_DNS_SERVERS
                .iter()
                .map(|s| Upstream::plain(*s))
                .collect();
        }

        // Validate every address up front so a typo fails the start rather
        // than every later resolve.
        for up in &upstreams {
            match up.protocol {
                UpstreamProtocol::Plain | UpstreamProtocol::PlainTcp => {
                    up.socket_addr()?;
                }
                UpstreamProtocol::Dot | UpstreamProtocol::Doq => {
                    up.host_port()?;
                }
                UpstreamProtocol::Doh => {}
            }
        }

        let http_client = reqwest::Client::builder()
            .timeout(query_timeout())
            .build()
            .map_err(|e| TunnelError::ResolverStart(format!("HTTP client: {e}")))?;

        let root_store = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| TunnelError::ResolverStart(format!("TLS config: {e}")))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        let encrypted = upstreams.iter().all(|u| u.protocol.is_encrypted());

        tracing::info!("Resolver started with {} upstreams", upstreams.len());
        *self.inner.write().unwrap() = Some(Arc::new(ResolverInner {
            upstreams,
            http_client,
            tls_config: Arc::new(tls_config),
            encrypted,
        }));
        Ok(())
    }

    /// Stop the session. In-flight resolves finish against the old
    /// transports; new resolves return no response.
    pub fn stop(&self) {
        if self.inner.write().unwrap().take().is_some() {
            tracing::info!("Resolver stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.read().unwrap().is_some()
    }

    /// Whether every upstream of the current session uses an encrypted
    /// transport. False when not started.
    pub fn is_encrypted(&self) -> bool {
        self.inner
            .read()
            .unwrap()
            .as_ref()
            .map(|i| i.encrypted)
            .unwrap_or(false)
    }

    /// Resolve one raw DNS packet. Returns `None` for malformed queries,
    /// timeouts, all-upstreams-failed, and when the resolver is stopped —
    /// the caller simply sends no response.
    pub async fn resolve(&self, request: &[u8]) -> Option<Vec<u8>> {
        let inner = self.inner.read().unwrap().clone()?;

        // DNS header is 12 bytes; anything shorter cannot be a query.
        if request.len() < 12 {
            tracing::debug!("Dropping {}-byte packet, too short for DNS", request.len());
            return None;
        }
        let message = match Message::from_vec(request) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!("Dropping malformed DNS packet: {e}");
                return None;
            }
        };
        let name = message
            .queries()
            .first()
            .map(|q| q.name().to_string())
            .unwrap_or_default();

        for upstream in &inner.upstreams {
            match exchange(upstream, request, &inner).await {
                Ok(response) => return Some(response),
                Err(e) => {
                    tracing::debug!("Upstream {upstream} failed for {name}: {e:#}");
                }
            }
        }

        tracing::warn!("All {} upstreams failed for {name}", inner.upstreams.len());
        None
    }
}

impl Default for UpstreamResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// One exchange against one upstream.
async fn exchange(upstream: &Upstream, query: &[u8], inner: &ResolverInner) -> Result<Vec<u8>> {
    match upstream.protocol {
        UpstreamProtocol::Plain => {
            let addr = upstream.socket_addr().map_err(|e| anyhow!("{e}"))?;
            exchange_udp(addr, query).await
        }
        UpstreamProtocol::PlainTcp => {
            let addr = upstream.socket_addr().map_err(|e| anyhow!("{e}"))?;
            let stream = tokio::time::timeout(query_timeout(), TcpStream::connect(addr))
                .await
                .context("TCP connect timed out")?
                .context("TCP connect failed")?;
            exchange_stream(stream, query).await
        }
        UpstreamProtocol::Doh => exchange_doh(upstream.url(), query, &inner.http_client).await,
        // DoQ upstreams ride the DoT transport: same host/port semantics,
        // TLS over TCP instead of QUIC.
        UpstreamProtocol::Dot | UpstreamProtocol::Doq => {
            let (hostname, port) = upstream.host_port().map_err(|e| anyhow!("{e}"))?;
            exchange_dot(&hostname, port, query, &inner.tls_config).await
        }
    }
}

async fn exchange_udp(addr: std::net::SocketAddr, query: &[u8]) -> Result<Vec<u8>> {
    let bind: std::net::SocketAddr = if addr.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };
    let socket = UdpSocket::bind(bind).await.context("UDP bind failed")?;
    socket.send_to(query, addr).await.context("UDP send failed")?;

    let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
    let (len, _) = tokio::time::timeout(query_timeout(), socket.recv_from(&mut buf))
        .await
        .context("UDP exchange timed out")?
        .context("UDP recv failed")?;
    buf.truncate(len);
    Ok(buf)
}

async fn exchange_doh(url: &str, query: &[u8], client: &reqwest::Client) -> Result<Vec<u8>> {
    let response = client
        .post(url)
        .header("Content-Type", "application/dns-message")
        .header("Accept", "application/dns-message")
        .body(query.to_vec())
        .send()
        .await
        .context("DoH request failed")?;

    if !response.status().is_success() {
        return Err(anyhow!("DoH server returned {}", response.status()));
    }
    let body = response.bytes().await.context("DoH body read failed")?;
    Ok(body.to_vec())
}

async fn exchange_dot(
    hostname: &str,
    port: u16,
    query: &[u8],
    tls_config: &Arc<rustls::ClientConfig>,
) -> Result<Vec<u8>> {
    let addr = tokio::net::lookup_host((hostname, port))
        .await
        .with_context(|| format!("cannot resolve DoT server {hostname}"))?
        .next()
        .ok_or_else(|| anyhow!("no addresses for DoT server {hostname}"))?;

    let tcp = tokio::time::timeout(query_timeout(), TcpStream::connect(addr))
        .await
        .context("DoT connect timed out")?
        .context("DoT connect failed")?;

    let connector = tokio_rustls::TlsConnector::from(tls_config.clone());
    let server_name = rustls_pki_types::ServerName::try_from(hostname.to_string())
        .map_err(|e| anyhow!("invalid DoT hostname: {e}"))?;
    let stream = tokio::time::timeout(query_timeout(), connector.connect(server_name, tcp))
        .await
        .context("DoT handshake timed out")?
        .context("DoT handshake failed")?;

    exchange_stream(stream, query).await
}

/// DNS over a stream transport: two-byte big-endian length prefix on both
/// the query and the response.
async fn exchange_stream<S>(mut stream: S, query: &[u8]) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = u16::try_from(query.len()).map_err(|_| anyhow!("query exceeds 64 KiB"))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(query).await?;
    stream.flush().await?;

    let exchange = async {
        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let response_len = u16::from_be_bytes(len_buf) as usize;
        if response_len > MAX_TCP_RESPONSE_SIZE {
            return Err(anyhow!("response length {response_len} out of range"));
        }
        let mut buf = vec![0u8; response_len];
        stream.read_exact(&mut buf).await?;
        Ok(buf)
    };
    tokio::time::timeout(query_timeout(), exchange)
        .await
        .context("stream exchange timed out")?
}
