use crate::error::{text_error_response, ProxyBody, ProxyErrorCode};
use crate::logging::{self, log_error, log_info, AccessEntry};
use crate::pipeline::ClientInfo;
use crate::ratelimit::{retry_after_secs, Decision, RateLimiter};
use crate::routes::ProxyConfig;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

const TAG: &str = "dispatch";

/// Maximum hostname length per DNS specification, plus room for `:port`
const MAX_HOST_LEN: usize = 253 + 6;

/// Request counters kept by the dispatcher
#[derive(Debug, Default)]
pub struct ProxyStats {
    pub forwarded: AtomicU64,
    pub not_found: AtomicU64,
    pub build_failures: AtomicU64,
    pub bad_gateway: AtomicU64,
    pub rate_limited: AtomicU64,
}

/// Point-in-time copy of [`ProxyStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub forwarded: u64,
    pub not_found: u64,
    pub build_failures: u64,
    pub bad_gateway: u64,
    pub rate_limited: u64,
}

impl ProxyStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            build_failures: self.build_failures.load(Ordering::Relaxed),
            bad_gateway: self.bad_gateway.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Routes each request to the backend mapped for its `Host`
pub struct ProxyHandler {
    config: Arc<ProxyConfig>,
    stats: ProxyStats,
}

impl ProxyHandler {
    pub fn new(config: Arc<ProxyConfig>) -> Self {
        Self {
            config,
            stats: ProxyStats::default(),
        }
    }

    pub fn config(&self) -> &Arc<ProxyConfig> {
        &self.config
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    /// Handle one request: look up its host, obtain the pipeline, forward.
    pub async fn serve(&self, req: Request<ProxyBody>, client: &ClientInfo) -> Response<ProxyBody> {
        let Some(hostname) = requested_host(&req) else {
            ProxyStats::bump(&self.stats.not_found);
            log_error(TAG, &format!("{}: request without a usable Host header", client.addr));
            return text_error_response(ProxyErrorCode::UnknownHost, "Server not found");
        };

        let Some(entry) = self.config.lookup(&hostname) else {
            ProxyStats::bump(&self.stats.not_found);
            let message = format!("Server '{}' not found", hostname);
            log_error(TAG, &message);
            return text_error_response(ProxyErrorCode::UnknownHost, message);
        };

        let pipeline = match entry.pipeline() {
            Some(pipeline) => Arc::clone(pipeline),
            None => match self.config.factory().create_or_reuse(&entry) {
                Ok(built) => self.config.memoize_pipeline(&hostname, &entry, built),
                Err(e) => {
                    ProxyStats::bump(&self.stats.build_failures);
                    log_error(TAG, &format!("cannot build pipeline for '{}': {}", hostname, e));
                    return text_error_response(ProxyErrorCode::PipelineBuildFailed, "Internal Server Error");
                }
            },
        };

        log_info("", &format!("{} {} {}", client.addr, req.method(), req.uri()));
        ProxyStats::bump(&self.stats.forwarded);

        let response = pipeline.forward(req, client).await;
        if is_proxy_error(&response, ProxyErrorCode::BadGateway) {
            ProxyStats::bump(&self.stats.bad_gateway);
        }
        response
    }

    /// Close idle backend connections of every cached pipeline
    pub fn close_idle_connections(&self) {
        let pipelines = self.config.pipelines();
        let closed = pipelines.iter().filter(|p| p.close_idle_connections()).count();
        debug!(pipelines = pipelines.len(), closed, "Closed idle backend connections");
    }
}

fn is_proxy_error(response: &Response<ProxyBody>, code: ProxyErrorCode) -> bool {
    response.status() == code.status_code()
        && response
            .headers()
            .get("X-Proxy-Error")
            .is_some_and(|v| v.as_bytes() == code.as_header_value().as_bytes())
}

/// Lowercased `Host` header, or the URI authority for HTTP/2 requests.
/// Hosts with characters outside a hostname/port are refused to keep them out of logs.
fn requested_host<B>(req: &Request<B>) -> Option<String> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;

    if host.is_empty() || host.len() > MAX_HOST_LEN {
        return None;
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ':' | '[' | ']' | '_'))
    {
        return None;
    }

    Some(host.to_ascii_lowercase())
}

/// Listener glue: accepts connections and hands requests to the dispatcher
pub struct ProxyServer {
    bind_addr: SocketAddr,
    handler: Arc<ProxyHandler>,
    limiter: Option<Arc<RateLimiter>>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

struct Connection {
    handler: Arc<ProxyHandler>,
    limiter: Option<Arc<RateLimiter>>,
    client: ClientInfo,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, handler: Arc<ProxyHandler>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            handler,
            limiter: None,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let protocol = if self.tls_enabled() { "HTTPS" } else { "HTTP" };
        info!(addr = %listener.local_addr()?, protocol, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let tls_acceptor = self.tls_acceptor.clone();
                            let conn = Connection {
                                handler: Arc::clone(&self.handler),
                                limiter: self.limiter.clone(),
                                client: ClientInfo { addr, is_tls: tls_acceptor.is_some() },
                            };

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, conn).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, conn).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!(protocol, "Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, conn: Connection) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let conn = Arc::new(conn);

    let service = service_fn(move |req: Request<Incoming>| {
        let conn = Arc::clone(&conn);
        async move { Ok::<_, Infallible>(handle_request(req, &conn).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(req: Request<Incoming>, conn: &Connection) -> Response<ProxyBody> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let version = req.version();
    let header = |name: hyper::header::HeaderName| {
        req.headers()
            .get(name)
            .and_then(|v: &HeaderValue| v.to_str().ok())
            .map(String::from)
    };
    let referer = header(hyper::header::REFERER);
    let user_agent = header(hyper::header::USER_AGENT);

    let response = match conn.limiter.as_ref().map(|l| l.check(conn.client.addr.ip())) {
        Some(Decision::Limited { retry_after }) => {
            ProxyStats::bump(&conn.handler.stats().rate_limited);
            rate_limited_response(retry_after_secs(retry_after))
        }
        _ => {
            let req = req.map(|body| body.boxed());
            conn.handler.serve(req, &conn.client).await
        }
    };

    logging::access(&AccessEntry {
        client: conn.client.addr,
        method: &method,
        uri: &uri,
        version,
        referer: referer.as_deref(),
        user_agent: user_agent.as_deref(),
        status: response.status(),
        time: chrono::Utc::now(),
    });

    response
}

fn rate_limited_response(retry_after: u64) -> Response<ProxyBody> {
    let mut response = text_error_response(ProxyErrorCode::RateLimited, "Too Many Requests");
    response
        .headers_mut()
        .insert(hyper::header::RETRY_AFTER, HeaderValue::from(retry_after));
    response
}
