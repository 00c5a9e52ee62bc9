//! Forwarding pipelines for backend targets
//!
//! A pipeline pairs a director (rewrites an inbound request so it points at
//! the backend), a bounded connection-pooling transport, and an error handler
//! that answers 502 when the backend cannot be reached. One pipeline is
//! cached per mapped host in the routing table.

use crate::error::{text_error_response, ForwardError, PipelineError, ProxyBody, ProxyErrorCode};
use crate::logging::log_error;
use crate::routes::HostTarget;
use futures::future::BoxFuture;
use http_body_util::BodyExt;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::http::uri::Scheme;
use hyper::{Request, Response, Uri, Version};
use hyper_rustls::{ConfigBuilderExt, MaybeHttpsStream};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use parking_lot::RwLock;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tower::Service;
use tracing::debug;
use url::{Position, Url};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Hop-by-hop headers, removed before forwarding in either direction
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Client connection details the director needs
#[derive(Debug, Clone, Copy)]
pub struct ClientInfo {
    pub addr: SocketAddr,
    pub is_tls: bool,
}

/// Resource bounds for backend transports
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Cap on idle connections across all hosts
    pub max_idle_total: usize,
    /// Cap on idle connections per backend host
    pub max_idle_per_host: usize,
    /// Idle connections are closed after this long
    pub idle_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// TLS handshake timeout for https targets, counted after the TCP connect
    pub tls_handshake_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_idle_total: 100,
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(30),
            tls_handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    /// Idle connections a single pipeline may keep. Each pipeline talks to
    /// exactly one backend, so both caps apply to it.
    pub fn idle_per_pipeline(&self) -> usize {
        self.max_idle_total.min(self.max_idle_per_host)
    }
}

/// Capability to drop pooled idle connections on demand
pub trait IdleConnectionCloser: Send + Sync {
    fn close_idle_connections(&self);
}

/// Sends a directed request to a backend and returns its response
pub trait Transport: Send + Sync {
    fn round_trip(&self, req: Request<ProxyBody>) -> BoxFuture<'static, Result<Response<ProxyBody>, ForwardError>>;

    /// The transport's idle-connection closer, if it has one
    fn idle_closer(&self) -> Option<&dyn IdleConnectionCloser> {
        None
    }
}

/// Statistics for a transport
#[derive(Debug, Default)]
pub struct TransportStats {
    /// Requests sent to the backend
    pub total_requests: AtomicU64,
    /// Times the idle pool was dropped
    pub idle_closes: AtomicU64,
}

impl TransportStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_idle_close(&self) {
        self.idle_closes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_idle_closes(&self) -> u64 {
        self.idle_closes.load(Ordering::Relaxed)
    }
}

/// Backend connector. The TCP connect is bounded by the inner
/// `HttpConnector`; for https targets the TLS handshake then gets its own
/// clock of `handshake` once the socket is up.
#[derive(Clone)]
pub struct BackendConnector {
    http: HttpConnector,
    tls: TlsConnector,
    handshake: Duration,
}

type BackendStream = MaybeHttpsStream<TokioIo<TcpStream>>;

impl BackendConnector {
    pub fn new(config: &TransportConfig, tls: TlsConnector) -> Self {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(config.connect_timeout));

        Self {
            http,
            tls,
            handshake: config.tls_handshake_timeout,
        }
    }
}

/// Client TLS settings for https backends: webpki roots, HTTP/1.1 ALPN
fn tls_connector() -> Result<TlsConnector, PipelineError> {
    let mut config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_webpki_roots()
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsConnector::from(Arc::new(config)))
}

impl Service<Uri> for BackendConnector {
    type Response = BackendStream;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.http.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let is_https = uri.scheme() == Some(&Scheme::HTTPS);
        let host = uri
            .host()
            .unwrap_or("")
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let connecting = self.http.call(uri);
        let tls = self.tls.clone();
        let handshake = self.handshake;

        Box::pin(async move {
            let tcp = connecting.await?;
            if !is_https {
                return Ok(MaybeHttpsStream::Http(tcp));
            }

            let server_name = ServerName::try_from(host)?;
            match tokio::time::timeout(handshake, tls.connect(server_name, TokioIo::new(tcp))).await {
                Ok(Ok(stream)) => Ok(MaybeHttpsStream::Https(TokioIo::new(stream))),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(Box::new(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("TLS handshake exceeded {:?}", handshake),
                )) as BoxError),
            }
        })
    }
}

type BackendClient = Client<BackendConnector, ProxyBody>;

fn build_client(config: &TransportConfig, tls: &TlsConnector) -> BackendClient {
    Client::builder(TokioExecutor::new())
        .pool_timer(TokioTimer::new())
        .pool_max_idle_per_host(config.idle_per_pipeline())
        .pool_idle_timeout(config.idle_timeout)
        .build(BackendConnector::new(config, tls.clone()))
}

/// Pooled HTTP(S) transport for one backend
pub struct HttpTransport {
    client: RwLock<BackendClient>,
    tls: TlsConnector,
    config: TransportConfig,
    stats: Arc<TransportStats>,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Result<Self, PipelineError> {
        let tls = tls_connector()?;
        Ok(Self {
            client: RwLock::new(build_client(&config, &tls)),
            tls,
            config,
            stats: Arc::new(TransportStats::default()),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<TransportStats> {
        Arc::clone(&self.stats)
    }
}

impl Transport for HttpTransport {
    fn round_trip(&self, req: Request<ProxyBody>) -> BoxFuture<'static, Result<Response<ProxyBody>, ForwardError>> {
        let client = self.client.read().clone();
        self.stats.record_request();

        Box::pin(async move {
            let response = client.request(req).await?;
            Ok(response.map(|body| body.boxed()))
        })
    }

    fn idle_closer(&self) -> Option<&dyn IdleConnectionCloser> {
        Some(self)
    }
}

impl IdleConnectionCloser for HttpTransport {
    /// Swap in a fresh client. The old pool, with its idle connections, is
    /// dropped once in-flight requests holding it complete.
    fn close_idle_connections(&self) {
        let fresh = build_client(&self.config, &self.tls);
        *self.client.write() = fresh;
        self.stats.record_idle_close();
    }
}

/// A reusable request-forwarding pipeline bound to one backend target
pub struct Pipeline {
    target: Url,
    transport: Arc<dyn Transport>,
    forward_errors: AtomicU64,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("target", &self.target.as_str())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Build a pipeline around an existing transport
    pub fn with_transport(target: Url, transport: Arc<dyn Transport>) -> Self {
        Self {
            target,
            transport,
            forward_errors: AtomicU64::new(0),
        }
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Number of requests answered by the 502 error handler
    pub fn forward_errors(&self) -> u64 {
        self.forward_errors.load(Ordering::Relaxed)
    }

    /// Rewrite `req` in place so that it addresses the backend
    pub fn direct(&self, req: &mut Request<ProxyBody>, client: &ClientInfo) -> Result<(), ForwardError> {
        let uri = rewrite_uri(&self.target, req.uri())?;
        let original_host = req.headers().get(hyper::header::HOST).cloned();

        *req.uri_mut() = uri;
        *req.version_mut() = Version::HTTP_11;

        let headers = req.headers_mut();
        strip_hop_by_hop(headers);
        // The inbound side already answered any 100-continue.
        headers.remove(hyper::header::EXPECT);

        let authority = target_authority(&self.target)?;
        let host = HeaderValue::from_str(authority).map_err(|e| ForwardError::RequestBuild(e.to_string()))?;
        headers.insert(hyper::header::HOST, host);

        if !headers.contains_key(X_REQUEST_ID) {
            if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
                headers.insert(X_REQUEST_ID, value);
            }
        }

        let forwarded_for = forwarded_chain(headers, client.addr.ip());
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Some(host) = original_host {
            headers.insert(X_FORWARDED_HOST, host);
        }
        let proto = if client.is_tls { "https" } else { "http" };
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

        Ok(())
    }

    /// Forward `req` to the backend and return the response to relay.
    /// Backend failures are turned into 502 by the error handler; nothing is retried.
    pub async fn forward(&self, mut req: Request<ProxyBody>, client: &ClientInfo) -> Response<ProxyBody> {
        if let Err(e) = self.direct(&mut req, client) {
            return self.handle_error(&e);
        }

        debug!(target_url = %self.target, uri = %req.uri(), "Forwarding request");

        match self.transport.round_trip(req).await {
            Ok(mut response) => {
                strip_hop_by_hop(response.headers_mut());
                response
            }
            Err(e) => self.handle_error(&e),
        }
    }

    fn handle_error(&self, err: &ForwardError) -> Response<ProxyBody> {
        self.forward_errors.fetch_add(1, Ordering::Relaxed);
        log_error("pipeline", &format!("forwarding to {} failed: {}", self.target, err));
        text_error_response(ProxyErrorCode::BadGateway, "Bad Gateway")
    }

    /// Close the transport's idle connections. Returns false when the
    /// transport has nothing closable.
    pub fn close_idle_connections(&self) -> bool {
        match self.transport.idle_closer() {
            Some(closer) => {
                closer.close_idle_connections();
                true
            }
            None => false,
        }
    }
}

/// Builds pipelines with a shared transport configuration
#[derive(Debug, Default)]
pub struct PipelineFactory {
    transport: TransportConfig,
    builds: AtomicU64,
}

impl PipelineFactory {
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            builds: AtomicU64::new(0),
        }
    }

    pub fn transport_config(&self) -> &TransportConfig {
        &self.transport
    }

    /// Pipelines built so far
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    /// Build a fresh pipeline for `target`
    pub fn build(&self, target: &Url) -> Result<Pipeline, PipelineError> {
        validate_target(target)?;

        let transport = HttpTransport::new(self.transport.clone())?;
        self.builds.fetch_add(1, Ordering::Relaxed);
        debug!(
            target_url = %target,
            max_idle = self.transport.idle_per_pipeline(),
            idle_timeout_secs = self.transport.idle_timeout.as_secs(),
            "Pipeline built"
        );

        Ok(Pipeline::with_transport(target.clone(), Arc::new(transport)))
    }

    /// Return the cached pipeline of `host`, or build one
    pub fn create_or_reuse(&self, host: &HostTarget) -> Result<Arc<Pipeline>, PipelineError> {
        if let Some(pipeline) = host.pipeline() {
            return Ok(Arc::clone(pipeline));
        }

        self.build(host.target()).map(Arc::new)
    }
}

fn validate_target(target: &Url) -> Result<(), PipelineError> {
    match target.scheme() {
        "http" | "https" => {}
        other => {
            return Err(PipelineError::UnsupportedScheme(
                target.to_string(),
                other.to_string(),
            ))
        }
    }

    match target.host_str() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(PipelineError::MissingTarget(target.to_string())),
    }
}

/// `host[:port]` of a target URL
fn target_authority(target: &Url) -> Result<&str, ForwardError> {
    let authority = &target[Position::BeforeHost..Position::AfterPort];
    if authority.is_empty() {
        return Err(ForwardError::RequestBuild(format!("target '{}' has no host", target)));
    }
    Ok(authority)
}

/// Existing `X-Forwarded-For` values with `ip` appended
fn forwarded_chain(headers: &HeaderMap, ip: IpAddr) -> String {
    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    if prior.is_empty() {
        ip.to_string()
    } else {
        format!("{}, {}", prior.join(", "), ip)
    }
}

/// Join the target's query with the request's, with `&` only when both are non-empty
pub fn join_queries(target: Option<&str>, request: Option<&str>) -> Option<String> {
    let target = target.unwrap_or("");
    let request = request.unwrap_or("");

    let joined = if target.is_empty() || request.is_empty() {
        format!("{}{}", target, request)
    } else {
        format!("{}&{}", target, request)
    };

    (!joined.is_empty()).then_some(joined)
}

/// Point `uri` at `target`: scheme and authority are replaced, the path is
/// kept and the queries are joined.
pub fn rewrite_uri(target: &Url, uri: &Uri) -> Result<Uri, ForwardError> {
    let authority = target_authority(target)?;
    let path = match uri.path() {
        "" => "/",
        path => path,
    };
    let path_and_query = match join_queries(target.query(), uri.query()) {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    };

    Uri::builder()
        .scheme(target.scheme())
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ForwardError::RequestBuild(e.to_string()))
}

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::full_body;
    use hyper::StatusCode;
    use std::sync::atomic::AtomicUsize;

    fn client() -> ClientInfo {
        ClientInfo {
            addr: "203.0.113.7:50000".parse().unwrap(),
            is_tls: false,
        }
    }

    fn request(uri: &str) -> Request<ProxyBody> {
        Request::builder()
            .uri(uri)
            .header("Host", "example.com")
            .body(full_body(""))
            .unwrap()
    }

    /// Transport double that fails every request
    struct FailingTransport;

    impl Transport for FailingTransport {
        fn round_trip(&self, _req: Request<ProxyBody>) -> BoxFuture<'static, Result<Response<ProxyBody>, ForwardError>> {
            Box::pin(async { Err(ForwardError::RequestBuild("connection refused".to_string())) })
        }
    }

    /// Transport double that echoes the directed URI and counts closes
    #[derive(Default)]
    struct EchoTransport {
        closes: AtomicUsize,
    }

    impl Transport for EchoTransport {
        fn round_trip(&self, req: Request<ProxyBody>) -> BoxFuture<'static, Result<Response<ProxyBody>, ForwardError>> {
            let uri = req.uri().to_string();
            Box::pin(async move {
                Ok(Response::builder()
                    .header("Connection", "close")
                    .header("X-Seen-Uri", uri)
                    .body(full_body("ok"))
                    .unwrap())
            })
        }

        fn idle_closer(&self) -> Option<&dyn IdleConnectionCloser> {
            Some(self)
        }
    }

    impl IdleConnectionCloser for EchoTransport {
        fn close_idle_connections(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_transport_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.max_idle_total, 100);
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.tls_handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.idle_per_pipeline(), 10);
    }

    #[test]
    fn test_idle_per_pipeline_respects_total_cap() {
        let config = TransportConfig {
            max_idle_total: 4,
            ..TransportConfig::default()
        };
        assert_eq!(config.idle_per_pipeline(), 4);
    }

    #[test]
    fn test_join_queries() {
        assert_eq!(join_queries(None, None), None);
        assert_eq!(join_queries(Some(""), Some("")), None);
        assert_eq!(join_queries(Some("a=1"), None), Some("a=1".to_string()));
        assert_eq!(join_queries(None, Some("b=2")), Some("b=2".to_string()));
        assert_eq!(join_queries(Some("a=1"), Some("b=2")), Some("a=1&b=2".to_string()));
    }

    #[test]
    fn test_rewrite_uri_replaces_scheme_and_host() {
        let target = Url::parse("https://backend2.local:9090").unwrap();
        let uri: Uri = "/path/to?x=1".parse().unwrap();

        let rewritten = rewrite_uri(&target, &uri).unwrap();
        assert_eq!(rewritten.to_string(), "https://backend2.local:9090/path/to?x=1");
    }

    #[test]
    fn test_rewrite_uri_prepends_target_query() {
        let target = Url::parse("http://backend1.local:8080/?token=abc").unwrap();
        let uri: Uri = "/search?q=rust".parse().unwrap();

        let rewritten = rewrite_uri(&target, &uri).unwrap();
        assert_eq!(rewritten.query(), Some("token=abc&q=rust"));
        assert_eq!(rewritten.path(), "/search");
    }

    #[test]
    fn test_rewrite_uri_ignores_target_path() {
        let target = Url::parse("http://10.0.0.1:9000/base").unwrap();
        let uri: Uri = "http://example.com/index.html".parse().unwrap();

        let rewritten = rewrite_uri(&target, &uri).unwrap();
        assert_eq!(rewritten.to_string(), "http://10.0.0.1:9000/index.html");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-private"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert("x-public", HeaderValue::from_static("1"));

        strip_hop_by_hop(&mut headers);

        assert!(headers.get("connection").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-private").is_none());
        assert!(headers.get("x-public").is_some());
    }

    #[test]
    fn test_direct_sets_forwarding_headers() {
        let target = Url::parse("http://backend1.local:8080").unwrap();
        let pipeline = Pipeline::with_transport(target, Arc::new(FailingTransport));
        let mut req = request("/a?b=c");
        req.headers_mut().insert("X-Forwarded-For", HeaderValue::from_static("1.2.3.4"));
        req.headers_mut().insert("Expect", HeaderValue::from_static("100-continue"));

        pipeline.direct(&mut req, &client()).unwrap();

        assert_eq!(req.uri().to_string(), "http://backend1.local:8080/a?b=c");
        assert_eq!(req.headers().get("host").unwrap(), "backend1.local:8080");
        assert_eq!(req.headers().get(X_FORWARDED_FOR).unwrap(), "1.2.3.4, 203.0.113.7");
        assert_eq!(req.headers().get(X_FORWARDED_HOST).unwrap(), "example.com");
        assert_eq!(req.headers().get(X_FORWARDED_PROTO).unwrap(), "http");
        assert!(req.headers().get(X_REQUEST_ID).is_some());
        assert!(req.headers().get("expect").is_none());
    }

    #[test]
    fn test_direct_keeps_existing_request_id() {
        let target = Url::parse("http://backend1.local:8080").unwrap();
        let pipeline = Pipeline::with_transport(target, Arc::new(FailingTransport));
        let mut req = request("/");
        req.headers_mut().insert(X_REQUEST_ID, HeaderValue::from_static("req-42"));

        pipeline.direct(&mut req, &client()).unwrap();

        assert_eq!(req.headers().get(X_REQUEST_ID).unwrap(), "req-42");
    }

    #[tokio::test]
    async fn test_forward_error_answers_bad_gateway() {
        let target = Url::parse("http://backend1.local:8080").unwrap();
        let pipeline = Pipeline::with_transport(target, Arc::new(FailingTransport));

        let response = pipeline.forward(request("/"), &client()).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(pipeline.forward_errors(), 1);
    }

    #[tokio::test]
    async fn test_forward_relays_response_without_hop_headers() {
        let target = Url::parse("http://backend1.local:8080/?k=v").unwrap();
        let pipeline = Pipeline::with_transport(target, Arc::new(EchoTransport::default()));

        let response = pipeline.forward(request("/x?y=z"), &client()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("connection").is_none());
        assert_eq!(
            response.headers().get("x-seen-uri").unwrap(),
            "http://backend1.local:8080/x?k=v&y=z"
        );
        assert_eq!(pipeline.forward_errors(), 0);
    }

    #[test]
    fn test_close_idle_connections_uses_capability() {
        let target = Url::parse("http://backend1.local:8080").unwrap();
        let transport = Arc::new(EchoTransport::default());
        let pipeline = Pipeline::with_transport(target.clone(), transport.clone());

        assert!(pipeline.close_idle_connections());
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);

        let bare = Pipeline::with_transport(target, Arc::new(FailingTransport));
        assert!(!bare.close_idle_connections());
    }

    #[test]
    fn test_http_transport_close_idle_records_stats() {
        let transport = HttpTransport::new(TransportConfig::default()).unwrap();
        assert_eq!(transport.stats().get_idle_closes(), 0);

        transport.close_idle_connections();
        transport.close_idle_connections();

        assert_eq!(transport.stats().get_idle_closes(), 2);
        assert_eq!(transport.stats().get_total_requests(), 0);
        assert_eq!(transport.config().max_idle_per_host, 10);
    }

    #[test]
    fn test_factory_rejects_unsupported_scheme() {
        let factory = PipelineFactory::default();
        let target = Url::parse("ftp://files.local").unwrap();

        let err = factory.build(&target).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedScheme(_, _)));
        assert_eq!(factory.builds(), 0);
    }

    #[test]
    fn test_create_or_reuse_returns_cached_pipeline() {
        let factory = PipelineFactory::default();
        let target = Url::parse("http://backend1.local:8080").unwrap();

        let fresh = HostTarget::new(target.clone());
        let built = factory.create_or_reuse(&fresh).unwrap();
        assert_eq!(factory.builds(), 1);

        let cached = fresh.with_pipeline(Arc::clone(&built));
        let reused = factory.create_or_reuse(&cached).unwrap();
        assert!(Arc::ptr_eq(&built, &reused));
        assert_eq!(factory.builds(), 1);
    }

    #[test]
    fn test_direct_starts_forwarded_for_chain() {
        let target = Url::parse("http://backend1.local:8080").unwrap();
        let pipeline = Pipeline::with_transport(target, Arc::new(FailingTransport));
        let mut req = request("/");

        pipeline.direct(&mut req, &client()).unwrap();

        assert_eq!(req.headers().get(X_FORWARDED_FOR).unwrap(), "203.0.113.7");
    }

    #[tokio::test]
    async fn test_stalled_tls_handshake_is_bounded() {
        // Accepts TCP but never answers the ClientHello
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let factory = PipelineFactory::new(TransportConfig {
            connect_timeout: Duration::from_secs(10),
            tls_handshake_timeout: Duration::from_millis(300),
            ..TransportConfig::default()
        });
        let pipeline = factory.build(&Url::parse(&format!("https://{}", addr)).unwrap()).unwrap();

        let started = std::time::Instant::now();
        let response = pipeline.forward(request("/"), &client()).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
        assert_eq!(pipeline.forward_errors(), 1);
    }
}
