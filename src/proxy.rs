//! Proxy server implementation
//! Routes mount prefixes to origins and rewrites HTML links on the way back

use crate::error::ProxyError;
use crate::forward::{self, UpstreamRequest};
use crate::rewrite::{self, ResponseRewriter};
use crate::router;
use crate::rules::RuleStore;
use crate::upstream::UpstreamClient;
use anyhow::{anyhow, Context, Result};
use bytes::{Bytes, BytesMut};
use futures_util::{stream, StreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

const LANDING_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <title>Reverse Proxy</title>
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, sans-serif; background: #F2F2F7;
               min-height: 100vh; margin: 0; display: flex; justify-content: center; align-items: center; }
        .container { text-align: center; padding: 60px; background: #FFFFFF; border-radius: 40px; }
        h1 { font-size: 2.5rem; color: #1C1C1E; margin: 0 0 16px; }
        p { color: #8E8E93; font-size: 1.1rem; margin: 0; }
    </style>
</head>
<body>
    <div class="container">
        <h1>Reverse Proxy</h1>
        <p>Service is running</p>
    </div>
</body>
</html>"#;

/// Proxy server configuration
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub http_port: u16,
    /// Bound on waiting for upstream response headers; `None` waits forever
    pub upstream_timeout: Option<Duration>,
    /// HTML bodies larger than this are streamed through without rewriting
    pub max_rewrite_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            upstream_timeout: Some(Duration::from_secs(30)),
            max_rewrite_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Upstream body, either fully read or cut off at the buffering limit
enum BufferedBody {
    Complete(Bytes),
    Overflow { head: Bytes, rest: Incoming },
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    rule_store: Arc<RuleStore>,
    upstream: UpstreamClient,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(config: ProxyConfig, rule_store: Arc<RuleStore>) -> Self {
        Self {
            config,
            rule_store,
            upstream: UpstreamClient::new(),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Bind the configured port and serve until the listener fails
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.config.http_port).parse()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

        self.serve(listener).await
    }

    /// Accept loop on an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("HTTP server listening on {}", listener.local_addr()?);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single HTTP connection
    ///
    /// When the client goes away hyper drops the in-flight service future,
    /// which also drops (and so cancels) the upstream request.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) -> Result<()> {
        let io = TokioIo::new(stream);

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let server = self.clone();
                    async move { server.handle_request(req, remote_addr).await }
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Handle incoming request
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, Infallible> {
        let path = req.uri().path().to_string();

        match self.process_request(req, remote_addr).await {
            Ok(response) => Ok(response),
            Err(e) => {
                match &e {
                    ProxyError::RouteNotFound => warn!("No proxy rule matched {}", path),
                    _ => error!("Proxy error on {}: {}", path, e),
                }
                Ok(Self::text_response(e.status_code(), &e.to_response_message()))
            }
        }
    }

    /// Route, forward and post-process one request
    async fn process_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let path = req.uri().path().to_string();
        debug!("{} {} from {}", req.method(), path, remote_addr);

        // Fresh snapshot per request so rule edits apply immediately
        let rules = self.rule_store.list_enabled();

        let route = match router::match_route(&path, &rules) {
            Some(route) => route,
            None => {
                return match path.as_str() {
                    "/health" => Ok(Self::text_response(StatusCode::OK, "OK")),
                    "/" => Ok(Self::html_response(LANDING_PAGE)),
                    _ => Err(ProxyError::RouteNotFound),
                };
            }
        };

        let (parts, body) = req.into_parts();
        let upstream = forward::translate(route.rule, &route.prefix, &parts, remote_addr)?;

        let body = body
            .collect()
            .await
            .map_err(|e| ProxyError::RequestBody(e.to_string()))?
            .to_bytes();

        self.forward(upstream, body).await
    }

    /// Send the upstream request and build the client response
    async fn forward(&self, upstream: UpstreamRequest, body: Bytes) -> Result<Response<ProxyBody>, ProxyError> {
        let UpstreamRequest {
            method,
            uri,
            headers,
            target,
            context,
        } = upstream;

        let mut request = Request::new(Full::new(body));
        *request.method_mut() = method.clone();
        *request.uri_mut() = uri;
        *request.headers_mut() = headers;

        let send = self.upstream.send(&target, request);
        let response = match self.config.upstream_timeout {
            Some(limit) => tokio::time::timeout(limit, send)
                .await
                .map_err(|_| ProxyError::UpstreamTimeout(limit))??,
            None => send.await?,
        };

        let (parts, body) = response.into_parts();
        let status = parts.status;
        let mut headers = parts.headers;
        forward::remove_hop_by_hop_headers(&mut headers);

        if !Self::should_rewrite(&method, status, &headers) {
            return Ok(Self::build_response(status, headers, Self::stream_body(body)));
        }

        let rewriter = ResponseRewriter::for_rule(&context.rule, &context.prefix, self.config.max_rewrite_bytes)?;

        if Self::declared_length(&headers).is_some_and(|len| len > rewriter.max_body_bytes() as u64) {
            warn!(
                "HTML for {} exceeds {} bytes, passing through unmodified",
                context.original_path,
                rewriter.max_body_bytes()
            );
            return Ok(Self::build_response(status, headers, Self::stream_body(body)));
        }

        match Self::buffer_body(body, rewriter.max_body_bytes()).await? {
            BufferedBody::Complete(body) => {
                let body = rewriter.rewrite(&mut headers, body)?;
                Ok(Self::build_response(status, headers, Self::full_body(body)))
            }
            BufferedBody::Overflow { head, rest } => {
                warn!(
                    "HTML for {} exceeds {} bytes, passing through unmodified",
                    context.original_path,
                    rewriter.max_body_bytes()
                );
                let body = Self::chained_body(head, rest);
                Ok(Self::build_response(status, headers, body))
            }
        }
    }

    /// Only HTML bodies that can actually carry content are rewritten
    fn should_rewrite(method: &Method, status: StatusCode, headers: &HeaderMap) -> bool {
        if *method == Method::HEAD {
            return false;
        }
        if status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
            return false;
        }
        rewrite::is_html(headers)
    }

    fn declared_length(headers: &HeaderMap) -> Option<u64> {
        headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Read the upstream body into memory, stopping once `limit` is exceeded
    async fn buffer_body(mut body: Incoming, limit: usize) -> Result<BufferedBody, ProxyError> {
        let mut buffer = BytesMut::new();

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| ProxyError::RewriteIo(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
            let Ok(chunk) = frame.into_data() else {
                continue;
            };

            buffer.extend_from_slice(&chunk);
            if buffer.len() > limit {
                return Ok(BufferedBody::Overflow {
                    head: buffer.freeze(),
                    rest: body,
                });
            }
        }

        Ok(BufferedBody::Complete(buffer.freeze()))
    }

    fn build_response(status: StatusCode, headers: HeaderMap, body: ProxyBody) -> Response<ProxyBody> {
        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }

    /// Create text response
    fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
        let mut response = Response::new(Self::full_body(Bytes::from(body.to_string())));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        response
    }

    fn html_response(body: &'static str) -> Response<ProxyBody> {
        let mut response = Response::new(Self::full_body(Bytes::from_static(body.as_bytes())));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
        response
    }

    /// Create full body
    fn full_body(bytes: Bytes) -> ProxyBody {
        Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
    }

    /// Stream the upstream body through untouched
    fn stream_body(body: Incoming) -> ProxyBody {
        body.map_err(BoxError::from).boxed_unsync()
    }

    /// Replay an already buffered head, then stream the remainder
    fn chained_body(head: Bytes, rest: Incoming) -> ProxyBody {
        let frames = stream::once(async move { Ok::<_, hyper::Error>(Frame::data(head)) })
            .chain(BodyStream::new(rest))
            .map(|frame| frame.map_err(BoxError::from));
        StreamBody::new(frames).boxed_unsync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn html() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        headers
    }

    #[test]
    fn test_should_rewrite_html_get() {
        assert!(ProxyServer::should_rewrite(&Method::GET, StatusCode::OK, &html()));
        assert!(ProxyServer::should_rewrite(&Method::POST, StatusCode::NOT_FOUND, &html()));
    }

    #[test]
    fn test_should_not_rewrite_bodiless() {
        assert!(!ProxyServer::should_rewrite(&Method::HEAD, StatusCode::OK, &html()));
        assert!(!ProxyServer::should_rewrite(&Method::GET, StatusCode::NO_CONTENT, &html()));
        assert!(!ProxyServer::should_rewrite(&Method::GET, StatusCode::NOT_MODIFIED, &html()));
    }

    #[test]
    fn test_should_not_rewrite_other_types() {
        let mut json = HeaderMap::new();
        json.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert!(!ProxyServer::should_rewrite(&Method::GET, StatusCode::OK, &json));
    }

    #[test]
    fn test_text_response() {
        let response = ProxyServer::text_response(StatusCode::NOT_FOUND, "No proxy rule matched");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn test_declared_length() {
        let mut headers = html();
        assert_eq!(ProxyServer::declared_length(&headers), None);

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("1024"));
        assert_eq!(ProxyServer::declared_length(&headers), Some(1024));

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("lots"));
        assert_eq!(ProxyServer::declared_length(&headers), None);
    }

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.upstream_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.max_rewrite_bytes, 10 * 1024 * 1024);
    }
}
