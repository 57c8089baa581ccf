//! Forward translation: builds the upstream request for a matched rule
//! Path rewrite, header rewrite and compression negotiation happen here

use crate::client_ip::resolve_client_ip;
use crate::error::ProxyError;
use crate::rules::ProxyRule;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::http::request::Parts;
use hyper::{Method, Uri};
use std::net::SocketAddr;
use tracing::info;
use url::Url;

/// Sent as `X-Forwarded-Proto` regardless of how the client connected
pub const FORWARDED_PROTO: &str = "http";

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Per-request state, discarded once the response has been sent
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub original_path: String,
    pub rule: ProxyRule,
    pub prefix: String,
    pub upstream_path: String,
    pub client_ip: String,
}

/// Everything needed to issue the upstream call
#[derive(Debug)]
pub struct UpstreamRequest {
    pub method: Method,
    /// Origin-form `path[?query]`, sent on the wire exactly as built
    pub uri: Uri,
    pub headers: HeaderMap,
    pub target: Target,
    pub context: RequestContext,
}

/// A rule target that parsed as an absolute http(s) URL
#[derive(Debug, Clone)]
pub struct Target {
    pub url: Url,
    /// `host[:port]` exactly as configured, used for the upstream `Host` header
    pub authority: String,
    /// Host to connect to, without IPv6 brackets
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn is_https(&self) -> bool {
        self.url.scheme() == "https"
    }
}

pub fn parse_target(target: &str) -> Result<Target, ProxyError> {
    let invalid = |reason: String| ProxyError::InvalidTarget {
        target: target.to_string(),
        reason,
    };

    let url = Url::parse(target).map_err(|e| invalid(e.to_string()))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }

    let host = match url.host_str() {
        Some(h) if !h.is_empty() => h.trim_start_matches('[').trim_end_matches(']').to_string(),
        _ => return Err(invalid("missing host".to_string())),
    };
    let port = url
        .port_or_known_default()
        .ok_or_else(|| invalid("missing port".to_string()))?;
    let authority = configured_authority(target)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| invalid("missing host".to_string()))?
        .to_string();

    Ok(Target {
        url,
        authority,
        host,
        port,
    })
}

/// The `host[:port]` section of `target` as written, without userinfo
fn configured_authority(target: &str) -> Option<&str> {
    let target = target.trim();
    let rest = &target[target.find("://")? + 3..];
    let end = rest
        .find(|c: char| matches!(c, '/' | '\\' | '?' | '#'))
        .unwrap_or(rest.len());
    rest[..end].rsplit('@').next()
}

/// Remove the mount prefix from the front of `path`; an empty rest becomes `/`
pub fn strip_mount_prefix(path: &str, prefix: &str) -> String {
    let suffix = path.strip_prefix(prefix).unwrap_or(path);
    if suffix.is_empty() {
        "/".to_string()
    } else {
        suffix.to_string()
    }
}

/// Join two path pieces with exactly one slash at the junction
pub fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{}/{}", a, b),
        _ => format!("{}{}", a, b),
    }
}

/// Strip hop-by-hop headers, including any named by `Connection`
pub fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in &listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Build the upstream request for `rule`, matched on `prefix`
pub fn translate(
    rule: &ProxyRule,
    prefix: &str,
    parts: &Parts,
    remote_addr: SocketAddr,
) -> Result<UpstreamRequest, ProxyError> {
    let target = parse_target(&rule.target)?;

    let original_path = parts.uri.path().to_string();
    let suffix = strip_mount_prefix(&original_path, prefix);
    let upstream_path = single_joining_slash(target.url.path(), &suffix);

    // Path and query go out byte for byte; no dot-segment or percent normalization
    let path_and_query = match parts.uri.query() {
        Some(query) => format!("{}?{}", upstream_path, query),
        None => upstream_path.clone(),
    };
    let uri: Uri = path_and_query.parse().map_err(|e: hyper::http::uri::InvalidUri| {
        ProxyError::InvalidTarget {
            target: rule.target.clone(),
            reason: e.to_string(),
        }
    })?;

    let client_ip = resolve_client_ip(&parts.headers, remote_addr);
    let inbound_host = parts.headers.get(header::HOST).cloned().or_else(|| {
        parts
            .uri
            .authority()
            .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
    });
    let forwarded_for = append_forwarded_for(&parts.headers, remote_addr);

    let mut headers = parts.headers.clone();
    remove_hop_by_hop_headers(&mut headers);

    // Origin must answer uncompressed so HTML bodies can be rewritten
    headers.remove(header::ACCEPT_ENCODING);

    let host_value = HeaderValue::from_str(&target.authority).map_err(|e| ProxyError::InvalidTarget {
        target: rule.target.clone(),
        reason: e.to_string(),
    })?;
    headers.insert(header::HOST, host_value);

    if let Some(host) = inbound_host {
        headers.insert("x-forwarded-host", host);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static(FORWARDED_PROTO));
    if let Ok(ip) = HeaderValue::from_str(&client_ip) {
        headers.insert("x-real-ip", ip);
    }
    if let Ok(xff) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", xff);
    }

    info!("{} -> {}{}", original_path, target.authority, upstream_path);

    Ok(UpstreamRequest {
        method: parts.method.clone(),
        uri,
        headers,
        target,
        context: RequestContext {
            original_path,
            rule: rule.clone(),
            prefix: prefix.to_string(),
            upstream_path,
            client_ip,
        },
    })
}

fn append_forwarded_for(headers: &HeaderMap, remote_addr: SocketAddr) -> String {
    let prior: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    let peer = remote_addr.ip().to_string();
    if prior.is_empty() {
        peer
    } else {
        format!("{}, {}", prior.join(", "), peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Request;

    fn parts(uri: &str) -> Parts {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("host", "proxy.local:8080")
            .header("accept-encoding", "gzip, br")
            .header("connection", "keep-alive, x-private")
            .header("x-private", "secret")
            .header("cookie", "a=b")
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    fn remote() -> SocketAddr {
        "192.168.1.20:40000".parse().unwrap()
    }

    #[test]
    fn test_single_joining_slash() {
        assert_eq!(single_joining_slash("/t/", "/x"), "/t/x");
        assert_eq!(single_joining_slash("/t", "/x"), "/t/x");
        assert_eq!(single_joining_slash("/t/", "x"), "/t/x");
        assert_eq!(single_joining_slash("/t", "x"), "/t/x");
        assert_eq!(single_joining_slash("/", "/"), "/");
        assert_eq!(single_joining_slash("", "/x"), "/x");
    }

    #[test]
    fn test_strip_mount_prefix() {
        assert_eq!(strip_mount_prefix("/ex/page", "/ex"), "/page");
        assert_eq!(strip_mount_prefix("/ex", "/ex"), "/");
        assert_eq!(strip_mount_prefix("/ex/", "/ex"), "/");
        assert_eq!(strip_mount_prefix("/other", "/ex"), "/other");
    }

    #[test]
    fn test_parse_target_rejects_bad_urls() {
        assert!(matches!(parse_target("not a url"), Err(ProxyError::InvalidTarget { .. })));
        assert!(matches!(parse_target("example.com"), Err(ProxyError::InvalidTarget { .. })));
        assert!(matches!(parse_target("ftp://example.com"), Err(ProxyError::InvalidTarget { .. })));

        let target = parse_target("http://127.0.0.1:3000/base").unwrap();
        assert_eq!(target.authority, "127.0.0.1:3000");
        assert_eq!(target.host, "127.0.0.1");
        assert_eq!(target.port, 3000);
        assert_eq!(target.url.path(), "/base");
        assert!(!target.is_https());
    }

    #[test]
    fn test_parse_target_keeps_authority_as_configured() {
        let target = parse_target("http://Example.com:80").unwrap();
        assert_eq!(target.authority, "Example.com:80");
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 80);

        let target = parse_target("https://user:pw@Docs.Example.com/app/").unwrap();
        assert_eq!(target.authority, "Docs.Example.com");
        assert_eq!(target.port, 443);
        assert!(target.is_https());

        let target = parse_target("http://[::1]:8080/").unwrap();
        assert_eq!(target.authority, "[::1]:8080");
        assert_eq!(target.host, "::1");
    }

    #[test]
    fn test_translate_path_and_query() {
        let rule = ProxyRule::new("ex", "/ex", "https://example.com", true);
        let req = translate(&rule, "/ex", &parts("/ex/page/a?x=1&y=%20z"), remote()).unwrap();

        assert_eq!(req.uri, "/page/a?x=1&y=%20z");
        assert_eq!(req.context.upstream_path, "/page/a");
        assert_eq!(req.context.original_path, "/ex/page/a");
        assert_eq!(req.context.prefix, "/ex");
    }

    #[test]
    fn test_translate_query_with_reserved_characters_is_verbatim() {
        let rule = ProxyRule::new("ex", "/ex", "https://example.com", true);
        let req = translate(&rule, "/ex", &parts("/ex/p?q='a'&r=x&s=a%2Fb;c"), remote()).unwrap();

        assert_eq!(req.uri.query(), Some("q='a'&r=x&s=a%2Fb;c"));
    }

    #[test]
    fn test_translate_keeps_dot_segments_under_base_path() {
        let rule = ProxyRule::new("ex", "/ex", "https://x/app/", true);

        let req = translate(&rule, "/ex", &parts("/ex/%2e%2e/secret"), remote()).unwrap();
        assert_eq!(req.uri.path(), "/app/%2e%2e/secret");
        assert_eq!(req.uri.path(), req.context.upstream_path);

        let req = translate(&rule, "/ex", &parts("/ex/../secret"), remote()).unwrap();
        assert_eq!(req.uri.path(), "/app/../secret");
        assert_eq!(req.uri.path(), req.context.upstream_path);
    }

    #[test]
    fn test_translate_mount_root_and_base_path() {
        let rule = ProxyRule::new("ex", "/ex", "https://example.com/base/", true);

        let req = translate(&rule, "/ex", &parts("/ex"), remote()).unwrap();
        assert_eq!(req.uri, "/base/");

        let req = translate(&rule, "/ex", &parts("/ex/img.png"), remote()).unwrap();
        assert_eq!(req.uri.path(), "/base/img.png");
    }

    #[test]
    fn test_translate_drops_target_query() {
        let rule = ProxyRule::new("ex", "/ex", "https://example.com/?lang=en", true);

        let req = translate(&rule, "/ex", &parts("/ex/page"), remote()).unwrap();
        assert_eq!(req.uri.query(), None);
    }

    #[test]
    fn test_translate_headers() {
        let rule = ProxyRule::new("ex", "/ex", "https://example.com:8443", true);
        let req = translate(&rule, "/ex", &parts("/ex/page"), remote()).unwrap();
        let h = &req.headers;

        assert_eq!(h.get("host").unwrap(), "example.com:8443");
        assert_eq!(req.target.port, 8443);
        assert_eq!(h.get("x-forwarded-host").unwrap(), "proxy.local:8080");
        assert_eq!(h.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(h.get("x-real-ip").unwrap(), "192.168.1.20");
        assert_eq!(h.get("x-forwarded-for").unwrap(), "192.168.1.20");
        assert!(h.get("accept-encoding").is_none());
        assert!(h.get("connection").is_none());
        assert!(h.get("x-private").is_none());
        assert_eq!(h.get("cookie").unwrap(), "a=b");
    }

    #[test]
    fn test_translate_host_header_matches_configured_target() {
        let rule = ProxyRule::new("ex", "/ex", "http://Example.com:80", true);
        let req = translate(&rule, "/ex", &parts("/ex/page"), remote()).unwrap();

        assert_eq!(req.headers.get("host").unwrap(), "Example.com:80");
        assert_eq!(req.target.host, "example.com");
    }

    #[test]
    fn test_translate_extends_forwarded_for() {
        let rule = ProxyRule::new("ex", "/ex", "https://example.com", true);
        let (mut p, _) = Request::builder()
            .uri("/ex/")
            .header("x-forwarded-for", "1.2.3.4, 5.6.7.8")
            .body(())
            .unwrap()
            .into_parts();
        p.method = Method::POST;

        let req = translate(&rule, "/ex", &p, remote()).unwrap();
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.context.client_ip, "1.2.3.4");
        assert_eq!(req.headers.get("x-real-ip").unwrap(), "1.2.3.4");
        assert_eq!(
            req.headers.get("x-forwarded-for").unwrap(),
            "1.2.3.4, 5.6.7.8, 192.168.1.20"
        );
    }

    #[test]
    fn test_translate_invalid_target() {
        let rule = ProxyRule::new("bad", "/bad", "::not-a-url", true);
        let err = translate(&rule, "/bad", &parts("/bad/x"), remote()).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidTarget { .. }));
    }
}
