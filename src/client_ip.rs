//! Client IP derivation for header propagation and logging
//!
//! The result is taken from client-controlled headers and is trivially
//! spoofable. Never use it for authentication or rate limiting.

use hyper::HeaderMap;
use std::net::SocketAddr;

/// First `X-Forwarded-For` entry, then `X-Real-IP`, then the socket peer IP
pub fn resolve_client_ip(headers: &HeaderMap, remote_addr: SocketAddr) -> String {
    if let Some(xff) = header_str(headers, "x-forwarded-for") {
        return xff.split(',').next().unwrap_or_default().trim().to_string();
    }

    if let Some(real_ip) = header_str(headers, "x-real-ip") {
        return real_ip.to_string();
    }

    remote_addr.ip().to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn remote() -> SocketAddr {
        "10.0.0.7:51234".parse().unwrap()
    }

    #[test]
    fn test_first_forwarded_for_entry() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4, 5.6.7.8"));
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));

        assert_eq!(resolve_client_ip(&headers, remote()), "1.2.3.4");
    }

    #[test]
    fn test_forwarded_for_is_trimmed() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("  1.2.3.4  "));

        assert_eq!(resolve_client_ip(&headers, remote()), "1.2.3.4");
    }

    #[test]
    fn test_real_ip_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));

        assert_eq!(resolve_client_ip(&headers, remote()), "9.9.9.9");
    }

    #[test]
    fn test_remote_addr_without_port() {
        assert_eq!(resolve_client_ip(&HeaderMap::new(), remote()), "10.0.0.7");

        let v6: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        assert_eq!(resolve_client_ip(&HeaderMap::new(), v6), "2001:db8::1");
    }
}
