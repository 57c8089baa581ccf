//! HTML response rewriting
//! Links pointing at the origin are mapped back under the mount prefix

use crate::error::ProxyError;
use crate::forward::parse_target;
use crate::rules::ProxyRule;
use bytes::Bytes;
use flate2::read::MultiGzDecoder;
use hyper::header::{self, HeaderMap, HeaderValue};
use regex::bytes::{Captures, Regex};
use std::io::Read;
use tracing::warn;

/// How the upstream body is encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyEncoding {
    Identity,
    Gzip,
    /// Anything else; the body is left untouched
    Unsupported(String),
}

impl BodyEncoding {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let value = headers
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_default();

        match value.as_str() {
            "" | "identity" => BodyEncoding::Identity,
            "gzip" | "x-gzip" => BodyEncoding::Gzip,
            _ => BodyEncoding::Unsupported(value),
        }
    }
}

/// Whether the response declares an HTML content type
pub fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("text/html"))
}

/// Literal link substitution for `href`, `src` and `action` attributes
///
/// This is pattern matching, not HTML parsing. Unquoted attributes, links in
/// scripts or stylesheets, and differently-cased URLs are left alone.
pub struct LinkRewriter {
    absolute: Regex,
    protocol_relative: Regex,
    prefix: String,
}

impl LinkRewriter {
    /// `target` is the configured base URL as written, `host` its authority
    pub fn new(target: &str, host: &str, prefix: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            absolute: attribute_pattern(&regex::escape(target))?,
            protocol_relative: attribute_pattern(&format!("//{}", regex::escape(host)))?,
            prefix: prefix.to_string(),
        })
    }

    pub fn rewrite(&self, html: &[u8]) -> Vec<u8> {
        let pass = self.absolute.replace_all(html, |caps: &Captures| self.replacement(caps));
        let pass = self
            .protocol_relative
            .replace_all(&pass, |caps: &Captures| self.replacement(caps));
        pass.into_owned()
    }

    fn replacement(&self, caps: &Captures) -> Vec<u8> {
        let mut out = Vec::with_capacity(caps[0].len());
        out.extend_from_slice(&caps[1]);
        out.push(b'=');
        out.extend_from_slice(&caps[2]);
        out.extend_from_slice(self.prefix.as_bytes());
        if let Some(rest) = caps.get(3) {
            out.extend_from_slice(rest.as_bytes());
        }
        out.extend_from_slice(&caps[4]);
        out
    }
}

fn attribute_pattern(origin: &str) -> Result<Regex, regex::Error> {
    // Bodies are not assumed to be UTF-8, so the path class matches raw bytes
    Regex::new(&format!(
        r#"(href|src|action)=(["']){}(/(?-u:[^"'])*)?(["'])"#,
        origin
    ))
}

/// Rewrites buffered HTML bodies for one matched rule
pub struct ResponseRewriter {
    links: LinkRewriter,
    max_body_bytes: usize,
}

impl ResponseRewriter {
    pub fn for_rule(rule: &ProxyRule, prefix: &str, max_body_bytes: usize) -> Result<Self, ProxyError> {
        let target = parse_target(&rule.target)?;
        let links = LinkRewriter::new(&rule.target, &target.authority, prefix).map_err(|e| {
            ProxyError::InvalidTarget {
                target: rule.target.clone(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            links,
            max_body_bytes,
        })
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Rewrite a complete upstream body and fix up the framing headers.
    ///
    /// Returns the body unchanged (headers untouched) when the encoding is
    /// not supported or the decoded size exceeds the buffering limit.
    pub fn rewrite(&self, headers: &mut HeaderMap, body: Bytes) -> Result<Bytes, ProxyError> {
        let decoded = match BodyEncoding::from_headers(headers) {
            BodyEncoding::Identity => body.to_vec(),
            BodyEncoding::Gzip => match gunzip_limited(&body, self.max_body_bytes)? {
                Some(decoded) => decoded,
                None => {
                    warn!(
                        "Decoded HTML exceeds {} bytes, passing through unmodified",
                        self.max_body_bytes
                    );
                    return Ok(body);
                }
            },
            BodyEncoding::Unsupported(encoding) => {
                warn!("Cannot rewrite HTML with Content-Encoding '{}', passing through", encoding);
                return Ok(body);
            }
        };

        let rewritten = Bytes::from(self.links.rewrite(&decoded));

        headers.remove(header::CONTENT_ENCODING);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(rewritten.len()));

        Ok(rewritten)
    }
}

/// Decompress gzip (all members), giving up with `None` once more than `limit` bytes come out
fn gunzip_limited(body: &[u8], limit: usize) -> Result<Option<Vec<u8>>, ProxyError> {
    let mut decoded = Vec::new();
    MultiGzDecoder::new(body)
        .take(limit as u64 + 1)
        .read_to_end(&mut decoded)?;

    if decoded.len() > limit {
        return Ok(None);
    }
    Ok(Some(decoded))
}
