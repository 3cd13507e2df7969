//! Access-key parser
//!
//! Turns an access key into a [`ServerDescriptor`]. Three wire variants are
//! accepted:
//!
//! - `ss://BASE64(method:password)@host:port[/][?query][#name]` (partial encoding)
//! - `ss://BASE64(method:password@host:port)[#name]` (full encoding)
//! - `ssconf://host/path[#name]`, fetched as `https://host/path`; the body is
//!   either a JSON document or a single `ss://` key (one level only)

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Deserialize;

use crate::codec;
use crate::descriptor::ServerDescriptor;
use crate::error::{OutlineError, Result};
use crate::fetch::RemoteFetcher;

pub const DIRECT_SCHEME: &str = "ss://";
pub const INDIRECTION_SCHEME: &str = "ssconf://";

/// Partial-encoding grammar. The host is either a bracketed IPv6 literal or
/// a run of characters free of URI delimiters.
pub(crate) static PARTIAL_ENCODING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^ss://(?P<credentials>[^@]+)@(?P<host>\[[0-9A-Fa-f:.]+\]|[^:/?#@\[\]]+):(?P<port>\d+)/?(?:\?(?P<query>[^#]*))?(?:#(?P<fragment>.*))?$",
    )
    .expect("partial encoding pattern is valid")
});

/// Parses access keys, using `F` for the `ssconf://` indirection.
pub struct DescriptorParser<F> {
    fetcher: F,
}

impl<F: RemoteFetcher> DescriptorParser<F> {
    pub fn new(fetcher: F) -> Self {
        Self { fetcher }
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Parse an access key into a descriptor.
    pub async fn parse(&self, uri: &str) -> Result<ServerDescriptor> {
        self.parse_named(uri).await.map(|(descriptor, _)| descriptor)
    }

    /// Parse an access key, also returning the display name carried in its
    /// fragment, if any.
    pub async fn parse_named(&self, uri: &str) -> Result<(ServerDescriptor, Option<String>)> {
        let uri = uri.trim();
        if uri.starts_with(INDIRECTION_SCHEME) {
            self.parse_indirection(uri).await
        } else if uri.starts_with(DIRECT_SCHEME) {
            parse_direct(uri)
        } else {
            log::warn!("Rejected access key with unrecognized scheme");
            Err(OutlineError::InvalidDescriptor("unrecognized scheme".into()))
        }
    }

    async fn parse_indirection(&self, uri: &str) -> Result<(ServerDescriptor, Option<String>)> {
        let (without_fragment, fragment) = split_fragment(uri);
        let url = indirection_url(without_fragment);
        let name = fragment.map(decode_name);

        log::debug!("Resolving ssconf key through {}", url);
        let body = self.fetcher.fetch(&url).await?;
        let body = body.trim();

        if body.starts_with(DIRECT_SCHEME) {
            log::debug!("ssconf document is an embedded ss:// key");
            let (descriptor, embedded_name) = parse_direct(body)?;
            return Ok((descriptor, name.or(embedded_name)));
        }

        let document: ConfDocument = serde_json::from_str(body)?;
        let descriptor = document.into_descriptor()?;
        log::debug!("Resolved ssconf document: {:?}", descriptor);
        Ok((descriptor, name))
    }
}

/// Parse an `ss://` key without any network access.
pub fn parse_direct(uri: &str) -> Result<(ServerDescriptor, Option<String>)> {
    let remainder = uri
        .strip_prefix(DIRECT_SCHEME)
        .ok_or_else(|| OutlineError::InvalidDescriptor("unrecognized scheme".into()))?;

    if is_partially_encoded(remainder) {
        log::debug!("Detected partial encoding format");
        parse_partial(uri)
    } else {
        log::debug!("Detected full encoding format");
        parse_full(remainder)
    }
}

/// Host component of a key's authority, for display. Never fails.
pub fn extract_server_host(uri: &str) -> Option<String> {
    let uri = uri.trim();
    if uri.starts_with(DIRECT_SCHEME) {
        if let Ok((descriptor, _)) = parse_direct(uri) {
            return Some(descriptor.host().to_string());
        }
    }

    let parsed = url::Url::parse(uri).ok()?;
    let host = parsed.host_str()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// `ssconf://rest` becomes `https://rest`.
pub(crate) fn indirection_url(without_fragment: &str) -> String {
    format!("https://{}", &without_fragment[INDIRECTION_SCHEME.len()..])
}

/// A literal `@` outside the fragment selects the partial encoding; a
/// percent-encoded `%40` does not count.
pub(crate) fn is_partially_encoded(remainder: &str) -> bool {
    split_fragment(remainder).0.contains('@')
}

pub(crate) fn split_fragment(s: &str) -> (&str, Option<&str>) {
    match s.split_once('#') {
        Some((head, fragment)) => (head, Some(fragment)),
        None => (s, None),
    }
}

/// Credential segment as base64 text, after undoing percent-encoding
/// (keys in the wild carry `%3D` padding).
pub(crate) fn credential_payload(caps: &Captures<'_>) -> Result<Vec<u8>> {
    let raw = &caps["credentials"];
    let unescaped = codec::percent_decode(raw)?;
    codec::decode_base64(&unescaped)
}

fn parse_partial(uri: &str) -> Result<(ServerDescriptor, Option<String>)> {
    let caps = PARTIAL_ENCODING
        .captures(uri)
        .ok_or_else(|| OutlineError::InvalidDescriptor("invalid link format".into()))?;

    let credentials = codec::decode_utf8(credential_payload(&caps)?)?;
    let (method, password) = credentials
        .split_once(':')
        .ok_or_else(|| OutlineError::InvalidDescriptor("invalid decoded info format".into()))?;

    let host = caps["host"].trim_start_matches('[').trim_end_matches(']');
    let port = parse_port(&caps["port"])?;

    let mut descriptor = ServerDescriptor::new(method, password, host, port)?;

    if let Some(query) = caps.name("query") {
        let params = codec::parse_query(query.as_str());
        if let Some(prefix) = params.get("prefix") {
            descriptor = descriptor.with_prefix(codec::text_to_bytes(prefix));
        }
    }

    let name = caps.name("fragment").map(|m| decode_name(m.as_str()));
    Ok((descriptor, name))
}

fn parse_full(remainder: &str) -> Result<(ServerDescriptor, Option<String>)> {
    let (encoded, fragment) = split_fragment(remainder);
    let decoded = codec::decode_utf8(codec::decode_base64(encoded)?)?;

    let (user_info, host_port) = decoded
        .split_once('@')
        .ok_or_else(|| OutlineError::InvalidDescriptor("invalid decoded data format".into()))?;
    if host_port.contains('@') {
        return Err(OutlineError::InvalidDescriptor(
            "invalid decoded data format: more than one '@'".into(),
        ));
    }

    let (method, password) = user_info.split_once(':').ok_or_else(|| {
        OutlineError::InvalidDescriptor("invalid method and password format".into())
    })?;
    let (host, port) = host_port
        .split_once(':')
        .ok_or_else(|| OutlineError::InvalidDescriptor("invalid host and port format".into()))?;

    let port = parse_port(port.trim_end_matches('/'))?;
    let descriptor = ServerDescriptor::new(method, password, host, port)?;
    Ok((descriptor, fragment.map(decode_name)))
}

fn parse_port(text: &str) -> Result<u16> {
    let port: u16 = text
        .trim()
        .parse()
        .map_err(|_| OutlineError::InvalidDescriptor(format!("invalid port number: {}", text)))?;
    if port == 0 {
        return Err(OutlineError::InvalidDescriptor("port out of range: 0".into()));
    }
    Ok(port)
}

pub(crate) fn decode_name(fragment: &str) -> String {
    codec::percent_decode(fragment).unwrap_or_else(|_| fragment.to_string())
}

/// JSON document served behind an `ssconf://` key.
#[derive(Debug, Deserialize)]
struct ConfDocument {
    server: String,
    server_port: PortField,
    password: String,
    method: String,
    #[serde(default)]
    prefix: Option<String>,
}

/// `server_port` is served both as a number and as a numeric string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortField {
    Number(u64),
    Text(String),
}

impl ConfDocument {
    fn into_descriptor(self) -> Result<ServerDescriptor> {
        let port = match self.server_port {
            PortField::Number(n) => u16::try_from(n)
                .map_err(|_| OutlineError::InvalidDescriptor(format!("port out of range: {}", n)))?,
            PortField::Text(text) => parse_port(&text)?,
        };

        let descriptor = ServerDescriptor::new(self.method, self.password, self.server, port)?;
        Ok(match self.prefix {
            Some(prefix) => descriptor.with_prefix(codec::text_to_bytes(&prefix)),
            None => descriptor,
        })
    }
}
