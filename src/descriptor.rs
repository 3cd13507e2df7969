//! Server descriptor
//!
//! The structured form of an access key. Values are immutable once built and
//! are passed by value (or shared reference) from the parser down to the
//! tunnel engine.

use std::fmt;

use bytes::Bytes;

use crate::codec;
use crate::error::{OutlineError, Result};

/// Connection parameters of a Shadowsocks server.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ServerDescriptor {
    method: String,
    password: String,
    host: String,
    port: u16,
    prefix: Option<Bytes>,
}

impl ServerDescriptor {
    /// Build a descriptor, rejecting an empty method or host and port 0.
    pub fn new(
        method: impl Into<String>,
        password: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Result<Self> {
        let method = method.into();
        let host = host.into();

        if method.is_empty() {
            return Err(OutlineError::InvalidDescriptor("empty cipher method".into()));
        }
        if host.is_empty() {
            return Err(OutlineError::InvalidDescriptor("empty host".into()));
        }
        if port == 0 {
            return Err(OutlineError::InvalidDescriptor("port out of range: 0".into()));
        }

        Ok(Self {
            method,
            password: password.into(),
            host,
            port,
            prefix: None,
        })
    }

    /// Attach salt prefix bytes. An empty prefix is treated as absent.
    pub fn with_prefix(mut self, prefix: impl Into<Bytes>) -> Self {
        let prefix = prefix.into();
        self.prefix = if prefix.is_empty() { None } else { Some(prefix) };
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn prefix(&self) -> Option<&[u8]> {
        self.prefix.as_deref()
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn server_address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Render the descriptor as a partially encoded `ss://` link
    /// (`ss://BASE64(method:password)@host:port[/?prefix=..]`).
    pub fn to_uri(&self) -> String {
        let credentials = codec::encode_base64(format!("{}:{}", self.method, self.password).as_bytes());
        let mut uri = format!("ss://{}@{}", credentials, self.server_address());
        if let Some(prefix) = &self.prefix {
            let text = codec::bytes_to_text(prefix);
            uri.push_str("/?prefix=");
            uri.push_str(&urlencoding::encode(&text));
        }
        uri
    }
}

impl fmt::Debug for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerDescriptor")
            .field("method", &self.method)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("prefix_len", &self.prefix.as_ref().map(|p| p.len()))
            .finish()
    }
}
