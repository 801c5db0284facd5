//! Request data captured when a connection is opened.

use axum::http::{HeaderMap, Uri};
use percent_encoding::{NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

use crate::errors::TransportError;

/// Query parameter selecting the namespace a session attaches to.
pub const NAMESPACE_PARAM: &str = "nsp";

/// Snapshot of the opening request.
#[derive(Clone, Debug, Default)]
pub struct Handshake {
    uri: Uri,
    headers: HeaderMap,
}

impl Handshake {
    /// Capture a request.
    pub fn new(uri: Uri, headers: HeaderMap) -> Self {
        Self { uri, headers }
    }

    /// Capture a request that has no headers.
    pub fn from_uri(uri: Uri) -> Self {
        Self::new(uri, HeaderMap::new())
    }

    /// Handshake for an in-process client attaching to `namespace`.
    pub fn for_namespace(namespace: &str) -> Result<Self, TransportError> {
        let encoded = utf8_percent_encode(namespace, NON_ALPHANUMERIC);
        let uri = format!("/?{NAMESPACE_PARAM}={encoded}")
            .parse()
            .map_err(|e: axum::http::uri::InvalidUri| {
                TransportError::InvalidHandshake(e.to_string())
            })?;
        Ok(Self::from_uri(uri))
    }

    /// Request URI.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of a query parameter, form-decoded (`+` is a space,
    /// `%XX` escapes are resolved).
    pub fn query(&self, key: &str) -> Option<String> {
        self.uri.query()?.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (form_decode(k) == key).then(|| form_decode(v))
        })
    }

    /// Namespace requested by the client, `/` when absent.
    pub fn namespace(&self) -> String {
        match self.query(NAMESPACE_PARAM) {
            Some(name) if !name.is_empty() => normalize_namespace(&name),
            _ => "/".to_owned(),
        }
    }
}

fn form_decode(raw: &str) -> String {
    percent_decode_str(&raw.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}

/// Ensure a namespace name starts with `/`.
pub fn normalize_namespace(name: &str) -> String {
    if name.starts_with('/') {
        name.to_owned()
    } else {
        format!("/{name}")
    }
}
