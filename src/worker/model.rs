use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

pub const OFFLINE_PAGE_HTML: &str = r#"<!doctype html>
<html>
  <head><meta charset="utf-8"><title>Offline</title></head>
  <body>
    <h1>Offline</h1>
    <p>You are offline and this page has not been cached yet.</p>
  </body>
</html>
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// A navigation that expects an HTML document.
    Document,
    Resource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub path: String,
    pub kind: RequestKind,
}

impl FetchRequest {
    pub fn document(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: RequestKind::Document,
        }
    }

    pub fn resource(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: RequestKind::Resource,
        }
    }

    /// Guesses the request kind the way a navigation would look:
    /// HTML accept headers and extension-less paths are documents.
    pub fn infer(path: impl Into<String>, accept: Option<&str>) -> Self {
        let path = path.into();
        let wants_html = accept.is_some_and(|a| a.to_ascii_lowercase().contains("text/html"));
        let last_segment = path
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .rsplit('/')
            .next()
            .unwrap_or_default();
        let kind = if wants_html || !last_segment.contains('.') {
            RequestKind::Document
        } else {
            RequestKind::Resource
        };
        Self { path, kind }
    }

    /// The path without query or fragment, as prefetch stores it.
    pub fn cache_key(&self) -> &str {
        self.path.split(['?', '#']).next().unwrap_or(&self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, content_type: Option<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn offline_page() -> Self {
        Self::new(
            503,
            Some("text/html; charset=utf-8".to_owned()),
            OFFLINE_PAGE_HTML,
        )
    }

    pub fn network_error() -> Self {
        Self::new(503, Some("text/plain; charset=utf-8".to_owned()), "network error")
    }
}

mod body_base64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}

/// Messages the page posts to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    CacheWarm,
    ClearCache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearCacheAck {
    pub success: bool,
}

/// A posted message plus the reply port the sender listens on.
#[derive(Debug)]
pub struct Envelope {
    pub message: ControlMessage,
    pub reply: Option<oneshot::Sender<ClearCacheAck>>,
}
