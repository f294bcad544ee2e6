use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use url::Url;

use crate::worker::model::Response;

/// The network, as seen by the worker.
///
/// `Err` means no response arrived at all; HTTP error statuses are `Ok`.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, path: &str) -> anyhow::Result<Response>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    origin: Url,
}

impl HttpFetcher {
    pub fn new(origin: Url) -> anyhow::Result<Self> {
        if origin.scheme() != "http" && origin.scheme() != "https" {
            anyhow::bail!("origin must be http/https: {origin}");
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build origin http client")?;
        Ok(Self { client, origin })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Places an origin-relative `path` (with optional query) on the origin.
    ///
    /// Anything that could name another host, such as `//host/x`, is refused.
    pub fn resolve(&self, path: &str) -> anyhow::Result<Url> {
        if !path.starts_with('/') || path.starts_with("//") || path.starts_with("/\\") {
            anyhow::bail!("request path must be origin-relative: {path:?}");
        }
        let path = path.split('#').next().unwrap_or(path);
        let (path, query) = match path.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path, None),
        };

        let mut url = self.origin.clone();
        url.set_path(path);
        url.set_query(query);
        url.set_fragment(None);
        if url.origin() != self.origin.origin() {
            anyhow::bail!("{url} is outside origin {}", self.origin);
        }
        Ok(url)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, path: &str) -> anyhow::Result<Response> {
        let url = self.resolve(path)?;

        let response = self
            .client
            .get(url.clone())
            .header(
                USER_AGENT,
                concat!("dexie-offline/", env!("CARGO_PKG_VERSION")),
            )
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response
            .bytes()
            .await
            .with_context(|| format!("read body: {url}"))?;

        Ok(Response::new(status, content_type, body.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_origins() -> anyhow::Result<()> {
        let origin = Url::parse("file:///tmp/site")?;
        assert!(HttpFetcher::new(origin).is_err());

        let origin = Url::parse("https://dexie.org/")?;
        assert_eq!(HttpFetcher::new(origin)?.origin().as_str(), "https://dexie.org/");
        Ok(())
    }

    #[test]
    fn resolve_stays_on_the_origin() -> anyhow::Result<()> {
        let fetcher = HttpFetcher::new(Url::parse("http://localhost:3000/")?)?;

        let url = fetcher.resolve("/docs/guide?ref=nav#setup")?;
        assert_eq!(url.as_str(), "http://localhost:3000/docs/guide?ref=nav");

        for path in ["//evil.example/steal", "/\\evil.example/steal", "evil.example", ""] {
            assert!(fetcher.resolve(path).is_err(), "accepted {path:?}");
        }
        Ok(())
    }
}
