//! Remote key-value service reached over HTTP.
//!
//! Entries live at `{base_url}/{prefix}{key}`: `GET` reads (404 is a miss),
//! `PUT` writes the raw envelope bytes, `DELETE` removes. `DELETE` on
//! `{base_url}/{prefix}` clears the namespace. The TTL is forwarded as an
//! `X-Cache-TTL` header in seconds so the service may expire entries itself;
//! the cache still checks expiry locally.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use tracing::debug;

use super::{BackendStats, CacheBackend};

pub const TTL_HEADER: &str = "X-Cache-TTL";

#[derive(Debug, Clone)]
pub struct RemoteBackend {
    client: Client,
    base_url: String,
    prefix: String,
}

impl RemoteBackend {
    pub fn new(base_url: &str, prefix: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build cache http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            prefix: prefix.to_string(),
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}{}", self.base_url, self.prefix, key)
    }
}

impl CacheBackend for RemoteBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let url = self.url(key);
        let response = self
            .client
            .get(&url)
            .send()
            .with_context(|| format!("GET {url}"))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let bytes = response.bytes().with_context(|| format!("read body of {url}"))?;
                debug!(bytes = bytes.len(), "remote cache hit");
                Ok(Some(bytes.to_vec()))
            }
            status => Err(anyhow!("GET {url} returned {status}")),
        }
    }

    fn set(&self, key: &str, bytes: &[u8], ttl: Option<Duration>) -> Result<()> {
        let url = self.url(key);
        let mut request = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(bytes.to_vec());
        if let Some(ttl) = ttl {
            request = request.header(TTL_HEADER, ttl.as_secs().max(1).to_string());
        }
        request
            .send()
            .with_context(|| format!("PUT {url}"))?
            .error_for_status()
            .with_context(|| format!("PUT {url}"))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.send_delete(&self.url(key))
    }

    fn clear(&self) -> Result<()> {
        self.send_delete(&self.url(""))
    }

    /// The service does not report sizes.
    fn stats(&self) -> Result<BackendStats> {
        Ok(BackendStats::default())
    }
}

impl RemoteBackend {
    fn send_delete(&self, url: &str) -> Result<()> {
        let response = self
            .client
            .delete(url)
            .send()
            .with_context(|| format!("DELETE {url}"))?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(anyhow!("DELETE {url} returned {status}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn backend(server: &Server) -> RemoteBackend {
        RemoteBackend::new(&server.url(), "orch/", Duration::from_secs(5)).expect("client")
    }

    #[test]
    fn get_maps_404_to_miss_and_200_to_bytes() {
        let mut server = Server::new();
        let miss = server
            .mock("GET", "/orch/execution:missing")
            .with_status(404)
            .create();
        let hit = server
            .mock("GET", "/orch/execution:1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"v":1}"#)
            .create();

        let backend = backend(&server);
        assert_eq!(backend.get("execution:missing").expect("miss"), None);
        assert_eq!(
            backend.get("execution:1").expect("hit"),
            Some(br#"{"v":1}"#.to_vec())
        );
        miss.assert();
        hit.assert();
    }

    #[test]
    fn get_server_error_is_an_error() {
        let mut server = Server::new();
        let _m = server.mock("GET", "/orch/k").with_status(500).create();
        let err = backend(&server).get("k").unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[test]
    fn put_sends_envelope_and_ttl_header() {
        let mut server = Server::new();
        let with_ttl = server
            .mock("PUT", "/orch/execution:1")
            .match_header(TTL_HEADER, "60")
            .match_header("content-type", "application/json")
            .match_body(r#"{"v":1}"#)
            .with_status(204)
            .create();
        let without_ttl = server
            .mock("PUT", "/orch/execution:2")
            .match_header(TTL_HEADER, Matcher::Missing)
            .with_status(204)
            .create();

        let backend = backend(&server);
        backend
            .set("execution:1", br#"{"v":1}"#, Some(Duration::from_secs(60)))
            .expect("put with ttl");
        backend
            .set("execution:2", br#"{"v":2}"#, None)
            .expect("put without ttl");
        with_ttl.assert();
        without_ttl.assert();
    }

    #[test]
    fn put_rejected_by_service_is_an_error() {
        let mut server = Server::new();
        let _m = server.mock("PUT", "/orch/k").with_status(507).create();
        assert!(backend(&server).set("k", b"{}", None).is_err());
    }

    #[test]
    fn delete_and_clear_target_key_and_prefix() {
        let mut server = Server::new();
        let delete = server
            .mock("DELETE", "/orch/execution:1")
            .with_status(204)
            .create();
        let gone = server
            .mock("DELETE", "/orch/execution:2")
            .with_status(404)
            .create();
        let clear = server.mock("DELETE", "/orch/").with_status(204).create();

        let backend = backend(&server);
        backend.delete("execution:1").expect("delete");
        backend.delete("execution:2").expect("already gone");
        backend.clear().expect("clear");
        delete.assert();
        gone.assert();
        clear.assert();
    }

    #[test]
    fn unreachable_service_is_an_error() {
        let backend = RemoteBackend::new("http://127.0.0.1:9", "", Duration::from_secs(2))
            .expect("client");
        assert!(backend.get("k").is_err());
    }
}
