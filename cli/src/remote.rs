use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use tally_core::error::RemoteError;
use tally_core::models::{ConflictKey, Entity};
use tally_core::remote::{RemoteFilter, RemoteStore};

/// [`RemoteStore`] speaking to a `tally serve` instance.
pub struct HttpRemoteStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("tally-cli/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/api/{path}", self.base_url));
        match self.api_key {
            Some(ref key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let resp = builder
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = error_message(resp).await;
        if status == StatusCode::UNAUTHORIZED {
            Err(RemoteError::Unauthorized(message))
        } else {
            Err(RemoteError::Rejected {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// The server's `{"error": ...}` body, else the status text.
async fn error_message(resp: reqwest::Response) -> String {
    let status = resp.status();
    let fallback = status
        .canonical_reason()
        .unwrap_or("unknown error")
        .to_string();
    match resp.json::<serde_json::Value>().await {
        Ok(body) => body["error"].as_str().map_or(fallback, str::to_string),
        Err(_) => fallback,
    }
}

#[async_trait]
impl<E> RemoteStore<E> for HttpRemoteStore
where
    E: Entity + Serialize + DeserializeOwned,
{
    async fn fetch(&self, filter: &RemoteFilter) -> Result<Vec<E>, RemoteError> {
        let resp = self
            .send(self.request(Method::GET, E::KIND).query(filter))
            .await?;
        resp.json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn upsert(&self, entity: &E, conflict: ConflictKey) -> Result<(), RemoteError> {
        let builder = self
            .request(Method::PUT, E::KIND)
            .query(&[("on_conflict", conflict.columns())])
            .json(entity);
        self.send(builder).await?;
        Ok(())
    }

    async fn delete(&self, entity: &E) -> Result<(), RemoteError> {
        let path = format!("{}/{}", E::KIND, entity.id());
        self.send(self.request(Method::DELETE, &path)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::models::TrackedItem;

    #[tokio::test]
    async fn test_unreachable_server_is_network_error() {
        // Port 9 (discard) on localhost is not expected to run an HTTP server
        let store = HttpRemoteStore::new("http://127.0.0.1:9/", None).unwrap();
        let err = RemoteStore::<TrackedItem>::fetch(&store, &RemoteFilter::user("u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Network(_)), "{err:?}");
        assert!(err.is_reportable());
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let store = HttpRemoteStore::new("http://localhost:8080///", None).unwrap();
        assert_eq!(store.base_url, "http://localhost:8080");
    }
}
