use std::time;

use async_trait::async_trait;
use event_common::event::is_addressable;
use http::StatusCode;
use reqwest::header;
use serde_json::Value;
use url::Url;

use crate::error::StoreError;

/// The document store operations the worker relies on.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn index_exists(&self, index: &str) -> Result<bool, StoreError>;

    /// Create `index` with `body` as settings and mappings. Fails with an error for which
    /// `is_already_exists` holds when someone else created it first.
    async fn create_index(&self, index: &str, body: &Value) -> Result<(), StoreError>;

    /// Write `document` under `id`, replacing any previous version, and make it searchable
    /// before returning.
    async fn put_document(&self, index: &str, id: &str, document: &Value)
        -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// OpenSearch over its REST API.
pub struct OpenSearchStore {
    base: Url,
    client: reqwest::Client,
}

impl OpenSearchStore {
    pub fn new(url: &str, timeout: time::Duration) -> Result<Self, StoreError> {
        let base = Url::parse(url).map_err(|e| StoreError::InvalidUrl(format!("{url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(StoreError::InvalidUrl(url.to_owned()));
        }

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("event-indexer-worker")
            .timeout(timeout)
            .build()?;

        Ok(Self { base, client })
    }

    /// Verify the store answers, for use when connecting.
    pub async fn connect(url: &str, timeout: time::Duration) -> Result<Self, StoreError> {
        let store = Self::new(url, timeout)?;
        store.ping().await?;
        Ok(store)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

async fn status_error(response: reqwest::Response) -> StoreError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    StoreError::Status { status, body }
}

#[async_trait]
impl DocumentStore for OpenSearchStore {
    async fn index_exists(&self, index: &str) -> Result<bool, StoreError> {
        let response = self.client.head(self.endpoint(&[index])?).send().await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(status_error(response).await),
        }
    }

    async fn create_index(&self, index: &str, body: &Value) -> Result<(), StoreError> {
        let response = self
            .client
            .put(self.endpoint(&[index])?)
            .json(body)
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(());
        }
        match status_error(response).await {
            error if error.is_already_exists() => Err(StoreError::AlreadyExists(index.to_owned())),
            error => Err(error),
        }
    }

    async fn put_document(
        &self,
        index: &str,
        id: &str,
        document: &Value,
    ) -> Result<(), StoreError> {
        if !is_addressable(id) {
            return Err(StoreError::InvalidDocumentId(id.to_owned()));
        }
        let mut url = self.endpoint(&[index, "_doc", id])?;
        url.query_pairs_mut().append_pair("refresh", "true");

        let response = self.client.put(url).json(document).send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(response).await)
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let response = self.client.get(self.base.clone()).send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(response).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use httpmock::Method::HEAD;
    use serde_json::json;

    fn store(server: &MockServer) -> OpenSearchStore {
        OpenSearchStore::new(&server.base_url(), time::Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn index_exists_maps_head_status() {
        let server = MockServer::start_async().await;
        let present = server
            .mock_async(|when, then| {
                when.method(HEAD).path("/security-events-2024.03.05");
                then.status(200);
            })
            .await;
        let absent = server
            .mock_async(|when, then| {
                when.method(HEAD).path("/agent-events-2024.03.05");
                then.status(404);
            })
            .await;

        let store = store(&server);

        assert!(store
            .index_exists("security-events-2024.03.05")
            .await
            .unwrap());
        assert!(!store.index_exists("agent-events-2024.03.05").await.unwrap());
        present.assert_async().await;
        absent.assert_async().await;
    }

    #[tokio::test]
    async fn create_index_reports_race_as_already_exists() {
        let server = MockServer::start_async().await;
        let body = json!({"settings": {"number_of_shards": 1}});
        let create = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/agent-events-2024.03.05")
                    .json_body(json!({"settings": {"number_of_shards": 1}}));
                then.status(400).json_body(json!({
                    "error": {"type": "resource_already_exists_exception"},
                    "status": 400
                }));
            })
            .await;

        let error = store(&server)
            .create_index("agent-events-2024.03.05", &body)
            .await
            .unwrap_err();

        assert!(error.is_already_exists());
        create.assert_async().await;
    }

    #[tokio::test]
    async fn create_index_surfaces_other_failures() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path("/agent-events-2024.03.05");
                then.status(400).json_body(json!({
                    "error": {"type": "mapper_parsing_exception"},
                    "status": 400
                }));
            })
            .await;

        let error = store(&server)
            .create_index("agent-events-2024.03.05", &json!({}))
            .await
            .unwrap_err();

        assert!(!error.is_already_exists());
        assert!(matches!(
            error,
            StoreError::Status {
                status: StatusCode::BAD_REQUEST,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn put_document_overwrites_by_id_with_refresh() {
        let server = MockServer::start_async().await;
        let document = json!({"event_id": "sec-1", "threat_type": "malware"});
        let put = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/security-events-2024.03.05/_doc/sec-1")
                    .query_param("refresh", "true")
                    .json_body(json!({"event_id": "sec-1", "threat_type": "malware"}));
                then.status(200).json_body(json!({"result": "updated"}));
            })
            .await;

        store(&server)
            .put_document("security-events-2024.03.05", "sec-1", &document)
            .await
            .unwrap();

        put.assert_async().await;
    }

    #[tokio::test]
    async fn put_document_fails_on_mapping_conflict() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path("/security-events-2024.03.05/_doc/sec-2");
                then.status(400)
                    .json_body(json!({"error": {"type": "mapper_parsing_exception"}}));
            })
            .await;

        let result = store(&server)
            .put_document(
                "security-events-2024.03.05",
                "sec-2",
                &json!({"source_ip": "not-an-ip"}),
            )
            .await;

        assert!(matches!(result, Err(StoreError::Status { .. })));
    }

    #[tokio::test]
    async fn dot_document_ids_are_never_sent() {
        let server = MockServer::start_async().await;
        let collapsed = server
            .mock_async(|when, then| {
                when.method(PUT).path("/agent-events-2024.03.05/_doc");
                then.status(400);
            })
            .await;
        let store = store(&server);

        for id in [".", ".."] {
            let result = store
                .put_document("agent-events-2024.03.05", id, &json!({"event_id": id}))
                .await;
            assert!(matches!(result, Err(StoreError::InvalidDocumentId(ref got)) if got == id));
        }

        collapsed.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn document_id_is_encoded_as_a_single_segment() {
        let server = MockServer::start_async().await;
        let store = store(&server);

        let url = store
            .endpoint(&["agent-events-2024.03.05", "_doc", "a/b"])
            .unwrap();
        assert_eq!(url.path(), "/agent-events-2024.03.05/_doc/a%2Fb");
        let url = store
            .endpoint(&["agent-events-2024.03.05", "_doc", "..."])
            .unwrap();
        assert_eq!(url.path(), "/agent-events-2024.03.05/_doc/...");
    }

    #[tokio::test]
    async fn base_url_path_is_kept() {
        let server = MockServer::start_async().await;
        let ping = server
            .mock_async(|when, then| {
                when.method(GET).path("/search/");
                then.status(200).json_body(json!({"version": {"number": "2.11.0"}}));
            })
            .await;
        let head = server
            .mock_async(|when, then| {
                when.method(HEAD).path("/search/agent-events-2024.03.05");
                then.status(404);
            })
            .await;

        let store = OpenSearchStore::connect(&server.url("/search/"), time::Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!store.index_exists("agent-events-2024.03.05").await.unwrap());

        ping.assert_async().await;
        head.assert_async().await;
    }

    #[test]
    fn rejects_unusable_urls() {
        assert!(OpenSearchStore::new("not a url", time::Duration::from_secs(1)).is_err());
        assert!(OpenSearchStore::new("mailto:ops@example.com", time::Duration::from_secs(1)).is_err());
    }
}
