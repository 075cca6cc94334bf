//! HTTP implementation of the remote send port.
//!
//! Delivery is a POST per item; the response status is classified into the
//! error taxonomy the retry policy acts on.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use tillsync_domain::{ErrorCategory, QueueItem, Result as DomainResult, TillSyncError};
use tracing::debug;

use tillsync_core::sync::ports::{RemoteSendClient, SendFailure};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote send client over HTTP.
pub struct HttpSendClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSendClient {
    pub fn new(base_url: impl Into<String>) -> DomainResult<Self> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> DomainResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TillSyncError::Network(e.to_string()))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl RemoteSendClient for HttpSendClient {
    async fn send(&self, item: &QueueItem) -> std::result::Result<(), SendFailure> {
        let url = format!("{}/v1/sync/{}", self.base_url, item.entity_type);
        let body = json!({
            "id": item.id,
            "store_id": item.store_id,
            "entity_id": item.entity_id,
            "operation": item.operation,
            "direction": item.direction,
            "attempt": item.attempt_count + 1,
            "payload": item.payload,
        });

        let response = match self.client.post(&url).json(&body).send().await {
            Ok(response) => response,
            Err(err) => return Err(classify_transport_error(&err)),
        };

        let status = response.status();
        if status.is_success() {
            debug!(
                target: "tillsync::http",
                item_id = %item.id,
                status = status.as_u16(),
                "item delivered"
            );
            return Ok(());
        }

        let detail = response.text().await.unwrap_or_default();
        Err(classify_status(status, &detail))
    }
}

fn classify_status(status: StatusCode, detail: &str) -> SendFailure {
    let category = match status {
        StatusCode::CONFLICT => ErrorCategory::Conflict,
        StatusCode::UNPROCESSABLE_ENTITY => ErrorCategory::Structural,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => ErrorCategory::Transient,
        s if s.is_server_error() => ErrorCategory::Transient,
        s if s.is_client_error() => ErrorCategory::Permanent,
        _ => ErrorCategory::Unknown,
    };
    SendFailure::new(category, format!("HTTP {}: {}", status.as_u16(), detail))
}

fn classify_transport_error(err: &reqwest::Error) -> SendFailure {
    let category = if err.is_timeout() || err.is_connect() || err.is_request() {
        ErrorCategory::Transient
    } else {
        ErrorCategory::Unknown
    };
    SendFailure::new(category, err.to_string())
}

#[cfg(test)]
mod tests {
    use tillsync_domain::{SyncDirection, SyncOperation};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn item() -> QueueItem {
        QueueItem::new(
            "store-1",
            "sale",
            "sale-1",
            SyncOperation::Create,
            SyncDirection::Push,
            r#"{"total":10}"#,
        )
    }

    async fn client_for(server: &MockServer) -> HttpSendClient {
        HttpSendClient::new(server.uri()).expect("client built")
    }

    #[tokio::test]
    async fn accepted_response_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sync/sale"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert!(client.send(&item()).await.is_ok());
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let failure = client.send(&item()).await.expect_err("should fail");
        assert_eq!(failure.category, ErrorCategory::Transient);
    }

    #[tokio::test]
    async fn conflict_is_classified_as_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409).set_body_string("version mismatch"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let failure = client.send(&item()).await.expect_err("should fail");
        assert_eq!(failure.category, ErrorCategory::Conflict);
        assert!(failure.message.contains("version mismatch"));
    }

    #[tokio::test]
    async fn validation_failure_is_structural() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let failure = client.send(&item()).await.expect_err("should fail");
        assert_eq!(failure.category, ErrorCategory::Structural);
    }

    #[tokio::test]
    async fn other_client_errors_are_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let failure = client.send(&item()).await.expect_err("should fail");
        assert_eq!(failure.category, ErrorCategory::Permanent);
    }

    #[tokio::test]
    async fn rate_limiting_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let failure = client.send(&item()).await.expect_err("should fail");
        assert_eq!(failure.category, ErrorCategory::Transient);
    }

    #[tokio::test]
    async fn connection_failure_is_transient() {
        // Nothing listens on this port.
        let client = HttpSendClient::with_timeout("http://127.0.0.1:1", Duration::from_secs(2))
            .expect("client built");
        let failure = client.send(&item()).await.expect_err("should fail");
        assert_eq!(failure.category, ErrorCategory::Transient);
    }
}
