//! JSON-over-HTTP provider adapters.
//!
//! | Response | `ProviderError` |
//! |---|---|
//! | send failed / timed out | `Transport` |
//! | 429 | `RateLimited` (`Retry-After` seconds, if present) |
//! | 408, 5xx | `Unavailable` |
//! | other 4xx | `Rejected` |
//! | 2xx with an undecodable body | `Malformed` |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use reqwest::header::RETRY_AFTER;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use rewardflow_core::TenantId;
use rewardflow_events::Recipient;

use super::{Notification, NotificationProvider, ProviderError, RewardProvider, TenantResolver};

const IDEMPOTENCY_KEY: &str = "Idempotency-Key";
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Shared JSON client for one provider base URL.
#[derive(Debug, Clone)]
struct JsonClient {
    client: reqwest::Client,
    base_url: Url,
}

impl JsonClient {
    fn new(base_url: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ProviderError::Transport(format!("invalid base url {base_url:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ProviderError::Transport(format!("base url {base_url} cannot take a path")));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self { client, base_url })
    }

    /// Base URL plus `segments`, each percent-encoded as a single segment.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn post<B, R>(&self, segments: &[&str], body: &B, idempotency_key: Option<&str>) -> Result<R, ProviderError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let url = self.endpoint(segments);
        let mut req = self.client.post(url.clone()).json(body);
        if let Some(key) = idempotency_key {
            req = req.header(IDEMPOTENCY_KEY, key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        let status = resp.status();
        debug!(%url, status = status.as_u16(), "provider call");

        if status.is_success() {
            return resp
                .json::<R>()
                .await
                .map_err(|e| ProviderError::Malformed(e.to_string()));
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER));
            return Err(ProviderError::RateLimited { retry_after });
        }

        let body = resp.text().await.unwrap_or_default();
        let detail = format!("{} {}", status.as_u16(), body.trim());
        if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
            Err(ProviderError::Unavailable(detail))
        } else {
            Err(ProviderError::Rejected(detail))
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IssueBody<'a> {
    amount_cents: i64,
    recipient: &'a Recipient,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueResponse {
    instrument_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ActivateBody {
    amount_cents: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivateResponse {
    balance_cents: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    delivery_id: String,
}

#[derive(Serialize)]
struct ResolveBody<'a> {
    identifiers: &'a [String],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveResponse {
    tenant_id: TenantId,
}

/// `POST /instruments`, `POST /instruments/{id}/activate`.
#[derive(Debug, Clone)]
pub struct HttpRewardProvider {
    http: JsonClient,
}

impl HttpRewardProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            http: JsonClient::new(base_url, timeout)?,
        })
    }
}

#[async_trait]
impl RewardProvider for HttpRewardProvider {
    async fn issue(
        &self,
        amount_cents: i64,
        recipient: &Recipient,
        idempotency_key: &str,
    ) -> Result<String, ProviderError> {
        let body = IssueBody {
            amount_cents,
            recipient,
        };
        let resp: IssueResponse = self.http.post(&["instruments"], &body, Some(idempotency_key)).await?;
        if resp.instrument_id.trim().is_empty() {
            return Err(ProviderError::Malformed("empty instrumentId".to_string()));
        }
        Ok(resp.instrument_id)
    }

    async fn activate(
        &self,
        instrument_id: &str,
        amount_cents: i64,
        idempotency_key: &str,
    ) -> Result<i64, ProviderError> {
        let resp: ActivateResponse = self
            .http
            .post(
                &["instruments", instrument_id, "activate"],
                &ActivateBody { amount_cents },
                Some(idempotency_key),
            )
            .await?;
        Ok(resp.balance_cents)
    }
}

/// `POST /notifications`.
#[derive(Debug, Clone)]
pub struct HttpNotificationProvider {
    http: JsonClient,
}

impl HttpNotificationProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            http: JsonClient::new(base_url, timeout)?,
        })
    }
}

#[async_trait]
impl NotificationProvider for HttpNotificationProvider {
    async fn send(
        &self,
        notification: &Notification,
        idempotency_key: &str,
    ) -> Result<String, ProviderError> {
        let resp: SendResponse = self
            .http
            .post(&["notifications"], notification, Some(idempotency_key))
            .await?;
        Ok(resp.delivery_id)
    }
}

/// `POST /resolve`. Read-only, so no idempotency key.
#[derive(Debug, Clone)]
pub struct HttpTenantResolver {
    http: JsonClient,
}

impl HttpTenantResolver {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            http: JsonClient::new(base_url, timeout)?,
        })
    }
}

#[async_trait]
impl TenantResolver for HttpTenantResolver {
    async fn resolve(&self, identifiers: &[String]) -> Result<TenantId, ProviderError> {
        let resp: ResolveResponse = self
            .http
            .post(&["resolve"], &ResolveBody { identifiers }, None)
            .await?;
        Ok(resp.tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn issue_sends_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/instruments"))
            .and(header("Idempotency-Key", "sale.completed:s1:issue_instrument"))
            .and(body_partial_json(serde_json::json!({ "amountCents": 500 })))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(serde_json::json!({ "instrumentId": "inst-9" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let provider = HttpRewardProvider::new(&server.uri(), TIMEOUT).unwrap();
        let id = provider
            .issue(500, &Recipient::email("a@b.c"), "sale.completed:s1:issue_instrument")
            .await
            .unwrap();
        assert_eq!(id, "inst-9");
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/instruments/inst-1/activate"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "12"))
            .mount(&server)
            .await;

        let provider = HttpRewardProvider::new(&server.uri(), TIMEOUT).unwrap();
        let err = provider.activate("inst-1", 500, "k").await.unwrap_err();
        assert_eq!(
            err,
            ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(12))
            }
        );
    }

    #[tokio::test]
    async fn instrument_id_is_a_single_path_segment() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/instruments/inst%2F9%20x/activate"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "balanceCents": 500 })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let provider = HttpRewardProvider::new(&format!("{}/api/", server.uri()), TIMEOUT).unwrap();
        let balance = provider.activate("inst/9 x", 500, "k").await.unwrap();
        assert_eq!(balance, 500);
    }

    #[test]
    fn unusable_base_url_is_rejected() {
        assert!(matches!(
            HttpTenantResolver::new("not a url", TIMEOUT),
            Err(ProviderError::Transport(_))
        ));
        assert!(HttpTenantResolver::new("mailto:ops@example.com", TIMEOUT).is_err());
    }

    #[tokio::test]
    async fn server_errors_are_retryable_client_errors_are_not() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/notifications"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/notifications"))
            .respond_with(ResponseTemplate::new(422).set_body_string("unknown template"))
            .mount(&server)
            .await;

        let provider = HttpNotificationProvider::new(&server.uri(), TIMEOUT).unwrap();
        let notification = Notification {
            channel: "email".into(),
            recipient: Recipient::email("a@b.c"),
            template: "nope".into(),
            data: serde_json::json!({}),
        };

        let first = provider.send(&notification, "k").await.unwrap_err();
        assert!(matches!(first, ProviderError::Unavailable(_)));
        assert!(first.is_retryable());

        let second = provider.send(&notification, "k").await.unwrap_err();
        assert_eq!(second, ProviderError::Rejected("422 unknown template".to_string()));
    }

    #[tokio::test]
    async fn garbage_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resolve"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let resolver = HttpTenantResolver::new(&server.uri(), TIMEOUT).unwrap();
        let err = resolver.resolve(&["acme".to_string()]).await.unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }

    #[tokio::test]
    async fn unreachable_host_is_transport() {
        let resolver = HttpTenantResolver::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = resolver.resolve(&["acme".to_string()]).await.unwrap_err();
        assert!(matches!(err, ProviderError::Transport(_)));
    }
}
