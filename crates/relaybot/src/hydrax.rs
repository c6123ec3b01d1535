//! Hydrax remote import: registers a publicly readable Drive object with the
//! streaming service and returns its slug.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::retry::{with_backoff, RetryPolicy};

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportResult {
    Imported {
        slug: String,
        video_status: Option<String>,
    },
    /// Application-level refusal or exhausted retries; the text is shown to the user.
    Rejected { error: String },
}

#[async_trait]
pub trait Importer: Send + Sync {
    async fn import(&self, storage_id: &str) -> ImportResult;
}

#[derive(Debug, Deserialize)]
struct ImportResponse {
    #[serde(default)]
    status: Value,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    status_video: Option<Value>,
    #[serde(default)]
    msg: Option<String>,
}

/// Maps a response body to a result. Undecodable bodies are rejections, not
/// transport errors, so they are never retried.
pub fn parse_response(body: &[u8]) -> ImportResult {
    let parsed: ImportResponse = match serde_json::from_slice(body) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("undecodable Hydrax response: {e}");
            return ImportResult::Rejected {
                error: format!("internal error processing Hydrax response: {e}"),
            };
        }
    };

    if parsed.status != Value::Bool(true) {
        return ImportResult::Rejected {
            error: parsed
                .msg
                .unwrap_or_else(|| "unknown Hydrax error".to_string()),
        };
    }

    match parsed.slug {
        Some(slug) if !slug.is_empty() => ImportResult::Imported {
            slug,
            video_status: parsed.status_video.map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            }),
        },
        _ => ImportResult::Rejected {
            error: "Hydrax accepted the import but returned no slug".to_string(),
        },
    }
}

pub struct HydraxClient {
    http: Client,
    api_base: String,
    api_key: String,
    retry: RetryPolicy,
}

impl HydraxClient {
    pub fn new(http: Client, api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn attempt(&self, url: &str) -> Result<ImportResult, reqwest::Error> {
        let response = self
            .http
            .get(url)
            .timeout(ATTEMPT_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            // The key is part of the path; keep it out of logs and user messages.
            .map_err(|e| e.without_url())?;
        let body = response.bytes().await.map_err(|e| e.without_url())?;
        Ok(parse_response(&body))
    }
}

#[async_trait]
impl Importer for HydraxClient {
    async fn import(&self, storage_id: &str) -> ImportResult {
        let url = format!("{}/{}/drive/{storage_id}", self.api_base, self.api_key);
        let result = with_backoff(self.retry, "hydrax import", |_| self.attempt(&url)).await;
        match result {
            Ok(result) => {
                match &result {
                    ImportResult::Imported { slug, .. } => {
                        info!("Drive object {storage_id} imported to Hydrax as {slug}")
                    }
                    ImportResult::Rejected { error } => {
                        warn!("Hydrax rejected Drive object {storage_id}: {error}")
                    }
                }
                result
            }
            Err(e) => ImportResult::Rejected {
                error: format!("network error contacting Hydrax: {e}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::get, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn successful_payload_yields_slug() {
        let result = parse_response(br#"{"status":true,"slug":"abc123","status_video":1}"#);
        assert_eq!(
            result,
            ImportResult::Imported {
                slug: "abc123".to_string(),
                video_status: Some("1".to_string()),
            }
        );
    }

    #[test]
    fn refusal_carries_service_message() {
        let result = parse_response(br#"{"status":false,"msg":"file not public"}"#);
        assert_eq!(
            result,
            ImportResult::Rejected {
                error: "file not public".to_string()
            }
        );
        let result = parse_response(br#"{"status":"true"}"#);
        assert_eq!(
            result,
            ImportResult::Rejected {
                error: "unknown Hydrax error".to_string()
            }
        );
    }

    #[test]
    fn garbage_body_is_an_internal_error() {
        match parse_response(b"<html>bad gateway</html>") {
            ImportResult::Rejected { error } => {
                assert!(error.starts_with("internal error processing Hydrax response"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    /// Serves `/{key}/drive/{id}` with a canned status and body; counts hits.
    async fn serve(status: StatusCode, body: &'static str) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/{key}/drive/{id}",
                get(move |State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (status, body)
                }),
            )
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), hits)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_exhausted() {
        let (base, hits) = serve(StatusCode::BAD_GATEWAY, "down").await;
        let client = HydraxClient::new(Client::new(), base, "secret-key").with_retry(fast_retry());
        match client.import("drive-1").await {
            ImportResult::Rejected { error } => {
                assert!(error.starts_with("network error contacting Hydrax"));
                assert!(!error.contains("secret-key"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn refusals_are_not_retried() {
        let (base, hits) = serve(StatusCode::OK, r#"{"status":false,"msg":"quota exceeded"}"#).await;
        let client = HydraxClient::new(Client::new(), base, "key").with_retry(fast_retry());
        assert_eq!(
            client.import("drive-2").await,
            ImportResult::Rejected {
                error: "quota exceeded".to_string()
            }
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
