//! Client for the mitigation API of a running server.

use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

use crate::api::response::ErrorResponse;
use crate::mitigation::{MitigationOutcome, MitigationRequest};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server rejected mitigation ({status}, {code}): {error}")]
    Rejected {
        status: u16,
        code: String,
        error: String,
    },
}

/// Pushes block rules to `POST /v1/mitigations`.
pub struct MitigationClient {
    http: Client,
    base_url: String,
}

impl MitigationClient {
    /// Create a client; `timeout` bounds each call.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let http = Client::builder().timeout(timeout).build()?;

        Ok(MitigationClient {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub async fn push_block(
        &self,
        request: &MitigationRequest,
    ) -> Result<MitigationOutcome, ClientError> {
        let url = format!("{}/v1/mitigations", self.base_url);
        let response = self.http.post(&url).json(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let (code, error) = match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(e) => (e.code, e.error),
                Err(_) => ("UNKNOWN".to_string(), body.chars().take(200).collect()),
            };
            return Err(ClientError::Rejected {
                status: status.as_u16(),
                code,
                error,
            });
        }

        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitigation::IndicatorType;
    use axum::{http::StatusCode, routing::post, Json, Router};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_push_block_success() {
        let app = Router::new().route(
            "/v1/mitigations",
            post(|Json(req): Json<MitigationRequest>| async move {
                Json(MitigationOutcome {
                    accepted: true,
                    rule_id: format!("mitigation-{}", req.indicator.len()),
                    applied_version: 7,
                    elapsed_millis: 3,
                })
            }),
        );
        let client = MitigationClient::new(serve(app).await, Duration::from_secs(5)).unwrap();

        let outcome = client
            .push_block(&MitigationRequest::new(IndicatorType::IpCidr, "10.0.0.5/32"))
            .await
            .unwrap();

        assert!(outcome.accepted);
        assert_eq!(outcome.applied_version, 7);
    }

    #[tokio::test]
    async fn test_push_block_rejected() {
        let app = Router::new().route(
            "/v1/mitigations",
            post(|| async {
                (
                    StatusCode::GATEWAY_TIMEOUT,
                    Json(ErrorResponse::new("not applied within the SLA", "TIMEOUT")),
                )
            }),
        );
        let client = MitigationClient::new(serve(app).await, Duration::from_secs(5)).unwrap();

        let err = client
            .push_block(&MitigationRequest::new(IndicatorType::IpCidr, "10.0.0.5/32"))
            .await
            .unwrap_err();

        match err {
            ClientError::Rejected { status, code, .. } => {
                assert_eq!(status, 504);
                assert_eq!(code, "TIMEOUT");
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
