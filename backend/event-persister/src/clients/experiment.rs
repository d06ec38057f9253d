//! Experiment service client
//!
//! Lists experiments for an environment through the experiment service's
//! JSON API: `POST {base_url}/v1/experiments/list`, paginated by cursor.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

use crate::error::{PersisterError, Result};
use crate::models::{Experiment, ExperimentStatus};

/// Request body of the list endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListExperimentsRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_version: Option<i32>,
    pub page_size: u32,
    pub cursor: String,
    pub environment: String,
    pub statuses: Vec<ExperimentStatus>,
    pub archived: bool,
}

/// One page of experiments; an empty cursor means there is no next page
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListExperimentsResponse {
    #[serde(default)]
    pub experiments: Vec<Experiment>,
    #[serde(default)]
    pub cursor: String,
}

#[async_trait]
pub trait ExperimentClient: Send + Sync {
    async fn list_experiments(
        &self,
        request: &ListExperimentsRequest,
    ) -> Result<ListExperimentsResponse>;
}

/// [`ExperimentClient`] over HTTP
#[derive(Clone)]
pub struct HttpExperimentClient {
    client: Client,
    /// Experiment service URL (e.g., "http://experiment-service:9000")
    base_url: String,
    /// Optional bearer token
    token: Option<String>,
}

impl HttpExperimentClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }
}

#[async_trait]
impl ExperimentClient for HttpExperimentClient {
    async fn list_experiments(
        &self,
        request: &ListExperimentsRequest,
    ) -> Result<ListExperimentsResponse> {
        let url = format!("{}/v1/experiments/list", self.base_url);

        let mut builder = self.client.post(&url).json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            error!("Failed to send list experiments request: {}", e);
            PersisterError::ExperimentClient(format!("request failed: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PersisterError::ExperimentClient(format!(
                "list experiments failed ({}): {}",
                status, body
            )));
        }

        let page: ListExperimentsResponse = response.json().await?;
        debug!(
            environment = %request.environment,
            count = page.experiments.len(),
            "Listed experiments page"
        );
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ListExperimentsRequest {
        ListExperimentsRequest {
            feature_id: None,
            feature_version: None,
            page_size: 500,
            cursor: String::new(),
            environment: "production".to_string(),
            statuses: vec![ExperimentStatus::Running],
            archived: false,
        }
    }

    #[tokio::test]
    async fn test_list_experiments_sends_filters_and_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/experiments/list"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({
                "environment": "production",
                "pageSize": 500,
                "statuses": ["RUNNING"],
                "archived": false
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "experiments": [{
                    "id": "exp-1",
                    "featureId": "fid",
                    "featureVersion": 1,
                    "goalIds": ["gid"],
                    "status": "RUNNING"
                }],
                "cursor": "next"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpExperimentClient::new(
            &format!("{}/", server.uri()),
            Some("secret".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();

        let page = client.list_experiments(&request()).await.unwrap();
        assert_eq!(page.cursor, "next");
        assert_eq!(page.experiments.len(), 1);
        assert!(page.experiments[0].has_goal("gid"));
    }

    #[tokio::test]
    async fn test_server_error_is_retriable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = HttpExperimentClient::new(&server.uri(), None, Duration::from_secs(5)).unwrap();
        let err = client.list_experiments(&request()).await.unwrap_err();

        assert!(matches!(err, PersisterError::ExperimentClient(_)));
        assert!(err.is_retriable());
    }
}
