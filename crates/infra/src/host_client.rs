use std::time::Duration;

use quorum_domain::jobs::backoff_ms;
use quorum_domain::ports::BoxFuture;
use quorum_domain::ports::accounts::{AccountDirectory, AccountError};
use quorum_domain::ports::posts::{PostError, PostPublisher};
use quorum_domain::survey::SurveyConfig;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::debug;

use crate::config::AppConfig;

const PLATFORM_TOKEN_HEADER: &str = "X-Platform-Token";

#[derive(Debug, thiserror::Error)]
pub enum HostClientError {
    #[error("host client configuration error: {0}")]
    Configuration(String),
    #[error("host rejected request: {0}")]
    Rejected(String),
    #[error("host upstream error: {0}")]
    Upstream(String),
    #[error("host transport error: {0}")]
    Transport(String),
    #[error("host response decode error: {0}")]
    InvalidResponse(String),
}

impl From<HostClientError> for PostError {
    fn from(err: HostClientError) -> Self {
        match err {
            HostClientError::Rejected(message) => PostError::Rejected(message),
            other => PostError::Unavailable(other.to_string()),
        }
    }
}

impl From<HostClientError> for AccountError {
    fn from(err: HostClientError) -> Self {
        match err {
            HostClientError::Rejected(message) => AccountError::Lookup(message),
            other => AccountError::Unavailable(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct CreatePostRequest<'a> {
    survey_id: &'a str,
    title: &'a str,
    owner: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreatePostResponse {
    post_id: String,
}

#[derive(Debug, Clone)]
pub struct HostClientSettings {
    pub base_url: String,
    pub platform_token: String,
    pub timeout_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
}

impl HostClientSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            base_url: config.host_base_url.clone(),
            platform_token: config.host_platform_token.clone(),
            timeout_ms: config.host_timeout_ms,
            retry_max_attempts: config.host_retry_max_attempts,
            retry_backoff_base_ms: config.host_retry_backoff_base_ms,
            retry_backoff_max_ms: config.host_retry_backoff_max_ms,
        }
    }
}

/// Host platform HTTP client: creates survey posts and answers account
/// existence lookups.
#[derive(Debug, Clone)]
pub struct HostPlatformClient {
    http: reqwest::Client,
    base_url: String,
    platform_token: Option<String>,
    retry_max_attempts: u32,
    retry_backoff_base_ms: u64,
    retry_backoff_max_ms: u64,
}

impl HostPlatformClient {
    pub fn new(settings: HostClientSettings) -> Self {
        let timeout = Duration::from_millis(settings.timeout_ms.max(1));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let token = settings.platform_token.trim().to_string();
        Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            platform_token: if token.is_empty() { None } else { Some(token) },
            retry_max_attempts: settings.retry_max_attempts.max(1),
            retry_backoff_base_ms: settings.retry_backoff_base_ms,
            retry_backoff_max_ms: settings.retry_backoff_max_ms,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(HostClientSettings::from_config(config))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn backoff(&self, attempt: u32) {
        let delay_ms = backoff_ms(
            self.retry_backoff_base_ms,
            attempt + 1,
            self.retry_backoff_max_ms,
        );
        sleep(Duration::from_millis(delay_ms.max(1))).await;
    }

    /// Sends the request built by `build`, retrying transport failures, 429
    /// and 5xx. Any other response is returned to the caller.
    async fn send_with_retry<F>(&self, build: F) -> Result<Response, HostClientError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let Some(token) = &self.platform_token else {
            return Err(HostClientError::Configuration(
                "host platform token is required but not configured".to_string(),
            ));
        };
        let attempts = self.retry_max_attempts;

        for attempt in 0..attempts {
            let request = build(&self.http)
                .header("accept", "application/json")
                .header(PLATFORM_TOKEN_HEADER, token);
            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    if attempt + 1 < attempts {
                        debug!(attempt, error = %err, "host request failed, retrying");
                        self.backoff(attempt).await;
                        continue;
                    }
                    return Err(HostClientError::Transport(err.to_string()));
                }
            };

            let status = response.status();
            let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            if !retryable {
                return Ok(response);
            }
            if attempt + 1 < attempts {
                debug!(attempt, status = status.as_u16(), "host busy, retrying");
                self.backoff(attempt).await;
                continue;
            }
            let message = response.text().await.unwrap_or_default();
            return Err(HostClientError::Upstream(format!(
                "status {}: {}",
                status.as_u16(),
                message
            )));
        }

        Err(HostClientError::Upstream(
            "retry loop exited unexpectedly".to_string(),
        ))
    }

    pub async fn create_post(&self, survey: &SurveyConfig) -> Result<String, HostClientError> {
        let url = self.endpoint("posts");
        let body = CreatePostRequest {
            survey_id: &survey.id,
            title: &survey.title,
            owner: &survey.owner,
        };
        let response = self
            .send_with_retry(|http| http.post(&url).json(&body))
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(HostClientError::Rejected(format!(
                "status {}: {}",
                status.as_u16(),
                message
            )));
        }
        let created = response
            .json::<CreatePostResponse>()
            .await
            .map_err(|err| HostClientError::InvalidResponse(err.to_string()))?;
        Ok(created.post_id)
    }

    pub async fn user_exists(&self, user_id: &str) -> Result<bool, HostClientError> {
        let url = self.endpoint(&format!("users/{user_id}"));
        let response = self.send_with_retry(|http| http.get(&url)).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let message = response.text().await.unwrap_or_default();
                Err(HostClientError::Rejected(format!(
                    "status {}: {}",
                    status.as_u16(),
                    message
                )))
            }
        }
    }
}

impl PostPublisher for HostPlatformClient {
    fn create_survey_post(&self, survey: &SurveyConfig) -> BoxFuture<'_, Result<String, PostError>> {
        let survey = survey.clone();
        Box::pin(async move { Ok(self.create_post(&survey).await?) })
    }
}

impl AccountDirectory for HostPlatformClient {
    fn account_exists(&self, user_id: &str) -> BoxFuture<'_, Result<bool, AccountError>> {
        let user_id = user_id.to_string();
        Box::pin(async move { Ok(self.user_exists(&user_id).await?) })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    use super::*;

    const TOKEN: &str = "stub-token";

    #[derive(Clone, Default)]
    struct StubState {
        post_calls: Arc<AtomicUsize>,
        /// Post requests answered with 503 before the stub starts accepting.
        post_failures: usize,
    }

    async fn create_post(
        State(state): State<StubState>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        let call = state.post_calls.fetch_add(1, Ordering::SeqCst);
        if headers.get(PLATFORM_TOKEN_HEADER).and_then(|v| v.to_str().ok()) != Some(TOKEN) {
            return (StatusCode::UNAUTHORIZED, Json(json!({"error": "token"})));
        }
        if body["title"].as_str().unwrap_or_default().is_empty() {
            return (StatusCode::BAD_REQUEST, Json(json!({"error": "title"})));
        }
        if call < state.post_failures {
            return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "busy"})));
        }
        let survey_id = body["survey_id"].as_str().unwrap_or_default();
        (
            StatusCode::CREATED,
            Json(json!({"post_id": format!("t3_{survey_id}")})),
        )
    }

    async fn get_user(Path(id): Path<String>) -> impl IntoResponse {
        match id.as_str() {
            "t2_alice" => (StatusCode::OK, Json(json!({"id": id}))),
            "t2_banned" => (StatusCode::FORBIDDEN, Json(json!({"error": "forbidden"}))),
            _ => (StatusCode::NOT_FOUND, Json(json!({"error": "missing"}))),
        }
    }

    async fn spawn_stub(state: StubState) -> String {
        let app = Router::new()
            .route("/api/posts", post(create_post))
            .route("/api/users/{id}", get(get_user))
            .with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind host stub");
        let addr = listener.local_addr().expect("host stub addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve host stub");
        });
        format!("http://{addr}/api")
    }

    fn client(base_url: String, token: &str) -> HostPlatformClient {
        HostPlatformClient::new(HostClientSettings {
            base_url,
            platform_token: token.to_string(),
            timeout_ms: 2_000,
            retry_max_attempts: 3,
            retry_backoff_base_ms: 1,
            retry_backoff_max_ms: 5,
        })
    }

    fn survey(title: &str) -> SurveyConfig {
        SurveyConfig {
            id: "sv_abcdefghij".to_string(),
            owner: "t2_alice".to_string(),
            title: title.to_string(),
            intro: String::new(),
            outro: String::new(),
            allow_multiple: false,
            create_date: 0,
            publish_date: Some(0),
            close_date: None,
            response_count: 0,
            delete_queued: false,
        }
    }

    #[tokio::test]
    async fn creates_post_after_transient_failures() {
        let state = StubState {
            post_failures: 2,
            ..StubState::default()
        };
        let calls = state.post_calls.clone();
        let base_url = spawn_stub(state).await;

        let post_id = client(base_url, TOKEN)
            .create_survey_post(&survey("Lunch"))
            .await
            .expect("post created");
        assert_eq!(post_id, "t3_sv_abcdefghij");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_when_host_stays_unavailable() {
        let state = StubState {
            post_failures: 10,
            ..StubState::default()
        };
        let calls = state.post_calls.clone();
        let base_url = spawn_stub(state).await;

        let err = client(base_url, TOKEN)
            .create_survey_post(&survey("Lunch"))
            .await
            .expect_err("host busy");
        assert!(matches!(err, PostError::Unavailable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_rejections_without_retry() {
        let state = StubState::default();
        let calls = state.post_calls.clone();
        let base_url = spawn_stub(state).await;

        let err = client(base_url.clone(), TOKEN)
            .create_survey_post(&survey(""))
            .await
            .expect_err("bad request");
        assert!(matches!(err, PostError::Rejected(_)));

        let err = client(base_url, "wrong-token")
            .create_survey_post(&survey("Lunch"))
            .await
            .expect_err("unauthorized");
        assert!(matches!(err, PostError::Rejected(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn account_lookup_maps_status_codes() {
        let base_url = spawn_stub(StubState::default()).await;
        let client = client(base_url, TOKEN);

        assert!(client.account_exists("t2_alice").await.unwrap());
        assert!(!client.account_exists("t2_ghost").await.unwrap());
        let err = client
            .account_exists("t2_banned")
            .await
            .expect_err("forbidden");
        assert!(matches!(err, AccountError::Lookup(_)));
    }

    #[tokio::test]
    async fn missing_token_is_a_configuration_error() {
        let client = client("http://127.0.0.1:9".to_string(), "  ");
        let err = client.user_exists("t2_alice").await.expect_err("no token");
        assert!(matches!(err, HostClientError::Configuration(_)));
    }
}
