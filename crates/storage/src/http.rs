use std::env;
use std::time::Duration;

use async_trait::async_trait;
use exam_core::model::SessionId;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::records::{DrillItemRecord, SessionRecord};
use crate::repository::{RemoteError, SessionRemote};

#[derive(Clone, Debug)]
pub struct RemoteConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub timeout: Duration,
}

impl RemoteConfig {
    /// Read `EXAM_API_BASE_URL` (required) and `EXAM_API_TOKEN` (optional).
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let base_url = env::var("EXAM_API_BASE_URL").ok()?;
        if base_url.trim().is_empty() {
            return None;
        }
        let api_token = env::var("EXAM_API_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty());
        let timeout = env::var("EXAM_API_TIMEOUT_SECS")
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .map_or(Duration::from_secs(15), Duration::from_secs);
        Some(Self {
            base_url,
            api_token,
            timeout,
        })
    }
}

/// `SessionRemote` over the JSON HTTP API.
#[derive(Clone)]
pub struct HttpSessionRemote {
    client: Client,
    config: RemoteConfig,
}

impl HttpSessionRemote {
    /// # Errors
    ///
    /// Returns `RemoteError::Network` if the HTTP client cannot be built.
    pub fn new(config: RemoteConfig) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        tracing::debug!(status = status.as_u16(), "session api request failed");
        Err(classify_status(status, message))
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RemoteError> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

/// Map a non-success status onto the remote error taxonomy.
#[must_use]
pub fn classify_status(status: StatusCode, message: String) -> RemoteError {
    match status {
        StatusCode::UNAUTHORIZED => RemoteError::Unauthorized,
        StatusCode::NOT_FOUND => RemoteError::NotFound,
        StatusCode::CONFLICT => RemoteError::Conflict,
        s if s.is_server_error() => RemoteError::Server { status: s.as_u16() },
        s => RemoteError::Rejected {
            status: s.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl SessionRemote for HttpSessionRemote {
    async fn create_session(&self, record: &SessionRecord) -> Result<(), RemoteError> {
        let request = self.client.post(self.url("sessions")).json(record);
        self.send(request).await.map(drop)
    }

    async fn update_session(&self, record: &SessionRecord) -> Result<(), RemoteError> {
        let request = self.client.patch(self.url("sessions")).json(record);
        self.send(request).await.map(drop)
    }

    async fn fetch_session(&self, id: SessionId) -> Result<SessionRecord, RemoteError> {
        let request = self
            .client
            .get(self.url("sessions"))
            .query(&[("id", id.to_string())]);
        self.json(request).await
    }

    async fn list_in_progress(&self) -> Result<Vec<SessionRecord>, RemoteError> {
        let request = self
            .client
            .get(self.url("sessions"))
            .query(&[("in_progress", "true")]);
        self.json(request).await
    }

    async fn insert_drill_items(&self, items: &[DrillItemRecord]) -> Result<(), RemoteError> {
        let request = self.client.post(self.url("drill-items")).json(items);
        self.send(request).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_error_taxonomy() {
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, String::new()),
            RemoteError::Unauthorized
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, String::new()),
            RemoteError::NotFound
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, String::new()),
            RemoteError::Server { status: 502 }
        );
        assert_eq!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "bad range".into()),
            RemoteError::Rejected {
                status: 422,
                message: "bad range".into()
            }
        );
    }

    #[test]
    fn url_joins_without_double_slash() {
        let remote = HttpSessionRemote::new(RemoteConfig {
            base_url: "https://api.example.test/v1/".into(),
            api_token: None,
            timeout: Duration::from_secs(1),
        })
        .unwrap();
        assert_eq!(remote.url("sessions"), "https://api.example.test/v1/sessions");
    }
}
