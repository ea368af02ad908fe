//! Typed REST client for the session backend
//!
//! Thin wrapper over `reqwest` with a fixed per-request timeout. Paths
//! and envelopes match the backend contract exactly; every request
//! carries the acting user in `x-user-id`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use gtmintel_protocol::{IcpConfig, IcpModel, Session};

use crate::error::RestError;

pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct SessionsEnvelope {
    sessions: Vec<Session>,
}

#[derive(Debug, Deserialize)]
struct SessionEnvelope {
    session: Session,
}

#[derive(Debug, Deserialize)]
struct ModelsEnvelope {
    models: Vec<IcpModel>,
}

#[derive(Debug, Deserialize)]
struct ModelEnvelope {
    model: IcpModel,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody<'a> {
    name: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateQueryBody<'a> {
    query: &'a [String],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSessionBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<&'a str>,
}

/// Body of `POST /api/search-companies`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest<'a> {
    pub session_id: &'a str,
    pub query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icp_model_id: Option<&'a str>,
    pub count: u32,
    pub search_type: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IcpModelBody<'a> {
    pub name: &'a str,
    pub is_primary: bool,
    pub config: &'a IcpConfig,
}

impl RestClient {
    pub fn new(
        base_url: impl Into<String>,
        user_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RestError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            user_id: user_id.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, RestError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(RestError::Status { status })
        }
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, RestError> {
        let response = self
            .http
            .get(self.url("/api/sessions"))
            .header(USER_ID_HEADER, &self.user_id)
            .send()
            .await?;
        let envelope: SessionsEnvelope = Self::check(response).await?.json().await?;
        Ok(envelope.sessions)
    }

    pub async fn create_session(&self, name: &str) -> Result<Session, RestError> {
        let response = self
            .http
            .post(self.url("/api/sessions"))
            .header(USER_ID_HEADER, &self.user_id)
            .json(&CreateSessionBody { name })
            .send()
            .await?;
        let envelope: SessionEnvelope = Self::check(response).await?.json().await?;
        Ok(envelope.session)
    }

    pub async fn update_session(
        &self,
        id: &str,
        body: &UpdateSessionBody<'_>,
    ) -> Result<Session, RestError> {
        let response = self
            .http
            .patch(self.url(&format!("/api/sessions/{}", id)))
            .header(USER_ID_HEADER, &self.user_id)
            .json(body)
            .send()
            .await?;
        let envelope: SessionEnvelope = Self::check(response).await?.json().await?;
        Ok(envelope.session)
    }

    pub async fn update_session_query(
        &self,
        id: &str,
        query: &[String],
    ) -> Result<Session, RestError> {
        let response = self
            .http
            .patch(self.url(&format!("/api/sessions/{}/query", id)))
            .header(USER_ID_HEADER, &self.user_id)
            .json(&UpdateQueryBody { query })
            .send()
            .await?;
        let envelope: SessionEnvelope = Self::check(response).await?.json().await?;
        Ok(envelope.session)
    }

    pub async fn delete_session(&self, id: &str) -> Result<(), RestError> {
        let response = self
            .http
            .delete(self.url(&format!("/api/sessions/{}", id)))
            .header(USER_ID_HEADER, &self.user_id)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Fire the asynchronous search workflow. Completion arrives over the
    /// WebSocket channel, not in this response.
    pub async fn start_search(&self, request: &SearchRequest<'_>) -> Result<(), RestError> {
        let response = self
            .http
            .post(self.url("/api/search-companies"))
            .header(USER_ID_HEADER, &self.user_id)
            .json(request)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn list_icp_models(&self) -> Result<Vec<IcpModel>, RestError> {
        let response = self
            .http
            .get(self.url("/api/icp-models"))
            .header(USER_ID_HEADER, &self.user_id)
            .send()
            .await?;
        let envelope: ModelsEnvelope = Self::check(response).await?.json().await?;
        Ok(envelope.models)
    }

    pub async fn create_icp_model(
        &self,
        body: &IcpModelBody<'_>,
    ) -> Result<IcpModel, RestError> {
        let response = self
            .http
            .post(self.url("/api/icp-models"))
            .header(USER_ID_HEADER, &self.user_id)
            .json(body)
            .send()
            .await?;
        let envelope: ModelEnvelope = Self::check(response).await?.json().await?;
        Ok(envelope.model)
    }

    pub async fn update_icp_model(
        &self,
        id: &str,
        body: &IcpModelBody<'_>,
    ) -> Result<IcpModel, RestError> {
        let response = self
            .http
            .patch(self.url(&format!("/api/icp-models/{}", id)))
            .header(USER_ID_HEADER, &self.user_id)
            .json(body)
            .send()
            .await?;
        let envelope: ModelEnvelope = Self::check(response).await?.json().await?;
        Ok(envelope.model)
    }

    pub async fn set_primary_model(&self, id: &str) -> Result<(), RestError> {
        let response = self
            .http
            .patch(self.url(&format!("/api/icp-models/{}/primary", id)))
            .header(USER_ID_HEADER, &self.user_id)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn delete_icp_model(&self, id: &str) -> Result<(), RestError> {
        let response = self
            .http
            .delete(self.url(&format!("/api/icp-models/{}", id)))
            .header(USER_ID_HEADER, &self.user_id)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}
