//! HTTP client for the pipeline RPC surface.
//!
//! Speaks the JSON routes served by `api::pipeline_routes`, so a board
//! session can run against a remote store exactly as it does against a
//! local one.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::api::{ErrorBody, OkResponse, SetStageRequest};
use crate::error::StoreError;
use crate::pipeline::types::{PipelineRecord, Stage, StageTransition, TriggeredBy};
use crate::store::traits::{PipelineStore, validate_thread_id};

/// `PipelineStore` backed by a remote pipeline server.
pub struct RemotePipelineStore {
    base_url: String,
    client: reqwest::Client,
}

impl RemotePipelineStore {
    /// `base_url` like `http://127.0.0.1:8080` (no trailing slash needed).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, client }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// `thread_id` is the thread the request is about, if any.
    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        op: &str,
        thread_id: Option<&str>,
    ) -> Result<T, StoreError> {
        let resp = request
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("{op}: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<T>()
                .await
                .map_err(|e| StoreError::Serialization(format!("{op}: {e}")));
        }

        let body: Option<ErrorBody> = resp.json().await.ok();
        let message = body
            .map(|b| b.error)
            .unwrap_or_else(|| status.to_string());
        warn!(op, status = %status, error = %message, "Pipeline RPC failed");
        Err(status_to_error(status, thread_id, message))
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        op: &str,
        thread_id: Option<&str>,
    ) -> Result<T, StoreError> {
        self.send(self.client.post(self.url(path)).json(body), op, thread_id)
            .await
    }
}

/// Map an HTTP failure onto the store error taxonomy.
///
/// The server answers 400 only for a rejected thread id; body rejections
/// (422, 415) mean the request itself was malformed.
fn status_to_error(status: StatusCode, thread_id: Option<&str>, message: String) -> StoreError {
    match (status, thread_id) {
        (StatusCode::BAD_REQUEST, Some(thread_id)) => StoreError::InvalidThreadId {
            thread_id: thread_id.to_string(),
            reason: message,
        },
        (StatusCode::NOT_FOUND, Some(thread_id)) => StoreError::NotFound {
            thread_id: thread_id.to_string(),
        },
        (
            StatusCode::BAD_REQUEST
            | StatusCode::UNPROCESSABLE_ENTITY
            | StatusCode::UNSUPPORTED_MEDIA_TYPE,
            _,
        ) => StoreError::Serialization(message),
        _ => StoreError::Unavailable(message),
    }
}

#[async_trait]
impl PipelineStore for RemotePipelineStore {
    async fn get_all(&self) -> Result<Vec<PipelineRecord>, StoreError> {
        self.send(self.client.get(self.url("/api/pipeline")), "get_all", None)
            .await
    }

    async fn get_by_stage(&self, stage: Stage) -> Result<Vec<PipelineRecord>, StoreError> {
        let request = self
            .client
            .get(self.url("/api/pipeline"))
            .query(&[("stage", stage.as_str())]);
        self.send(request, "get_by_stage", None).await
    }

    async fn get(&self, thread_id: &str) -> Result<Option<PipelineRecord>, StoreError> {
        validate_thread_id(thread_id)?;
        let request = self
            .client
            .get(self.url(&format!("/api/pipeline/{thread_id}")));
        match self.send::<PipelineRecord>(request, "get", Some(thread_id)).await {
            Ok(record) => Ok(Some(record)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_stage(
        &self,
        thread_id: &str,
        stage: Stage,
        triggered_by: TriggeredBy,
    ) -> Result<PipelineRecord, StoreError> {
        validate_thread_id(thread_id)?;
        let body = SetStageRequest {
            thread_id: thread_id.to_string(),
            stage,
            triggered_by,
        };
        let ok: OkResponse = self
            .post_json("/api/pipeline/stage", &body, "set_stage", Some(thread_id))
            .await?;
        ok.record.ok_or_else(|| {
            StoreError::Serialization("set_stage: response carried no record".into())
        })
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<bool, StoreError> {
        validate_thread_id(thread_id)?;
        let request = self
            .client
            .delete(self.url(&format!("/api/pipeline/{thread_id}")));
        match self
            .send::<OkResponse>(request, "delete_thread", Some(thread_id))
            .await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn transitions(&self, thread_id: &str) -> Result<Vec<StageTransition>, StoreError> {
        validate_thread_id(thread_id)?;
        let request = self
            .client
            .get(self.url(&format!("/api/pipeline/{thread_id}/transitions")));
        self.send(request, "transitions", Some(thread_id)).await
    }
}
