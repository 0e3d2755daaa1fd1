//! RateLimitedClient - API クライアントのラッパー
//!
//! リクエストの種類ごとにキーを選び、retry の内側で limiter を通す。
//! リトライした試行もすべて予算に計上される。

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info};

use crate::batch::BatchProcessor;
use crate::domain::quota::{ATTACHMENT, DAILY, MODIFY, READ, SEARCH};
use crate::domain::{ApiError, KeyStatus};
use crate::limiter::RateLimiter;
use crate::ports::{ApiClient, ApiRequest, Operation};
use crate::retry::RetryPolicy;

/// [`RateLimitedClient::status`] が報告するキー
pub const STATUS_KEYS: [&str; 5] = [SEARCH, READ, MODIFY, ATTACHMENT, DAILY];

pub struct RateLimitedClient<C> {
    api: Arc<C>,
    limiter: RateLimiter,
    batches: BatchProcessor,
    retry: RetryPolicy,
}

impl<C> Clone for RateLimitedClient<C> {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
            limiter: self.limiter.clone(),
            batches: self.batches.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<C: ApiClient> RateLimitedClient<C> {
    pub fn new(api: C, limiter: RateLimiter, batches: BatchProcessor, retry: RetryPolicy) -> Self {
        Self {
            api: Arc::new(api),
            limiter,
            batches,
            retry,
        }
    }

    pub fn api(&self) -> &C {
        &self.api
    }

    /// 1 リクエストを実行。一時的なエラーはリトライし、試行ごとに limiter を通す
    pub async fn call(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        let key = request.operation.key();
        debug!(key, name = %request.name, "api call");
        let (api, limiter) = (&*self.api, &self.limiter);
        self.retry
            .execute_if(
                move || limiter.execute(key, move || api.call(request)),
                ApiError::is_transient,
            )
            .await
    }

    pub async fn search(&self, query: &str) -> Result<Value, ApiError> {
        self.call(&ApiRequest::new(Operation::Search, query)).await
    }

    pub async fn read(&self, message_id: &str) -> Result<Value, ApiError> {
        self.call(&ApiRequest::new(Operation::Read, message_id)).await
    }

    pub async fn modify(&self, message_id: &str, changes: Value) -> Result<Value, ApiError> {
        self.call(&ApiRequest::new(Operation::Modify, message_id).with_params(changes))
            .await
    }

    pub async fn download_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Value, ApiError> {
        let request = ApiRequest::new(Operation::Attachment, message_id)
            .with_params(json!({ "attachment_id": attachment_id }));
        self.call(&request).await
    }

    /// `requests` をバッチに分けて実行。`result[i]` は `requests[i]` の結果
    ///
    /// `key` はバッチのラベル。予算は各リクエストの操作種別のキーから使う。
    pub async fn call_many(&self, requests: Vec<ApiRequest>, key: &str) -> Vec<Result<Value, ApiError>> {
        self.batches
            .process_paced(
                requests,
                move |request| async move { self.call(&request).await },
                key,
            )
            .await
    }

    pub async fn read_many(&self, message_ids: Vec<String>) -> Vec<Result<Value, ApiError>> {
        info!(count = message_ids.len(), "reading messages");
        let requests = message_ids
            .into_iter()
            .map(|id| ApiRequest::new(Operation::Read, id))
            .collect();
        self.call_many(requests, READ).await
    }

    /// `(message_id, changes)` の組を一括適用
    pub async fn modify_many(&self, changes: Vec<(String, Value)>) -> Vec<Result<Value, ApiError>> {
        info!(count = changes.len(), "modifying messages");
        let requests = changes
            .into_iter()
            .map(|(id, params)| ApiRequest::new(Operation::Modify, id).with_params(params))
            .collect();
        self.call_many(requests, MODIFY).await
    }

    /// `(message_id, attachment_id)` の組を一括ダウンロード
    pub async fn download_many(
        &self,
        attachments: Vec<(String, String)>,
    ) -> Vec<Result<Value, ApiError>> {
        info!(count = attachments.len(), "downloading attachments");
        let requests = attachments
            .into_iter()
            .map(|(message_id, attachment_id)| {
                ApiRequest::new(Operation::Attachment, message_id)
                    .with_params(json!({ "attachment_id": attachment_id }))
            })
            .collect();
        self.call_many(requests, ATTACHMENT).await
    }

    /// 既知のキー全ての状態（[`STATUS_KEYS`] の順）
    pub fn status(&self) -> Vec<KeyStatus> {
        STATUS_KEYS.iter().map(|key| self.limiter.status(key)).collect()
    }

    pub fn reset_limits(&self, key: Option<&str>) -> usize {
        let rejected = self.limiter.reset(key);
        info!(key = key.unwrap_or("*"), rejected, "rate limits reset");
        rejected
    }
}
