//! ApiClient port - 保護対象の外部 API
//!
//! 実装は失敗を `ApiError` として返し、その時点で Transient / Fatal を決める。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::ApiError;
use crate::domain::quota;

/// Operation は予算が独立した操作の種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Search,
    Read,
    Modify,
    Attachment,
}

impl Operation {
    /// この種別のレート制限キー
    pub fn key(self) -> &'static str {
        match self {
            Operation::Search => quota::SEARCH,
            Operation::Read => quota::READ,
            Operation::Modify => quota::MODIFY,
            Operation::Attachment => quota::ATTACHMENT,
        }
    }
}

/// 包んだ API への 1 回の呼び出し
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub operation: Operation,
    /// エンドポイントごとの名前（メッセージ ID、検索クエリ、ラベルなど）
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ApiRequest {
    pub fn new(operation: Operation, name: impl Into<String>) -> Self {
        Self {
            operation,
            name: name.into(),
            params: serde_json::Value::Null,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn call(&self, request: &ApiRequest) -> Result<serde_json::Value, ApiError>;
}
