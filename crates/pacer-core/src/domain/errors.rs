//! Errors - エラー型と分類
//!
//! 一時的な失敗かどうかは API 境界で `ErrorKind` として付与し、
//! それより内側では文字列やステータスを再解釈しない。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Fatal: 恒久的なエラー（リトライ無意味）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Fatal,
}

impl ErrorKind {
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transient => f.write_str("transient"),
            ErrorKind::Fatal => f.write_str("fatal"),
        }
    }
}

/// LimiterError は limiter 自身が返すエラー
///
/// 満杯はエラーにならない（呼び出しが後で完了するだけ）。
/// 待機中の呼び出しをエラーで終わらせるのは管理操作だけ。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimiterError {
    #[error("rate limit state for key '{key}' was reset while the call was queued")]
    Reset { key: String },

    #[error("rate limiter shut down while a call for key '{key}' was queued")]
    Shutdown { key: String },
}

/// ConfigError は構築時に検出する設定の誤り
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid quota: {0}")]
    InvalidQuota(String),

    #[error("invalid retry policy: {0}")]
    InvalidRetry(String),

    #[error("invalid batch options: {0}")]
    InvalidBatch(String),

    #[error("environment variable {name}={value:?} is not a valid number")]
    InvalidEnv { name: String, value: String },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// ApiError は包んだ API のエラー（境界で分類済み）
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} api error{}: {message}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
pub struct ApiError {
    kind: ErrorKind,
    status: Option<u16>,
    message: String,
}

impl ApiError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            status: None,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Fatal,
            status: None,
            message: message.into(),
        }
    }

    /// HTTP 風のステータスコードで分類
    ///
    /// 429 と 5xx、quota 枯渇を伝えるメッセージは一時的なエラー。
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let transient = status == 429
            || (500..600).contains(&status)
            || message.to_ascii_lowercase().contains("quota");
        Self {
            kind: if transient {
                ErrorKind::Transient
            } else {
                ErrorKind::Fatal
            },
            status: Some(status),
            message,
        }
    }

    /// 接続リセットやタイムアウトなど
    pub fn network(message: impl Into<String>) -> Self {
        Self::transient(message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// `RetryPolicy::execute_if` 用の判定
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

// 管理操作による reset はリトライしても解決しない
impl From<LimiterError> for ApiError {
    fn from(err: LimiterError) -> Self {
        Self::fatal(err.to_string())
    }
}
