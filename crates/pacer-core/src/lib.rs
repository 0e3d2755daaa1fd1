//! pacer-core
//!
//! Per-key client-side rate limiting for calls against a quota-limited API.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（quota, errors, events, status）
//! - **ports**: 抽象化レイヤー（Clock, EventSink, ApiClient）
//! - **limiter**: キー単位のウィンドウ制御と待機列
//! - **retry**: 指数バックオフによるリトライ
//! - **batch**: 一括処理の分割とペーシング
//! - **config**: JSON / 環境変数からの設定
//! - **app**: ワイヤリング（AppBuilder）と API クライアントのラッパー
//! - **impls**: 実装（MemoryEventSink などテスト・デモ用）

pub mod app;
pub mod batch;
pub mod config;
pub mod domain;
pub mod impls;
pub mod limiter;
pub mod ports;
pub mod retry;

pub use self::app::{App, AppBuilder, BuildError, RateLimitedClient};
pub use self::batch::{BatchOptions, BatchProcessor};
pub use self::config::PacerConfig;
pub use self::domain::{
    ApiError, ConfigError, ErrorKind, KeyStatus, LimiterError, PacerEvent, QuotaTable,
    RateLimitConfig,
};
pub use self::limiter::{RateLimited, RateLimiter};
pub use self::retry::RetryPolicy;
