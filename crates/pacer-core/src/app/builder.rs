//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! 設定・時計・イベントの送り先を 1 か所で組み合わせ、
//! `build()` で設定を検証してから `App` を返す（Fail-fast）。

use std::sync::Arc;

use tracing::info;

use crate::app::client::RateLimitedClient;
use crate::batch::BatchProcessor;
use crate::config::PacerConfig;
use crate::domain::{ConfigError, RateLimitConfig};
use crate::limiter::RateLimiter;
use crate::ports::{ApiClient, Clock, EventSink, NoopEventSink, SystemClock};
use crate::retry::RetryPolicy;

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .config(PacerConfig::load(None)?)
///     .expect_keys(&["gmail.read", "gmail.modify"])
///     .build()?;
/// let client = app.client(my_api);
/// ```
pub struct AppBuilder {
    config: PacerConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    expected_keys: Option<Vec<String>>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Missing quotas for keys: {0:?}. These keys were expected but have no explicit quota.")]
    MissingQuotas(Vec<String>),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            config: PacerConfig::default(),
            clock: Arc::new(SystemClock),
            sink: Arc::new(NoopEventSink),
            expected_keys: None,
        }
    }

    pub fn config(mut self, config: PacerConfig) -> Self {
        self.config = config;
        self
    }

    /// 設定の上に 1 キー分の予算を追加（既存なら置き換え）
    pub fn quota(mut self, key: impl Into<String>, quota: RateLimitConfig) -> Self {
        self.config.quotas.insert(key.into(), quota);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// 専用の予算が必要なキー
    ///
    /// どれかがフォールバックにしか当たらなければ `build()` は失敗する。
    pub fn expect_keys(mut self, keys: &[&str]) -> Self {
        self.expected_keys = Some(keys.iter().map(|k| k.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        let quotas = self.config.quota_table();
        if let Some(expected) = &self.expected_keys {
            let missing: Vec<String> = expected
                .iter()
                .filter(|key| !quotas.contains(key))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingQuotas(missing));
            }
        }

        let retry = self
            .config
            .retry_policy()?
            .with_clock(Arc::clone(&self.clock))
            .with_event_sink(Arc::clone(&self.sink));
        let limiter = RateLimiter::new(quotas, Arc::clone(&self.clock), Arc::clone(&self.sink));
        let batches = BatchProcessor::new(limiter.clone(), self.config.batch)
            .with_clock(self.clock)
            .with_event_sink(self.sink);

        info!(
            keys = limiter.quotas().keys().len(),
            batch_size = self.config.batch.batch_size(),
            max_retries = retry.max_retries(),
            "app built"
        );
        Ok(App {
            limiter,
            batches,
            retry,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// App は組み上がった limiter / batch / retry の一式
///
/// `batches` は `limiter` と状態を共有している。
#[derive(Clone)]
pub struct App {
    pub limiter: RateLimiter,
    pub batches: BatchProcessor,
    pub retry: RetryPolicy,
}

impl App {
    /// `api` を包み、全ての呼び出しをこの App の limiter と retry に通す
    pub fn client<C: ApiClient>(&self, api: C) -> RateLimitedClient<C> {
        RateLimitedClient::new(
            api,
            self.limiter.clone(),
            self.batches.clone(),
            self.retry.clone(),
        )
    }

    pub fn shutdown(&self) {
        self.limiter.shutdown();
    }
}
