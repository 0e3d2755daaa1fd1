//! Quota - キー単位の予算定義
//!
//! `RateLimitConfig` は 1 キー分の予算、`QuotaTable` はキー名から予算を引く表。

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::ConfigError;

/// RateLimitConfig はキーごとの予算
///
/// 作成後は不変。[`RateLimitConfig::new`] を通すので
/// `max_requests > 0`、`window_ms > 0`、`max_burst >= max_requests` が常に成り立つ。
/// デシリアライズも同じ検証を通る。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "QuotaSpec", into = "QuotaSpec")]
pub struct RateLimitConfig {
    max_requests: u32,
    window_ms: u64,
    max_burst: Option<u32>,
    retry_after_ms: Option<u64>,
}

/// 設定ファイル上の予算の形
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSpec {
    pub max_requests: u32,
    pub window_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_burst: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl TryFrom<QuotaSpec> for RateLimitConfig {
    type Error = ConfigError;

    fn try_from(spec: QuotaSpec) -> Result<Self, Self::Error> {
        let mut config = RateLimitConfig::new(spec.max_requests, spec.window_ms)?;
        if let Some(burst) = spec.max_burst {
            config = config.with_burst(burst)?;
        }
        if let Some(retry_after_ms) = spec.retry_after_ms {
            config = config.with_retry_after(retry_after_ms);
        }
        Ok(config)
    }
}

impl From<RateLimitConfig> for QuotaSpec {
    fn from(config: RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            window_ms: config.window_ms,
            max_burst: config.max_burst,
            retry_after_ms: config.retry_after_ms,
        }
    }
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window_ms: u64) -> Result<Self, ConfigError> {
        if max_requests == 0 {
            return Err(ConfigError::InvalidQuota(
                "max_requests must be greater than 0".into(),
            ));
        }
        if window_ms == 0 {
            return Err(ConfigError::InvalidQuota(
                "window_ms must be greater than 0".into(),
            ));
        }
        Ok(Self {
            max_requests,
            window_ms,
            max_burst: None,
            retry_after_ms: None,
        })
    }

    /// 待機列に回す前に、ウィンドウあたり `max_burst` 件まで許可する
    pub fn with_burst(mut self, max_burst: u32) -> Result<Self, ConfigError> {
        if max_burst < self.max_requests {
            return Err(ConfigError::InvalidQuota(format!(
                "max_burst ({max_burst}) must be >= max_requests ({})",
                self.max_requests
            )));
        }
        self.max_burst = Some(max_burst);
        Ok(self)
    }

    /// 満杯時の固定の待ち時間
    pub fn with_retry_after(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn max_burst(&self) -> Option<u32> {
        self.max_burst
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }

    /// ウィンドウあたりの上限（バースト枠を含む）
    pub fn ceiling(&self) -> u32 {
        self.max_burst.unwrap_or(self.max_requests)
    }

    /// 待機列の解放間隔（ウィンドウを `max_requests` で均等に割った値）
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.window_ms / u64::from(self.max_requests))
    }

    // 以下のリテラルは妥当な値なので検証付きのコンストラクタを通さない
    const fn preset(
        max_requests: u32,
        window_ms: u64,
        max_burst: Option<u32>,
        retry_after_ms: Option<u64>,
    ) -> Self {
        Self {
            max_requests,
            window_ms,
            max_burst,
            retry_after_ms,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::preset(10, 1_000, Some(15), Some(1_000))
    }
}

pub const SEARCH: &str = "gmail.search";
pub const READ: &str = "gmail.read";
pub const MODIFY: &str = "gmail.modify";
pub const ATTACHMENT: &str = "gmail.attachment";
pub const DAILY: &str = "gmail.daily";

/// QuotaTable は既知のキーの予算と全体のフォールバック
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaTable {
    quotas: HashMap<String, RateLimitConfig>,
    fallback: RateLimitConfig,
}

impl QuotaTable {
    /// 空の表。全てのキーが `fallback` になる
    pub fn new(fallback: RateLimitConfig) -> Self {
        Self {
            quotas: HashMap::new(),
            fallback,
        }
    }

    /// Gmail API のユーザーごとの制限から決めた組み込みの予算
    /// （250 quota units/s、list/get/modify/attachment は 1 回 5 units）
    pub fn builtin() -> Self {
        let mut table = Self::new(RateLimitConfig::default());
        table.insert(SEARCH, RateLimitConfig::preset(10, 1_000, Some(15), Some(2_000)));
        table.insert(READ, RateLimitConfig::preset(20, 1_000, Some(30), Some(1_500)));
        table.insert(MODIFY, RateLimitConfig::preset(10, 1_000, Some(15), Some(2_000)));
        table.insert(ATTACHMENT, RateLimitConfig::preset(10, 1_000, Some(15), Some(2_000)));
        table.insert(
            DAILY,
            RateLimitConfig::preset(10_000, 24 * 60 * 60 * 1_000, None, Some(60 * 60 * 1_000)),
        );
        table
    }

    pub fn insert(&mut self, key: impl Into<String>, config: RateLimitConfig) {
        self.quotas.insert(key.into(), config);
    }

    pub fn set_fallback(&mut self, fallback: RateLimitConfig) {
        self.fallback = fallback;
    }

    pub fn resolve(&self, key: &str) -> &RateLimitConfig {
        self.quotas.get(key).unwrap_or(&self.fallback)
    }

    /// 明示的な登録があるか（フォールバックしないか）
    pub fn contains(&self, key: &str) -> bool {
        self.quotas.contains_key(key)
    }

    pub fn fallback(&self) -> &RateLimitConfig {
        &self.fallback
    }

    /// 登録済みのキー（ソート済み）
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.quotas.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for QuotaTable {
    fn default() -> Self {
        Self::builtin()
    }
}
