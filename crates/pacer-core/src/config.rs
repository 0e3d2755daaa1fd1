//! Config - 設定の読み込み
//!
//! JSON（文字列またはファイル）→ 環境変数の上書き → `AppBuilder::build` で検証、の順。
//! 不正な値は構築時にまとめて `ConfigError` になる。

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::{BatchOptions, BatchSettings};
use crate::domain::{ConfigError, QuotaTable, RateLimitConfig};
use crate::retry::RetryPolicy;

pub const ENV_MAX_RETRIES: &str = "PACER_MAX_RETRIES";
pub const ENV_RETRY_DELAY_MS: &str = "PACER_RETRY_DELAY_MS";
pub const ENV_BATCH_SIZE: &str = "PACER_BATCH_SIZE";
pub const ENV_BATCH_DELAY_MS: &str = "PACER_BATCH_DELAY_MS";

/// PacerConfig はコードを変えずに調整できる設定の全体
///
/// 無いセクションはデフォルト値になるので `{}` も有効な設定。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PacerConfig {
    /// 全体のフォールバック予算を置き換える
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_quota: Option<RateLimitConfig>,
    /// 組み込みの表に上書きでマージ（ここに書いたキーが優先）
    pub quotas: BTreeMap<String, RateLimitConfig>,
    pub batch: BatchOptions,
    pub retry: RetrySettings,
}

/// retry セクション。[`RetryPolicy`] に変換するときに検証する
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            factor: 2.0,
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> Result<RetryPolicy, ConfigError> {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.factor,
        )
    }
}

impl PacerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        debug!(path = %path.display(), "loaded config file");
        Self::from_json_str(&raw)
    }

    /// ファイル（無ければデフォルト）を読み、環境変数で上書き
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// `lookup` で読んだ `PACER_*` を上書き適用
    ///
    /// 関数で受け取るので、テストは実際のプロセス環境に触れない。
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(n) = parse_env::<u32>(&lookup, ENV_MAX_RETRIES)? {
            self.retry.max_retries = n;
        }
        if let Some(ms) = parse_env::<u64>(&lookup, ENV_RETRY_DELAY_MS)? {
            self.retry.base_delay_ms = ms;
            // base だけ上げても上限を下回らないようにする
            self.retry.max_delay_ms = self.retry.max_delay_ms.max(ms);
        }

        let mut batch = BatchSettings::from(self.batch);
        let mut batch_changed = false;
        if let Some(size) = parse_env::<usize>(&lookup, ENV_BATCH_SIZE)? {
            batch.batch_size = size;
            batch_changed = true;
        }
        if let Some(ms) = parse_env::<u64>(&lookup, ENV_BATCH_DELAY_MS)? {
            batch.inter_batch_delay_ms = ms;
            batch_changed = true;
        }
        if batch_changed {
            self.batch = BatchOptions::try_from(batch)?;
        }
        Ok(())
    }

    /// 組み込みの表にこの設定の上書きを適用したもの
    pub fn quota_table(&self) -> QuotaTable {
        let mut table = QuotaTable::builtin();
        if let Some(fallback) = &self.default_quota {
            table.set_fallback(fallback.clone());
        }
        for (key, quota) in &self.quotas {
            table.insert(key.clone(), quota.clone());
        }
        table
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        self.retry.to_policy()
    }
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    let Some(value) = lookup(name) else {
        return Ok(None);
    };
    let value = value.trim().to_owned();
    value
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidEnv {
            name: name.to_owned(),
            value,
        })
}
