//! RetryPolicy - 指数バックオフによるリトライ
//!
//! 1 つの操作を包んで、失敗したら待ってやり直す。

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::domain::{ConfigError, PacerEvent};
use crate::ports::{Clock, EventSink, NoopEventSink, SystemClock};

/// RetryPolicy は失敗した操作のリトライ方針
///
/// delay(attempt) = min(base_delay * factor^attempt, max_delay)（attempt は 0 始まり）
///
/// # 例: base_delay=1s, factor=2.0, max_retries=3
/// - attempt 0 失敗: 1s 待つ
/// - attempt 1 失敗: 2s 待つ
/// - attempt 2 失敗: 4s 待つ
/// - attempt 3 失敗: そのエラーで終了
///
/// `RateLimiter` を通す操作では、limiter の呼び出しをリトライするクロージャの
/// *内側* に置く。そうすれば試行ごとに予算が計上される。
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    factor: f64,
    /// 待ち時間に足すランダムな遅延の上限（0 なら無効）
    jitter: Duration,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        factor: f64,
    ) -> Result<Self, ConfigError> {
        if base_delay.is_zero() {
            return Err(ConfigError::InvalidRetry(
                "base_delay must be greater than 0".into(),
            ));
        }
        if max_delay < base_delay {
            return Err(ConfigError::InvalidRetry(format!(
                "max_delay ({max_delay:?}) must be >= base_delay ({base_delay:?})"
            )));
        }
        if !factor.is_finite() || factor <= 1.0 {
            return Err(ConfigError::InvalidRetry(format!(
                "factor must be a finite number greater than 1, got {factor}"
            )));
        }
        Ok(Self {
            max_retries,
            base_delay,
            max_delay,
            factor,
            jitter: Duration::ZERO,
            clock: Arc::new(SystemClock),
            sink: Arc::new(NoopEventSink),
        })
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// `attempt + 1` 回目のリトライ前の待ち時間（jitter なし）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        delay + Duration::from_millis(extra)
    }

    /// 全ての失敗をリトライ
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Debug,
    {
        self.execute_if(op, |_| true).await
    }

    /// `is_retriable` が true を返す失敗だけをリトライ
    ///
    /// それ以外はリトライを消費せずにその場で返す。`max_retries` 回リトライしても
    /// 失敗したら、最後のエラーをそのまま返す。
    pub async fn execute_if<T, E, F, Fut, P>(&self, mut op: F, is_retriable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Debug,
    {
        let mut attempt: u32 = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !is_retriable(&err) || attempt >= self.max_retries {
                return Err(err);
            }

            let delay = self.jittered(self.delay_for(attempt));
            let delay_ms = delay.as_millis() as u64;
            warn!(
                attempt = attempt + 1,
                max_retries = self.max_retries,
                delay_ms,
                error = ?err,
                "retrying after failure"
            );
            self.sink.emit(PacerEvent::RetryScheduled {
                attempt: attempt + 1,
                max_retries: self.max_retries,
                delay_ms,
                error: format!("{err:?}"),
            });
            self.clock.sleep(delay).await;
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    /// 3 回、1s から倍々、上限 30s
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: Duration::ZERO,
            clock: Arc::new(SystemClock),
            sink: Arc::new(NoopEventSink),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("factor", &self.factor)
            .field("jitter", &self.jitter)
            .finish()
    }
}
