//! BatchProcessor - 一括処理の分割とペーシング
//!
//! 入力を `batch_size` ごとに区切り、バッチ内は並行に limiter を通して実行、
//! バッチ間で `inter_batch_delay` だけ待つ（最後のバッチの後は待たない）。

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::{ConfigError, LimiterError, PacerEvent};
use crate::limiter::RateLimiter;
use crate::ports::{Clock, EventSink, NoopEventSink, SystemClock};

/// BatchOptions はバッチの大きさとバッチ間の待ち時間（どちらも正の値）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BatchSettings", into = "BatchSettings")]
pub struct BatchOptions {
    batch_size: NonZeroUsize,
    inter_batch_delay: Duration,
}

/// 設定ファイル上の [`BatchOptions`] の形
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub inter_batch_delay_ms: u64,
}

impl BatchOptions {
    pub fn new(batch_size: usize, inter_batch_delay: Duration) -> Result<Self, ConfigError> {
        let batch_size = NonZeroUsize::new(batch_size)
            .ok_or_else(|| ConfigError::InvalidBatch("batch_size must be greater than 0".into()))?;
        if inter_batch_delay.is_zero() {
            return Err(ConfigError::InvalidBatch(
                "inter_batch_delay must be greater than 0".into(),
            ));
        }
        Ok(Self {
            batch_size,
            inter_batch_delay,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.get()
    }

    pub fn inter_batch_delay(&self) -> Duration {
        self.inter_batch_delay
    }
}

impl Default for BatchOptions {
    /// 10 items, 1s apart.
    fn default() -> Self {
        Self {
            batch_size: NonZeroUsize::new(10).unwrap_or(NonZeroUsize::MIN),
            inter_batch_delay: Duration::from_secs(1),
        }
    }
}

impl TryFrom<BatchSettings> for BatchOptions {
    type Error = ConfigError;

    fn try_from(s: BatchSettings) -> Result<Self, Self::Error> {
        Self::new(s.batch_size, Duration::from_millis(s.inter_batch_delay_ms))
    }
}

impl From<BatchOptions> for BatchSettings {
    fn from(o: BatchOptions) -> Self {
        Self {
            batch_size: o.batch_size(),
            inter_batch_delay_ms: o.inter_batch_delay.as_millis() as u64,
        }
    }
}

/// 順序を保ったまま最大 `size` 件ずつに区切る
pub(crate) fn partition<T>(items: Vec<T>, size: NonZeroUsize) -> Vec<Vec<T>> {
    let mut batches = Vec::with_capacity(items.len().div_ceil(size.get()));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(size.get()).collect());
    }
    batches
}

#[derive(Clone)]
pub struct BatchProcessor {
    limiter: RateLimiter,
    options: BatchOptions,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
}

impl BatchProcessor {
    pub fn new(limiter: RateLimiter, options: BatchOptions) -> Self {
        Self {
            limiter,
            options,
            clock: Arc::new(SystemClock),
            sink: Arc::new(NoopEventSink),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn options(&self) -> BatchOptions {
        self.options
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// 設定どおりのバッチ分割と待ち時間で `items` に `op` を適用
    ///
    /// `result[i]` は `items[i]` の結果。1 件の失敗で残りは止めない。
    /// 全体を失敗扱いにするかは呼び出し側が決める。
    pub async fn process_batch<T, R, E, F, Fut>(
        &self,
        items: Vec<T>,
        op: F,
        key: &str,
    ) -> Vec<Result<R, E>>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<LimiterError>,
    {
        self.process_batch_with(items, op, key, self.options).await
    }

    pub async fn process_batch_with<T, R, E, F, Fut>(
        &self,
        items: Vec<T>,
        op: F,
        key: &str,
        options: BatchOptions,
    ) -> Vec<Result<R, E>>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<LimiterError>,
    {
        let (limiter, op) = (&self.limiter, &op);
        self.process_paced_with(
            items,
            move |item| limiter.execute(key, move || op(item)),
            key,
            options,
        )
        .await
    }

    /// 分割と待ち時間だけを行う
    ///
    /// `op` 自身が limiter を通る前提（limiter を内側に持つリトライなど）で、
    /// ここでは予算を使わない。
    pub async fn process_paced<T, O, F, Fut>(&self, items: Vec<T>, op: F, key: &str) -> Vec<O>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = O>,
    {
        self.process_paced_with(items, op, key, self.options).await
    }

    pub async fn process_paced_with<T, O, F, Fut>(
        &self,
        items: Vec<T>,
        op: F,
        key: &str,
        options: BatchOptions,
    ) -> Vec<O>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = O>,
    {
        let total_items = items.len();
        let batches = partition(items, options.batch_size);
        let total = batches.len();
        info!(key, items = total_items, batches = total, "processing items in batches");

        let mut results = Vec::with_capacity(total_items);
        for (index, batch) in batches.into_iter().enumerate() {
            let size = batch.len();
            debug!(key, batch = index + 1, total, size, "processing batch");
            self.sink.emit(PacerEvent::BatchStarted {
                key: key.to_owned(),
                index,
                total,
                size,
            });

            results.extend(join_all(batch.into_iter().map(&op)).await);

            if index + 1 < total {
                let delay = options.inter_batch_delay;
                self.sink.emit(PacerEvent::BatchPaused {
                    key: key.to_owned(),
                    delay_ms: delay.as_millis() as u64,
                });
                self.clock.sleep(delay).await;
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::time::Instant;

    use super::*;
    use crate::domain::{ApiError, QuotaTable, RateLimitConfig};
    use crate::impls::MemoryEventSink;

    const KEY: &str = "batch.key";

    fn processor(max_requests: u32, sink: Arc<MemoryEventSink>) -> BatchProcessor {
        let mut table = QuotaTable::builtin();
        table.insert(KEY, RateLimitConfig::new(max_requests, 1_000).unwrap());
        let limiter = RateLimiter::new(table, Arc::new(SystemClock), sink.clone());
        let options = BatchOptions::new(3, Duration::from_millis(500)).unwrap();
        BatchProcessor::new(limiter, options).with_event_sink(sink)
    }

    #[test]
    fn partition_keeps_order_and_remainder() {
        let size = NonZeroUsize::new(3).unwrap();
        let batches = partition((1..=7).collect(), size);
        assert_eq!(batches, vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]);
        assert!(partition(Vec::<u8>::new(), size).is_empty());
    }

    #[test]
    fn options_reject_zero_values() {
        assert!(BatchOptions::new(0, Duration::from_secs(1)).is_err());
        assert!(BatchOptions::new(5, Duration::ZERO).is_err());
        let parsed: BatchOptions =
            serde_json::from_str(r#"{"batch_size": 4, "inter_batch_delay_ms": 250}"#).unwrap();
        assert_eq!(parsed.batch_size(), 4);
        assert_eq!(parsed.inter_batch_delay(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn seven_items_make_three_batches_and_two_pauses() {
        let sink = Arc::new(MemoryEventSink::new());
        let processor = processor(100, sink.clone());
        let start = Instant::now();

        let results = processor
            .process_batch(
                (0..7).collect(),
                |n: u32| async move { Ok::<_, LimiterError>(n * 10) },
                KEY,
            )
            .await;

        let values: Vec<u32> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![0, 10, 20, 30, 40, 50, 60]);

        let sizes: Vec<usize> = sink
            .events()
            .into_iter()
            .filter_map(|ev| match ev {
                PacerEvent::BatchStarted { size, .. } => Some(size),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(sink.count("batch_paused"), 2);

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1_000));
        assert!(elapsed < Duration::from_millis(1_005));
    }

    #[tokio::test(start_paused = true)]
    async fn results_keep_input_order_when_earlier_items_finish_last() {
        let sink = Arc::new(MemoryEventSink::new());
        let processor = processor(100, sink);
        let finished = Mutex::new(Vec::new());

        let results = processor
            .process_batch(
                vec!["a", "b", "c"],
                |item: &'static str| {
                    let finished = &finished;
                    async move {
                        let delay = match item {
                            "a" => 300,
                            "b" => 200,
                            _ => 100,
                        };
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        finished.lock().unwrap().push(item);
                        Ok::<_, LimiterError>(item.to_uppercase())
                    }
                },
                KEY,
            )
            .await;

        assert_eq!(*finished.lock().unwrap(), vec!["c", "b", "a"]);
        let values: Vec<String> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec!["A", "B", "C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_items_do_not_abort_the_run() {
        let sink = Arc::new(MemoryEventSink::new());
        let processor = processor(100, sink.clone());

        let results = processor
            .process_batch(
                (1..=5).collect(),
                |n: u32| async move {
                    if n == 2 {
                        Err(ApiError::from_status(404, "missing"))
                    } else {
                        Ok(n)
                    }
                },
                KEY,
            )
            .await;

        assert_eq!(results.len(), 5);
        assert_eq!(results[1], Err(ApiError::from_status(404, "missing")));
        assert_eq!(results[4], Ok(5));
        assert_eq!(sink.count("batch_started"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn batches_share_the_rate_limit() {
        let sink = Arc::new(MemoryEventSink::new());
        let processor = processor(2, sink.clone());
        let options = BatchOptions::new(4, Duration::from_millis(100)).unwrap();

        let results = processor
            .process_batch_with(
                vec![1, 2, 3, 4],
                |n: u32| async move { Ok::<_, LimiterError>(n) },
                KEY,
                options,
            )
            .await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(sink.count("admitted"), 2);
        assert_eq!(sink.count("queued"), 2);
        assert_eq!(sink.count("batch_paused"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn paced_processing_leaves_admission_to_the_op() {
        let sink = Arc::new(MemoryEventSink::new());
        let processor = processor(1, sink.clone());

        let results = processor
            .process_paced((1..=4).collect(), |n: u32| async move { n + 1 }, KEY)
            .await;

        assert_eq!(results, vec![2, 3, 4, 5]);
        assert_eq!(processor.limiter().requests_in_window(KEY), 0);
        assert_eq!(sink.count("batch_started"), 2);
        assert_eq!(sink.count("queued"), 0);
    }
}
