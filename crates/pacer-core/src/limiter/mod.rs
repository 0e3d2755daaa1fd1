//! RateLimiter - キー単位のウィンドウ制御と待機列
//!
//! # 流れ
//! 1. ウィンドウが終わっていれば巻き戻す
//! 2. `max_requests` 未満なら即時実行（通常枠）
//! 3. `max_burst` 未満なら即時実行（バースト枠、warn ログ + `BurstAdmitted`）
//! 4. それ以外は待機列へ。drain タスクが先頭から 1 件ずつ解放する
//!
//! 2 と 3 の判定は待機列の長さに関係なく行う。空きがあるのに新しい呼び出しを
//! 待たせることはしない。待機列の中は常に FIFO。
//!
//! # ロック
//! 状態は `std::sync::Mutex` 1 つ。判定とカウントの加算は同じロック区間で行い、
//! ロックを持ったまま `.await` しない。

mod drain;
mod state;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use self::state::{DrainSlot, Grant, Granted, KeyState, Waiter};
use crate::domain::{
    AdmissionKind, KeyStatus, LimiterError, PacerEvent, QuotaTable, RateLimitConfig,
};
use crate::ports::{Clock, EventSink, NoopEventSink, SystemClock};

/// RateLimiter はキー単位のレート制限のハンドル
///
/// clone は安価で、全ての clone が同じ状態を共有する。グローバルなインスタンスは
/// 持たず、アプリケーションを組み立てる側が作る（`AppBuilder` 参照）。
///
/// # 使用例
/// ```ignore
/// let limiter = RateLimiter::default();
/// let messages = limiter
///     .execute("gmail.read", || api.list_messages())
///     .await?;
/// ```
#[derive(Clone)]
pub struct RateLimiter {
    shared: Arc<Shared>,
}

struct Shared {
    states: Mutex<HashMap<String, KeyState>>,
    quotas: QuotaTable,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    next_ticket: AtomicU64,
    next_drain: AtomicU64,
    closed: AtomicBool,
}

enum Admission {
    Now(AdmissionKind),
    Wait(Ticket),
}

impl RateLimiter {
    pub fn new(quotas: QuotaTable, clock: Arc<dyn Clock>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                states: Mutex::new(HashMap::new()),
                quotas,
                clock,
                sink,
                next_ticket: AtomicU64::new(1),
                next_drain: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn quotas(&self) -> &QuotaTable {
        &self.shared.quotas
    }

    /// `key` に空きができたら `op` を実行（予算は quota 表から引く）
    ///
    /// `op` のエラーはそのまま返す。失敗した呼び出しも予算を消費する。
    pub async fn execute<T, E, F, Fut>(&self, key: &str, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LimiterError>,
    {
        let config = self.shared.quotas.resolve(key).clone();
        self.execute_with(key, config, op).await
    }

    /// 予算を明示して [`execute`](Self::execute) する
    pub async fn execute_with<T, E, F, Fut>(
        &self,
        key: &str,
        config: RateLimitConfig,
        op: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LimiterError>,
    {
        self.acquire(key, config).await?;
        op().await
    }

    /// 何も実行せずに `key` の 1 件分の予算だけを待つ
    ///
    /// 待機中に future を破棄すると待機列から外れる。解放済みで未実行のまま
    /// 破棄された場合は、同じウィンドウの間なら予算を返す。
    pub async fn acquire(
        &self,
        key: &str,
        config: RateLimitConfig,
    ) -> Result<AdmissionKind, LimiterError> {
        match self.shared.admit(key, config)? {
            Admission::Now(kind) => Ok(kind),
            Admission::Wait(ticket) => ticket.wait().await.map(|granted| granted.kind),
        }
    }

    /// `f` を `key` の予算で制限された関数に包む
    ///
    /// # 使用例
    /// ```ignore
    /// let read = limiter.wrap("gmail.read", |id: String| api.read(id));
    /// let message = read.call("m1".into()).await?;
    /// ```
    pub fn wrap<F>(&self, key: impl Into<String>, f: F) -> RateLimited<F> {
        RateLimited {
            limiter: self.clone(),
            key: key.into(),
            f,
        }
    }

    pub fn requests_in_window(&self, key: &str) -> u32 {
        self.shared
            .inspect(key, |state, now| state.effective_requests(now))
            .unwrap_or(0)
    }

    /// 現在のウィンドウで `max_requests` 以上使っているか
    pub fn is_rate_limited(&self, key: &str) -> bool {
        self.shared
            .inspect(key, |state, now| {
                state.effective_requests(now) >= state.config.max_requests()
            })
            .unwrap_or(false)
    }

    /// 現在のウィンドウの残り（通常枠のみ、バースト枠は含まない）
    pub fn remaining_requests(&self, key: &str) -> u32 {
        self.shared
            .inspect(key, |state, now| {
                state
                    .config
                    .max_requests()
                    .saturating_sub(state.effective_requests(now))
            })
            .unwrap_or_else(|| self.shared.quotas.resolve(key).max_requests())
    }

    pub fn queued(&self, key: &str) -> usize {
        self.shared
            .inspect(key, |state, _| state.waiters.len())
            .unwrap_or(0)
    }

    pub fn status(&self, key: &str) -> KeyStatus {
        let max_requests = self
            .shared
            .inspect(key, |state, _| state.config.max_requests())
            .unwrap_or_else(|| self.shared.quotas.resolve(key).max_requests());
        KeyStatus {
            key: key.to_owned(),
            requests_in_window: self.requests_in_window(key),
            max_requests,
            remaining_requests: self.remaining_requests(key),
            is_rate_limited: self.is_rate_limited(key),
            queued: self.queued(key),
            draining: self
                .shared
                .inspect(key, |state, _| state.drain.is_some())
                .unwrap_or(false),
        }
    }

    /// 1 キー分、`None` なら全キーの状態を消す
    ///
    /// 消したキーで待機中の呼び出しは [`LimiterError::Reset`] で終わり、
    /// drain も止まる。戻り値は拒否した件数。
    pub fn reset(&self, key: Option<&str>) -> usize {
        let rejected = self
            .shared
            .clear(key, |key| LimiterError::Reset { key });
        match key {
            Some(key) => debug!(key, rejected, "reset rate limit state"),
            None => debug!(rejected, "reset all rate limit states"),
        }
        self.shared.sink.emit(PacerEvent::Reset {
            key: key.map(str::to_owned),
            rejected,
        });
        rejected
    }

    /// 待機中を全て拒否し、以降の呼び出しも受け付けない
    pub fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let rejected = self.shared.clear(None, |key| LimiterError::Shutdown { key });
        info!(rejected, "rate limiter shut down");
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(
            QuotaTable::builtin(),
            Arc::new(SystemClock),
            Arc::new(NoopEventSink),
        )
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, KeyState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn inspect<R>(
        &self,
        key: &str,
        f: impl FnOnce(&KeyState, tokio::time::Instant) -> R,
    ) -> Option<R> {
        let now = self.clock.now();
        self.lock().get(key).map(|state| f(state, now))
    }

    fn admit(
        self: &Arc<Self>,
        key: &str,
        config: RateLimitConfig,
    ) -> Result<Admission, LimiterError> {
        let now = self.clock.now();
        let mut states = self.lock();
        // shutdown と競合しないようロック内で確認する
        if self.closed.load(Ordering::SeqCst) {
            return Err(LimiterError::Shutdown {
                key: key.to_owned(),
            });
        }
        let state = states
            .entry(key.to_owned())
            .or_insert_with(|| KeyState::new(now, config.clone()));
        state.roll_if_elapsed(now, config.window());

        if let Some(kind) = state.try_take(&config) {
            let requests_in_window = state.requests_in_window;
            state.config = config;
            let event = match kind {
                AdmissionKind::Nominal => {
                    let max_requests = state.config.max_requests();
                    drop(states);
                    debug!(key, requests_in_window, max_requests, "request admitted");
                    PacerEvent::Admitted {
                        key: key.to_owned(),
                        requests_in_window,
                        max_requests,
                    }
                }
                AdmissionKind::Burst => {
                    let max_burst = state.config.ceiling();
                    drop(states);
                    warn!(key, requests_in_window, max_burst, "using burst capacity");
                    PacerEvent::BurstAdmitted {
                        key: key.to_owned(),
                        requests_in_window,
                        max_burst,
                    }
                }
            };
            self.sink.emit(event);
            return Ok(Admission::Now(kind));
        }

        let wait = config
            .retry_after()
            .unwrap_or_else(|| state.time_until_roll(now, config.window()));
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(Waiter {
            ticket,
            tx,
            config: config.clone(),
            enqueued_at: now,
        });
        state.config = config;
        let queue_len = state.waiters.len();
        if state.drain.is_none() {
            state.drain = Some(self.spawn_drain(key, wait));
        }
        drop(states);

        let wait_ms = wait.as_millis() as u64;
        warn!(key, ticket, wait_ms, queue_len, "rate limited, call queued");
        self.sink.emit(PacerEvent::Queued {
            key: key.to_owned(),
            ticket,
            queue_len,
            wait_ms,
        });

        Ok(Admission::Wait(Ticket {
            shared: Arc::clone(self),
            key: key.to_owned(),
            id: ticket,
            rx,
            settled: false,
        }))
    }

    fn spawn_drain(self: &Arc<Self>, key: &str, delay: std::time::Duration) -> DrainSlot {
        let id = self.next_drain.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(drain::run(
            Arc::downgrade(self),
            key.to_owned(),
            id,
            delay,
        ));
        DrainSlot { id, handle }
    }

    /// 放棄された待機を外す。解放するものが無くなれば drain も止める
    fn cancel(&self, key: &str, ticket: u64) {
        {
            let mut states = self.lock();
            let Some(state) = states.get_mut(key) else {
                return;
            };
            let Some(pos) = state.waiters.iter().position(|w| w.ticket == ticket) else {
                return;
            };
            state.waiters.remove(pos);
            if state.waiters.is_empty() {
                state.abort_drain();
            }
        }
        debug!(key, ticket, "queued call cancelled");
        self.sink.emit(PacerEvent::Cancelled {
            key: key.to_owned(),
            ticket,
        });
    }

    /// 解放済みだが実行されずに破棄された呼び出しの予算を返す
    fn refund(&self, key: &str, ticket: u64, granted: Granted) {
        let refunded = self
            .lock()
            .get_mut(key)
            .is_some_and(|state| state.refund(granted.window_start));
        debug!(key, ticket, refunded, "released call dropped before running");
        self.sink.emit(PacerEvent::Cancelled {
            key: key.to_owned(),
            ticket,
        });
    }

    fn clear(&self, key: Option<&str>, reason: impl Fn(String) -> LimiterError) -> usize {
        let removed: Vec<(String, KeyState)> = {
            let mut states = self.lock();
            match key {
                Some(key) => states.remove_entry(key).into_iter().collect(),
                None => states.drain().collect(),
            }
        };

        let mut rejected = 0;
        for (key, mut state) in removed {
            state.abort_drain();
            for waiter in state.waiters.drain(..) {
                if waiter.tx.send(Err(reason(key.clone()))).is_ok() {
                    rejected += 1;
                }
            }
        }
        rejected
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let states = self
            .states
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for state in states.values_mut() {
            state.abort_drain();
        }
    }
}

/// 待機中の呼び出しの引換券
struct Ticket {
    shared: Arc<Shared>,
    key: String,
    id: u64,
    rx: oneshot::Receiver<Grant>,
    settled: bool,
}

impl Ticket {
    async fn wait(mut self) -> Grant {
        let grant = (&mut self.rx).await;
        self.settled = true;
        match grant {
            Ok(grant) => grant,
            // 応答なしで送信側が消えた: limiter が破棄された
            Err(_) => Err(LimiterError::Shutdown {
                key: self.key.clone(),
            }),
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // close 後は drain が送れないので、受け取り済みかどうかがここで確定する
        self.rx.close();
        match self.rx.try_recv() {
            Ok(Ok(granted)) => self.shared.refund(&self.key, self.id, granted),
            _ => self.shared.cancel(&self.key, self.id),
        }
    }
}

/// [`RateLimiter::wrap`] が返す、レート制限付きの関数
///
/// `call` のたびに `key` の予算を 1 件使う。
#[derive(Clone)]
pub struct RateLimited<F> {
    limiter: RateLimiter,
    key: String,
    f: F,
}

impl<F> RateLimited<F> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn call<A, T, E, Fut>(&self, arg: A) -> Result<T, E>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LimiterError>,
    {
        self.limiter.execute(&self.key, || (self.f)(arg)).await
    }
}

#[cfg(test)]
mod tests;
