//! KeyState - キーごとのウィンドウ状態
//!
//! ここは全て同期処理。判定から加算までを呼び出し側が 1 つのロック区間で行う。

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::domain::{AdmissionKind, LimiterError, RateLimitConfig};

/// drain が待機中の呼び出しに渡す許可
///
/// `window_start` は課金したウィンドウ。受け取り側が実行前に消えたとき、
/// 同じウィンドウの間だけ返金できる。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Granted {
    pub kind: AdmissionKind,
    pub window_start: Instant,
}

pub(crate) type Grant = Result<Granted, LimiterError>;

/// 待機列に並んでいる呼び出し
#[derive(Debug)]
pub(crate) struct Waiter {
    pub ticket: u64,
    pub tx: oneshot::Sender<Grant>,
    pub config: RateLimitConfig,
    pub enqueued_at: Instant,
}

/// キーごとに 1 つだけの drain タスク
#[derive(Debug)]
pub(crate) struct DrainSlot {
    pub id: u64,
    pub handle: JoinHandle<()>,
}

#[derive(Debug)]
pub(crate) struct KeyState {
    pub requests_in_window: u32,
    pub window_start: Instant,
    /// 直近の呼び出しの設定（状態参照用）
    pub config: RateLimitConfig,
    pub waiters: VecDeque<Waiter>,
    pub drain: Option<DrainSlot>,
}

impl KeyState {
    pub fn new(now: Instant, config: RateLimitConfig) -> Self {
        Self {
            requests_in_window: 0,
            window_start: now,
            config,
            waiters: VecDeque::new(),
            drain: None,
        }
    }

    fn window_elapsed(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.window_start) >= window
    }

    /// ウィンドウ長を過ぎていれば新しいウィンドウを始める
    pub fn roll_if_elapsed(&mut self, now: Instant, window: Duration) {
        if self.window_elapsed(now, window) {
            self.requests_in_window = 0;
            self.window_start = now;
        }
    }

    /// 空きがあれば 1 件分を課金する
    pub fn try_take(&mut self, config: &RateLimitConfig) -> Option<AdmissionKind> {
        if self.requests_in_window < config.max_requests() {
            self.requests_in_window += 1;
            return Some(AdmissionKind::Nominal);
        }
        match config.max_burst() {
            Some(burst) if self.requests_in_window < burst => {
                self.requests_in_window += 1;
                Some(AdmissionKind::Burst)
            }
            _ => None,
        }
    }

    pub fn time_until_roll(&self, now: Instant, window: Duration) -> Duration {
        window.saturating_sub(now.saturating_duration_since(self.window_start))
    }

    /// `now` 時点のウィンドウで数えたリクエスト数
    pub fn effective_requests(&self, now: Instant) -> u32 {
        if self.window_elapsed(now, self.config.window()) {
            0
        } else {
            self.requests_in_window
        }
    }

    /// 呼び出し側が消えた待機を取り除く
    pub fn purge_closed(&mut self) {
        self.waiters.retain(|w| !w.tx.is_closed());
    }

    /// `window_start` のウィンドウがまだ続いていれば 1 件分を返す
    pub fn refund(&mut self, window_start: Instant) -> bool {
        if self.window_start != window_start || self.requests_in_window == 0 {
            return false;
        }
        self.requests_in_window -= 1;
        true
    }

    pub fn abort_drain(&mut self) {
        if let Some(slot) = self.drain.take() {
            slot.handle.abort();
        }
    }
}
