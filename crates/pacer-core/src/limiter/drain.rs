//! Drain - 待機列の解放
//!
//! キーごとに drain タスクは最大 1 つ。`KeyState::drain` に入っている id と
//! 一致しないタスクは古いものとして何もせず終了する。

use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::debug;

use super::Shared;
use super::state::Granted;
use crate::domain::PacerEvent;

// ウィンドウ切り替え待ちで再スケジュールするときの下限
const MIN_RETICK: Duration = Duration::from_millis(1);

/// 待って 1 件解放、を待機列が空になるまで繰り返す
///
/// tick の間は弱参照だけを持つ。limiter が破棄されればそこで終わる。
pub(super) async fn run(shared: Weak<Shared>, key: String, id: u64, first_delay: Duration) {
    let mut delay = first_delay;
    loop {
        let Some(clock) = shared.upgrade().map(|s| Arc::clone(&s.clock)) else {
            return;
        };
        clock.sleep(delay).await;
        drop(clock);

        let Some(strong) = shared.upgrade() else {
            return;
        };
        match strong.drain_once(&key, id) {
            Some(next) => delay = next,
            None => return,
        }
    }
}

impl Shared {
    /// drain の 1 tick。次の tick までの待ち時間を返す
    ///
    /// 待機列が空になった、キーがリセットされた、別の drain に置き換わった
    /// 場合は `None`。
    pub(super) fn drain_once(&self, key: &str, id: u64) -> Option<Duration> {
        let now = self.clock.now();
        let mut released = None;

        let next = {
            let mut states = self.lock();
            let state = states.get_mut(key)?;
            if state.drain.as_ref().map(|slot| slot.id) != Some(id) {
                return None;
            }
            state.purge_closed();

            loop {
                let Some(waiter) = state.waiters.pop_front() else {
                    state.drain = None;
                    break None;
                };
                let config = waiter.config.clone();
                state.roll_if_elapsed(now, config.window());
                let Some(kind) = state.try_take(&config) else {
                    // まだ満杯。先頭は残してウィンドウ切り替えで再試行
                    let wait = state.time_until_roll(now, config.window()).max(MIN_RETICK);
                    state.waiters.push_front(waiter);
                    break Some(wait);
                };
                let waited = now.saturating_duration_since(waiter.enqueued_at);
                let granted = Granted {
                    kind,
                    window_start: state.window_start,
                };
                if waiter.tx.send(Ok(granted)).is_err() {
                    // purge の後に呼び出し側が消えた。枠を返す
                    state.refund(granted.window_start);
                    continue;
                }
                released = Some((waiter.ticket, kind, waited));
                if state.waiters.is_empty() {
                    state.drain = None;
                    break None;
                }
                break Some(config.drain_interval());
            }
        };

        if let Some((ticket, admission, waited)) = released {
            let waited_ms = waited.as_millis() as u64;
            debug!(key, ticket, ?admission, waited_ms, "queued call released");
            self.sink.emit(PacerEvent::Released {
                key: key.to_owned(),
                ticket,
                admission,
                waited_ms,
            });
        }
        next
    }
}
