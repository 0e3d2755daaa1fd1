//! Clock port - 時刻とタイマーの抽象化
//!
//! `tokio::time` の `Instant` を返すので、テストでは
//! `#[tokio::test(start_paused = true)]` で仮想時間を使える。

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

/// Clock は単調増加する現在時刻と遅延待機を提供
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// tokio のタイマーをそのまま使う実装（本番用）
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
