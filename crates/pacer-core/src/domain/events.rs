//! Events - 監視用イベント
//!
//! `EventSink` に渡される。ログとは別に、バースト枠の使用や待機列の
//! 動きを数えたいときに使う。

use serde::{Deserialize, Serialize};

/// AdmissionKind は limiter を通った枠の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionKind {
    /// `max_requests` 以内
    Nominal,
    /// `max_requests` 超、`max_burst` 以内
    Burst,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PacerEvent {
    Admitted {
        key: String,
        requests_in_window: u32,
        max_requests: u32,
    },
    BurstAdmitted {
        key: String,
        requests_in_window: u32,
        max_burst: u32,
    },
    Queued {
        key: String,
        ticket: u64,
        queue_len: usize,
        wait_ms: u64,
    },
    Released {
        key: String,
        ticket: u64,
        admission: AdmissionKind,
        waited_ms: u64,
    },
    Cancelled {
        key: String,
        ticket: u64,
    },
    Reset {
        key: Option<String>,
        rejected: usize,
    },
    RetryScheduled {
        attempt: u32,
        max_retries: u32,
        delay_ms: u64,
        error: String,
    },
    BatchStarted {
        key: String,
        index: usize,
        total: usize,
        size: usize,
    },
    BatchPaused {
        key: String,
        delay_ms: u64,
    },
}

impl PacerEvent {
    /// 短い名前（シリアライズ時のタグと同じ）
    pub fn name(&self) -> &'static str {
        match self {
            PacerEvent::Admitted { .. } => "admitted",
            PacerEvent::BurstAdmitted { .. } => "burst_admitted",
            PacerEvent::Queued { .. } => "queued",
            PacerEvent::Released { .. } => "released",
            PacerEvent::Cancelled { .. } => "cancelled",
            PacerEvent::Reset { .. } => "reset",
            PacerEvent::RetryScheduled { .. } => "retry_scheduled",
            PacerEvent::BatchStarted { .. } => "batch_started",
            PacerEvent::BatchPaused { .. } => "batch_paused",
        }
    }
}
