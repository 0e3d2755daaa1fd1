//! Status - キーごとの状態スナップショット

use serde::{Deserialize, Serialize};

/// KeyStatus は 1 キーのある時点の状態（監視とデモの出力用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStatus {
    pub key: String,
    pub requests_in_window: u32,
    pub max_requests: u32,
    pub remaining_requests: u32,
    pub is_rate_limited: bool,
    pub queued: usize,
    pub draining: bool,
}
