//! EventSink port - 監視イベントの送り先
//!
//! `emit` は limiter のロックの外から呼ばれる。実装は軽く保つこと
//! （ブロックしない、limiter を呼び返さない）。

use crate::domain::PacerEvent;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: PacerEvent);
}

/// 何もしない（デフォルト）
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: PacerEvent) {}
}
