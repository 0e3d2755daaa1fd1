//! Impls - ports の実装（開発用・テスト用）
//!
//! 本番用の `SystemClock` と `NoopEventSink` は ports 側にある。

pub mod memory_sink;

pub use self::memory_sink::{MemoryEventSink, RecordedEvent};
