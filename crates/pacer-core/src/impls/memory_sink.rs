//! MemoryEventSink - イベントをメモリに貯める（テスト・デモ用）

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::PacerEvent;
use crate::ports::EventSink;

#[derive(Debug, Clone, Serialize)]
pub struct RecordedEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: PacerEvent,
}

#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PacerEvent> {
        self.lock().iter().map(|r| r.event.clone()).collect()
    }

    pub fn records(&self) -> Vec<RecordedEvent> {
        self.lock().clone()
    }

    /// 指定した名前のイベント数（`PacerEvent::name` 参照）
    pub fn count(&self, name: &str) -> usize {
        self.lock().iter().filter(|r| r.event.name() == name).count()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<RecordedEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: PacerEvent) {
        self.lock().push(RecordedEvent {
            at: Utc::now(),
            event,
        });
    }
}
