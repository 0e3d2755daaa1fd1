//! Ports - 抽象化レイヤー
//!
//! limiter が外部に求めるもの（時刻、監視イベントの送り先）と、
//! 保護対象の API クライアントのインターフェース。

pub mod api_client;
pub mod clock;
pub mod event_sink;

pub use self::api_client::{ApiClient, ApiRequest, Operation};
pub use self::clock::{Clock, SystemClock};
pub use self::event_sink::{EventSink, NoopEventSink};
