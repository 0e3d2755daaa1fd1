//! App - アプリケーション層
//!
//! ports と limiter / retry / batch を組み合わせて使える形にする。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: 設定の検証とワイヤリング
//! - **RateLimitedClient**: `ApiClient` を limiter と retry で包むラッパー

pub mod builder;
pub mod client;

pub use self::builder::{App, AppBuilder, BuildError};
pub use self::client::{RateLimitedClient, STATUS_KEYS};
