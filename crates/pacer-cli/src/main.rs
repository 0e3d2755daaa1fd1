use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::{Duration, sleep};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pacer_core::config::PacerConfig;
use pacer_core::domain::{ApiError, KeyStatus};
use pacer_core::impls::MemoryEventSink;
use pacer_core::ports::{ApiClient, ApiRequest, Operation};
use pacer_core::AppBuilder;

/// 擬似メール API: `fail_every` 回ごとに 503、
/// "missing" で始まる ID には 404 を返す
struct FlakyMailApi {
    calls: AtomicU32,
    fail_every: u32,
}

impl FlakyMailApi {
    fn new(fail_every: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_every,
        }
    }
}

#[async_trait]
impl ApiClient for FlakyMailApi {
    async fn call(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        // ネットワーク遅延のふり
        sleep(Duration::from_millis(20)).await;

        if request.name.starts_with("missing") {
            return Err(ApiError::from_status(404, format!("{} not found", request.name)));
        }
        if self.fail_every > 0 && n % self.fail_every == 0 {
            return Err(ApiError::from_status(503, "backend unavailable"));
        }

        Ok(match request.operation {
            Operation::Search => json!({ "query": request.name, "ids": ["m1", "m2", "m3"] }),
            Operation::Read => json!({ "id": request.name, "subject": format!("message {}", request.name) }),
            Operation::Modify => json!({ "id": request.name, "applied": request.params }),
            Operation::Attachment => json!({ "id": request.name, "bytes": 1024 }),
        })
    }
}

#[derive(Serialize)]
struct Summary {
    read_ok: usize,
    read_failed: usize,
    modified: usize,
    api_calls: u32,
    retries: usize,
    queued: usize,
    status: Vec<KeyStatus>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // (A) 設定: 引数で JSON ファイルを渡せる。PACER_* 環境変数が上書きする
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = PacerConfig::load(path.as_deref())?;

    // (B) ワイヤリング
    let sink = Arc::new(MemoryEventSink::new());
    let app = AppBuilder::new()
        .config(config)
        .event_sink(sink.clone())
        .build()?;
    let client = app.client(FlakyMailApi::new(7));

    // (C) 検索 → 一括読み込み → 一括ラベル付け
    let found = client.search("newer_than:1d has:attachment").await?;
    info!(%found, "search finished");

    let mut ids: Vec<String> = (1..=30).map(|i| format!("m{i}")).collect();
    ids.push("missing-1".into());
    let reads = client.read_many(ids).await;
    let (read_ok, read_failed) = reads
        .iter()
        .fold((0, 0), |(ok, err), r| if r.is_ok() { (ok + 1, err) } else { (ok, err + 1) });

    let changes = reads
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .filter_map(|v| v["id"].as_str())
        .map(|id| (id.to_owned(), json!({ "add_labels": ["processed"] })))
        .collect();
    let modified = client
        .modify_many(changes)
        .await
        .into_iter()
        .filter(Result::is_ok)
        .count();

    // (D) 結果と各キーの状態を出力
    let summary = Summary {
        read_ok,
        read_failed,
        modified,
        api_calls: client.api().calls.load(Ordering::Relaxed),
        retries: sink.count("retry_scheduled"),
        queued: sink.count("queued"),
        status: client.status(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    app.shutdown();
    Ok(())
}
