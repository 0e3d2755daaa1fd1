use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use super::*;
use crate::domain::ApiError;
use crate::impls::MemoryEventSink;

const KEY: &str = "test.key";

fn quota(max_requests: u32, window_ms: u64, burst: Option<u32>) -> RateLimitConfig {
    let config = RateLimitConfig::new(max_requests, window_ms).unwrap();
    match burst {
        Some(b) => config.with_burst(b).unwrap(),
        None => config,
    }
}

fn limiter(config: RateLimitConfig) -> (RateLimiter, Arc<MemoryEventSink>) {
    let mut table = QuotaTable::builtin();
    table.insert(KEY, config);
    let sink = Arc::new(MemoryEventSink::new());
    let limiter = RateLimiter::new(table, Arc::new(SystemClock), sink.clone());
    (limiter, sink)
}

fn assert_near(actual: Duration, expected_ms: u64) {
    let expected = Duration::from_millis(expected_ms);
    assert!(
        actual >= expected && actual < expected + Duration::from_millis(5),
        "expected ~{expected:?}, got {actual:?}"
    );
}

type Log = Arc<Mutex<Vec<(&'static str, Duration)>>>;

/// Runs one call on `KEY` that records its name and start offset.
async fn record(
    limiter: &RateLimiter,
    log: &Log,
    start: Instant,
    name: &'static str,
) -> Result<(), LimiterError> {
    limiter
        .execute(KEY, move || async move {
            log.lock().unwrap().push((name, start.elapsed()));
            Ok(())
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn admits_up_to_max_requests_immediately() {
    let (limiter, sink) = limiter(quota(3, 1_000, None));

    for expected_remaining in [2, 1, 0] {
        let value: Result<u32, LimiterError> = limiter.execute(KEY, || async { Ok(7) }).await;
        assert_eq!(value, Ok(7));
        assert_eq!(limiter.remaining_requests(KEY), expected_remaining);
    }

    assert_eq!(limiter.requests_in_window(KEY), 3);
    assert!(limiter.is_rate_limited(KEY));
    assert_eq!(sink.count("admitted"), 3);
    assert_eq!(sink.count("queued"), 0);
}

#[tokio::test(start_paused = true)]
async fn window_rollover_restores_budget() {
    let (limiter, _) = limiter(quota(2, 1_000, None));
    for _ in 0..2 {
        limiter
            .execute(KEY, || async { Ok::<_, LimiterError>(()) })
            .await
            .unwrap();
    }
    assert!(limiter.is_rate_limited(KEY));

    tokio::time::advance(Duration::from_millis(1_000)).await;
    assert!(!limiter.is_rate_limited(KEY));
    assert_eq!(limiter.remaining_requests(KEY), 2);
    assert_eq!(limiter.requests_in_window(KEY), 0);
}

#[tokio::test(start_paused = true)]
async fn queued_calls_resume_in_submission_order() {
    let (limiter, sink) = limiter(quota(2, 1_000, None));
    let log: Log = Arc::default();
    let start = Instant::now();

    let (p1, p2, a, b, c) = futures::join!(
        record(&limiter, &log, start, "p1"),
        record(&limiter, &log, start, "p2"),
        record(&limiter, &log, start, "a"),
        record(&limiter, &log, start, "b"),
        record(&limiter, &log, start, "c"),
    );
    for result in [p1, p2, a, b, c] {
        result.unwrap();
    }

    let log = log.lock().unwrap().clone();
    let names: Vec<_> = log.iter().map(|(name, _)| *name).collect();
    assert_eq!(names, vec!["p1", "p2", "a", "b", "c"]);

    // a waits for rollover, b follows one drain interval later (1000 / 2),
    // c lands on the next rollover.
    assert_near(log[0].1, 0);
    assert_near(log[1].1, 0);
    assert_near(log[2].1, 1_000);
    assert_near(log[3].1, 1_500);
    assert_near(log[4].1, 2_000);

    assert_eq!(sink.count("queued"), 3);
    assert_eq!(sink.count("released"), 3);
    assert!(!limiter.status(KEY).draining);
}

#[tokio::test(start_paused = true)]
async fn burst_is_the_hard_ceiling_per_window() {
    let (limiter, sink) = limiter(quota(2, 1_000, Some(3)));
    let log: Log = Arc::default();
    let start = Instant::now();

    let results = futures::future::join_all(
        ["c1", "c2", "c3", "c4", "c5", "c6"]
            .into_iter()
            .map(|name| record(&limiter, &log, start, name)),
    )
    .await;
    assert!(results.iter().all(Result::is_ok));

    let log = log.lock().unwrap().clone();
    let immediate = log
        .iter()
        .filter(|(_, at)| *at < Duration::from_millis(1))
        .count();
    assert_eq!(immediate, 3);
    assert_eq!(log.len(), 6);

    assert_eq!(sink.count("admitted"), 2);
    assert_eq!(sink.count("burst_admitted"), 1);
    assert_eq!(sink.count("queued"), 3);
}

#[tokio::test(start_paused = true)]
async fn retry_after_hint_sets_first_drain() {
    let (limiter, sink) = limiter(quota(1, 1_000, None).with_retry_after(300));
    let log: Log = Arc::default();
    let start = Instant::now();

    let (first, second) = futures::join!(
        record(&limiter, &log, start, "first"),
        record(&limiter, &log, start, "second"),
    );
    first.unwrap();
    second.unwrap();

    let queued = sink
        .events()
        .into_iter()
        .find_map(|ev| match ev {
            PacerEvent::Queued { wait_ms, .. } => Some(wait_ms),
            _ => None,
        });
    assert_eq!(queued, Some(300));

    // The drain at 300ms finds no room and waits for the rollover.
    let log = log.lock().unwrap().clone();
    assert_near(log[1].1, 1_000);
}

#[tokio::test(start_paused = true)]
async fn saturated_key_does_not_delay_other_keys() {
    let (limiter, _) = limiter(quota(1, 1_000, None));
    let log: Log = Arc::default();
    let start = Instant::now();

    let other = async {
        let elapsed: Result<Duration, LimiterError> = limiter
            .execute("other.key", move || async move { Ok(start.elapsed()) })
            .await;
        elapsed.unwrap()
    };

    let (x1, x2, x3, y) = futures::join!(
        record(&limiter, &log, start, "x1"),
        record(&limiter, &log, start, "x2"),
        record(&limiter, &log, start, "x3"),
        other,
    );
    x1.unwrap();
    x2.unwrap();
    x3.unwrap();
    assert_near(y, 0);
    assert_near(log.lock().unwrap()[2].1, 2_000);
}

#[tokio::test(start_paused = true)]
async fn failed_calls_still_consume_quota() {
    let (limiter, _) = limiter(quota(5, 1_000, None));
    let err = limiter
        .execute(KEY, || async { Err::<(), _>(ApiError::from_status(400, "bad")) })
        .await
        .unwrap_err();
    assert_eq!(err, ApiError::from_status(400, "bad"));
    assert_eq!(limiter.requests_in_window(KEY), 1);
    assert_eq!(limiter.remaining_requests(KEY), 4);
}

#[tokio::test(start_paused = true)]
async fn reset_rejects_queued_calls() {
    let (limiter, sink) = limiter(quota(1, 1_000, None));
    let log: Log = Arc::default();
    let start = Instant::now();

    let (first, second, rejected) = futures::join!(
        record(&limiter, &log, start, "first"),
        record(&limiter, &log, start, "second"),
        async { limiter.reset(Some(KEY)) },
    );
    first.unwrap();
    assert_eq!(
        second,
        Err(LimiterError::Reset {
            key: KEY.to_owned()
        })
    );
    assert_eq!(rejected, 1);
    assert_eq!(log.lock().unwrap().len(), 1);
    assert_eq!(sink.count("reset"), 1);
}

#[tokio::test(start_paused = true)]
async fn reset_restores_configured_budget() {
    let (limiter, _) = limiter(quota(4, 1_000, None));
    for _ in 0..3 {
        limiter
            .execute(KEY, || async { Ok::<_, LimiterError>(()) })
            .await
            .unwrap();
    }
    assert_eq!(limiter.remaining_requests(KEY), 1);

    limiter.reset(Some(KEY));
    assert_eq!(limiter.remaining_requests(KEY), 4);

    limiter
        .execute("another", || async { Ok::<_, LimiterError>(()) })
        .await
        .unwrap();
    limiter.reset(None);
    assert_eq!(limiter.requests_in_window("another"), 0);
}

#[tokio::test(start_paused = true)]
async fn dropping_a_queued_call_removes_it() {
    let (limiter, sink) = limiter(quota(1, 1_000, None));
    limiter
        .execute(KEY, || async { Ok::<_, LimiterError>(()) })
        .await
        .unwrap();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        limiter.execute(KEY, || async { Ok::<_, LimiterError>(()) }),
    )
    .await;
    assert!(abandoned.is_err());

    let status = limiter.status(KEY);
    assert_eq!(status.queued, 0);
    assert!(!status.draining);
    assert_eq!(sink.count("cancelled"), 1);

    // The abandoned call never ran, so the next window is untouched.
    tokio::time::advance(Duration::from_millis(900)).await;
    assert_eq!(limiter.requests_in_window(KEY), 0);
    assert_eq!(sink.count("released"), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_rejects_queued_and_new_calls() {
    let (limiter, _) = limiter(quota(1, 1_000, None));
    let log: Log = Arc::default();
    let start = Instant::now();

    let (first, second, _) = futures::join!(
        record(&limiter, &log, start, "first"),
        record(&limiter, &log, start, "second"),
        async { limiter.shutdown() },
    );
    first.unwrap();
    assert!(matches!(second, Err(LimiterError::Shutdown { .. })));

    let late = record(&limiter, &log, start, "late").await;
    assert!(matches!(late, Err(LimiterError::Shutdown { .. })));
}

#[tokio::test(start_paused = true)]
async fn status_reports_queue_and_drain() {
    let (limiter, _) = limiter(quota(1, 1_000, None));
    let log: Log = Arc::default();
    let start = Instant::now();

    let observe = async {
        tokio::task::yield_now().await;
        limiter.status(KEY)
    };
    let (_, _, _, status) = futures::join!(
        record(&limiter, &log, start, "a"),
        record(&limiter, &log, start, "b"),
        record(&limiter, &log, start, "c"),
        observe,
    );

    assert_eq!(status.key, KEY);
    assert_eq!(status.requests_in_window, 1);
    assert_eq!(status.max_requests, 1);
    assert_eq!(status.remaining_requests, 0);
    assert!(status.is_rate_limited);
    assert_eq!(status.queued, 2);
    assert!(status.draining);
}

#[tokio::test(start_paused = true)]
async fn fresh_window_admits_new_calls_while_one_is_still_queued() {
    let (limiter, sink) = limiter(quota(10, 1_000, Some(15)).with_retry_after(2_000));
    let log: Log = Arc::default();
    let start = Instant::now();

    let early = futures::future::join_all((0..16).map(|_| record(&limiter, &log, start, "early")));
    let late = async {
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(limiter.remaining_requests(KEY), 10);
        assert!(!limiter.is_rate_limited(KEY));
        assert_eq!(limiter.queued(KEY), 1);
        record(&limiter, &log, start, "late").await
    };
    let (early, late) = futures::join!(early, late);
    assert!(early.iter().all(Result::is_ok));
    late.unwrap();

    let log = log.lock().unwrap().clone();
    let late_at = log.iter().find(|(name, _)| *name == "late").map(|(_, at)| *at);
    assert_near(late_at.unwrap(), 1_100);
    // The queued call still waits for its retry-after hint.
    assert_near(log.last().unwrap().1, 2_000);
    assert_eq!(sink.count("queued"), 1);
}

#[tokio::test(start_paused = true)]
async fn released_but_dropped_call_gives_its_unit_back() {
    let (limiter, sink) = limiter(quota(1, 1_000, None));
    limiter
        .execute(KEY, || async { Ok::<_, LimiterError>(()) })
        .await
        .unwrap();

    let mut pending = Box::pin(limiter.acquire(KEY, quota(1, 1_000, None)));
    assert!(futures::poll!(pending.as_mut()).is_pending());
    assert_eq!(limiter.queued(KEY), 1);

    // Let the drain charge the new window and hand over the grant, then drop
    // the call without polling it again.
    tokio::time::advance(Duration::from_millis(1_000)).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    assert_eq!(sink.count("released"), 1);
    drop(pending);

    assert_eq!(limiter.requests_in_window(KEY), 0);
    assert_eq!(limiter.remaining_requests(KEY), 1);
    assert_eq!(sink.count("cancelled"), 1);
}

#[tokio::test(start_paused = true)]
async fn wrapped_function_shares_the_key_budget() {
    let (limiter, sink) = limiter(quota(2, 1_000, None));
    let double = limiter.wrap(KEY, |n: u32| async move { Ok::<_, LimiterError>(n * 2) });
    assert_eq!(double.key(), KEY);

    let start = Instant::now();
    let (a, b, c) = futures::join!(double.call(1), double.call(2), double.call(3));
    assert_eq!((a, b, c), (Ok(2), Ok(4), Ok(6)));
    assert_near(start.elapsed(), 1_000);
    assert_eq!(sink.count("admitted"), 2);
    assert_eq!(sink.count("queued"), 1);
}
