//! End-to-end tests for the notification pipeline
//!
//! Transports are exercised against a mock collector served by axum on an
//! ephemeral port; pipeline properties use in-process stub reporters.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{Response, StatusCode};
use axum::routing::post;
use blunder::filter::FilterFn;
use blunder::report::{
    FetchReporter, NativeReporter, RateLimiter, ReporterOptions, XhrReporter, RETRY_DELAY_HEADER,
};
use blunder::{
    Arg, Callable, CapturedError, Client, Deferred, ErrorRecord, Notice, NotifyError, Options,
    Reporter, ReporterFn, ReporterSpec,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

// ============================================================================
// Mock collector
// ============================================================================

/// What the mock collector answers: status, retry delay header, body
type Reply = (u16, Option<&'static str>, String);

struct Collector {
    hits: AtomicUsize,
    bodies: Mutex<Vec<Value>>,
    keys: Mutex<Vec<String>>,
    projects: Mutex<Vec<String>>,
    respond: Box<dyn Fn(usize) -> Reply + Send + Sync>,
}

impl Collector {
    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn problems(
    State(collector): State<Arc<Collector>>,
    Path(project): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> Response<Body> {
    let n = collector.hits.fetch_add(1, Ordering::SeqCst);
    collector.projects.lock().push(project);
    collector
        .keys
        .lock()
        .push(query.get("key").cloned().unwrap_or_default());
    if let Ok(value) = serde_json::from_str(&body) {
        collector.bodies.lock().push(value);
    }

    let (status, delay, body) = (collector.respond)(n);
    let mut response = Response::builder().status(StatusCode::from_u16(status).unwrap());
    if let Some(delay) = delay {
        response = response.header(RETRY_DELAY_HEADER, delay);
    }
    response.body(Body::from(body)).unwrap()
}

/// Serve a collector on 127.0.0.1 and return its base URL
async fn spawn_collector<F>(respond: F) -> (String, Arc<Collector>)
where
    F: Fn(usize) -> Reply + Send + Sync + 'static,
{
    let collector = Arc::new(Collector {
        hits: AtomicUsize::new(0),
        bodies: Mutex::new(Vec::new()),
        keys: Mutex::new(Vec::new()),
        projects: Mutex::new(Vec::new()),
        respond: Box::new(respond),
    });

    let app = Router::new()
        .route("/api/v1/projects/{project}/problems", post(problems))
        .with_state(Arc::clone(&collector));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), collector)
}

fn ok_id(id: &'static str) -> impl Fn(usize) -> Reply + Send + Sync + 'static {
    move |_| (201, None, json!({ "id": id }).to_string())
}

fn options(host: &str) -> ReporterOptions {
    ReporterOptions {
        project_id: "17".into(),
        project_key: "secret".into(),
        host: host.to_string(),
        timeout: Duration::from_secs(5),
    }
}

fn notice(message: &str) -> Notice {
    let mut notice = Notice::new();
    notice.errors.push(ErrorRecord::new("Error", message));
    notice
}

/// Each built-in reporter on a private rate-limit window
fn reporters() -> Vec<(Arc<dyn Reporter>, Arc<RateLimiter>)> {
    let fetch_limiter = Arc::new(RateLimiter::new());
    let xhr_limiter = Arc::new(RateLimiter::new());
    let native_limiter = Arc::new(RateLimiter::new());

    let fetch: Arc<dyn Reporter> = Arc::new(
        FetchReporter::new()
            .unwrap()
            .with_rate_limiter(Arc::clone(&fetch_limiter)),
    );
    let xhr: Arc<dyn Reporter> =
        Arc::new(XhrReporter::new().with_rate_limiter(Arc::clone(&xhr_limiter)));
    let native: Arc<dyn Reporter> =
        Arc::new(NativeReporter::new().with_rate_limiter(Arc::clone(&native_limiter)));

    vec![
        (fetch, fetch_limiter),
        (xhr, xhr_limiter),
        (native, native_limiter),
    ]
}

// ============================================================================
// Transport protocol
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reporters_resolve_with_collector_id() {
    for (reporter, _) in reporters() {
        let (host, collector) = spawn_collector(ok_id("abc123")).await;

        let delivered = reporter
            .report(notice("disk full"), &options(&host))
            .await
            .unwrap_or_else(|e| panic!("{}: {e}", reporter.name()));

        assert_eq!(delivered.id, "abc123", "{}", reporter.name());
        assert_eq!(collector.hits(), 1);
        assert_eq!(collector.projects.lock()[0], "17");
        assert_eq!(collector.keys.lock()[0], "secret");
        assert_eq!(collector.bodies.lock()[0]["errors"][0]["message"], "disk full");
        assert_eq!(collector.bodies.lock()[0]["errors"][0]["type"], "Error");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reporters_reject_with_collector_error() {
    for (reporter, _) in reporters() {
        let (host, _) = spawn_collector(|_| {
            (400, None, json!({ "error": "project is disabled" }).to_string())
        })
        .await;

        let err = reporter
            .report(notice("boom"), &options(&host))
            .await
            .unwrap_err();
        assert_eq!(err, NotifyError::Rejected("project is disabled".into()));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reporters_unauthorized() {
    for (reporter, _) in reporters() {
        let (host, _) = spawn_collector(|_| (401, None, String::new())).await;

        let err = reporter
            .report(notice("boom"), &options(&host))
            .await
            .unwrap_err();
        assert_eq!(err, NotifyError::Unauthorized, "{}", reporter.name());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reporters_unexpected_status() {
    for (reporter, _) in reporters() {
        let (host, _) = spawn_collector(|_| (500, None, "  upstream down\n".into())).await;

        let err = reporter
            .report(notice("boom"), &options(&host))
            .await
            .unwrap_err();
        match err {
            NotifyError::UnexpectedResponse {
                reporter: name,
                status,
                body,
            } => {
                assert_eq!(name, reporter.name());
                assert_eq!(status, 500);
                assert_eq!(body, "upstream down");
            }
            other => panic!("{}: unexpected {other:?}", reporter.name()),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reporters_rate_limit_window() {
    for (reporter, limiter) in reporters() {
        let (host, collector) = spawn_collector(|n| match n {
            0 => (429, Some("1"), String::new()),
            _ => (201, None, json!({ "id": "after-window" }).to_string()),
        })
        .await;
        let opts = options(&host);

        let err = reporter.report(notice("boom"), &opts).await.unwrap_err();
        assert_eq!(err, NotifyError::RateLimited);
        assert_eq!(collector.hits(), 1);

        let remaining = limiter.remaining().expect("window open");
        assert!(remaining > Duration::ZERO && remaining <= Duration::from_secs(1));

        // Within the window: rejected without touching the network
        let err = reporter.report(notice("boom"), &opts).await.unwrap_err();
        assert_eq!(err, NotifyError::RateLimited);
        assert_eq!(collector.hits(), 1, "{}", reporter.name());

        // Window elapsed: delivery proceeds
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!limiter.is_limited());
        let delivered = reporter.report(notice("boom"), &opts).await.unwrap();
        assert_eq!(delivered.id, "after-window");
        assert_eq!(collector.hits(), 2, "{}", reporter.name());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rate_limit_window_follows_delay_header() {
    let (host, _collector) = spawn_collector(|_| (429, Some("5"), String::new())).await;
    let limiter = Arc::new(RateLimiter::new());
    let reporter = FetchReporter::new()
        .unwrap()
        .with_rate_limiter(Arc::clone(&limiter));

    let err = reporter
        .report(notice("boom"), &options(&host))
        .await
        .unwrap_err();
    assert_eq!(err, NotifyError::RateLimited);

    let remaining = limiter.remaining().expect("window open");
    assert!(remaining > Duration::from_secs(4) && remaining <= Duration::from_secs(5));
    assert!(limiter.is_limited_at(Instant::now() + Duration::from_secs(4)));
    assert!(!limiter.is_limited_at(Instant::now() + Duration::from_secs(6)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rate_limit_without_delay_keeps_window_closed() {
    let (host, collector) = spawn_collector(|n| match n {
        0 => (429, None, String::new()),
        _ => (201, None, json!({ "id": "ok" }).to_string()),
    })
    .await;
    let limiter = Arc::new(RateLimiter::new());
    let reporter = FetchReporter::new()
        .unwrap()
        .with_rate_limiter(Arc::clone(&limiter));

    let err = reporter
        .report(notice("boom"), &options(&host))
        .await
        .unwrap_err();
    assert_eq!(err, NotifyError::RateLimited);
    assert!(!limiter.is_limited());

    reporter.report(notice("boom"), &options(&host)).await.unwrap();
    assert_eq!(collector.hits(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shared_limiter_couples_reporters() {
    let (host, collector) = spawn_collector(|_| (429, Some("30"), String::new())).await;
    let limiter = Arc::new(RateLimiter::new());
    let first = FetchReporter::new()
        .unwrap()
        .with_rate_limiter(Arc::clone(&limiter));
    let second = FetchReporter::new()
        .unwrap()
        .with_rate_limiter(Arc::clone(&limiter));

    assert_eq!(
        first.report(notice("boom"), &options(&host)).await,
        Err(NotifyError::RateLimited)
    );
    assert_eq!(
        second.report(notice("boom"), &options(&host)).await,
        Err(NotifyError::RateLimited)
    );
    assert_eq!(collector.hits(), 1);
}

#[tokio::test]
async fn test_native_refuses_https() {
    let reporter = NativeReporter::new().with_rate_limiter(Arc::new(RateLimiter::new()));
    let err = reporter
        .report(notice("boom"), &options("https://collector.test"))
        .await
        .unwrap_err();
    assert!(matches!(err, NotifyError::Transport(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_refused_is_transport_failure() {
    // Bind then drop to get a port nothing listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    for (reporter, _) in reporters() {
        let err = reporter
            .report(notice("boom"), &options(&host))
            .await
            .unwrap_err();
        assert!(
            matches!(err, NotifyError::Transport(_)),
            "{}: {err:?}",
            reporter.name()
        );
    }
}

// ============================================================================
// Client pipeline
// ============================================================================

fn counting_reporter(calls: Arc<Mutex<Vec<String>>>) -> ReporterSpec {
    ReporterSpec::custom(ReporterFn::new(move |mut notice: Notice, _opts| {
        let calls = Arc::clone(&calls);
        async move {
            let message = notice
                .errors
                .first()
                .map(|e| e.message.clone())
                .unwrap_or_default();
            calls.lock().push(message);
            notice.id = "X".into();
            Ok(notice)
        }
    }))
}

fn stub_client() -> (Client, Arc<Mutex<Vec<String>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let options = Options::new("17", "secret")
        .host("http://collector.test")
        .reporter(counting_reporter(Arc::clone(&calls)));
    (Client::new(options).unwrap(), calls)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_end_to_end_over_fetch() {
    let (host, collector) = spawn_collector(ok_id("remote-1")).await;
    let reporter = FetchReporter::new()
        .unwrap()
        .with_rate_limiter(Arc::new(RateLimiter::new()));
    let options = Options::new("17", "secret")
        .host(host)
        .component("checkout")
        .reporter(ReporterSpec::custom(reporter));
    let client = Client::new(options).unwrap();

    let err = "x1".parse::<u32>().unwrap_err();
    let notice = client.notify(CapturedError::from(err)).await.unwrap();
    assert_eq!(notice.id, "remote-1");

    let body = collector.bodies.lock()[0].clone();
    assert_eq!(body["errors"][0]["type"], "ParseIntError");
    assert_eq!(body["context"]["component"], "checkout");
    assert_eq!(body["context"]["language"], "Rust");
    assert!(body["context"]["os"].is_string());
    assert!(body["params"]["process"]["pid"].is_number());
}

#[tokio::test]
async fn test_notify_resolves_with_stub_id() {
    let (client, calls) = stub_client();
    let notice = client.notify(CapturedError::msg("boom")).await.unwrap();
    assert_eq!(notice.id, "X");
    assert_eq!(calls.lock().len(), 1);
}

#[tokio::test]
async fn test_notify_null_rejects_before_transport() {
    let (client, calls) = stub_client();

    let deferred = client.notify(None);
    assert!(deferred.is_settled());
    assert!(matches!(deferred.await, Err(NotifyError::Validation(_))));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(calls.lock().is_empty());
}

#[tokio::test]
async fn test_filter_veto_halts_chain() {
    let (client, calls) = stub_client();
    let later = Arc::new(AtomicUsize::new(0));

    client.add_filter(FilterFn::new(|_| None));
    let l = Arc::clone(&later);
    client.add_filter(FilterFn::new(move |notice| {
        l.fetch_add(1, Ordering::SeqCst);
        Some(notice)
    }));

    assert_eq!(
        client.notify(CapturedError::msg("boom")).await,
        Err(NotifyError::Filtered)
    );
    assert!(calls.lock().is_empty());
    assert_eq!(later.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_debounce_window() {
    let (client, calls) = stub_client();
    let error = || CapturedError::msg("tick").with_location("src/tick.rs", 3, 9);

    assert!(client.notify(error()).await.is_ok());
    assert_eq!(client.notify(error()).await, Err(NotifyError::Filtered));
    assert_eq!(calls.lock().len(), 1);

    tokio::time::advance(Duration::from_millis(1_500)).await;
    assert!(client.notify(error()).await.is_ok());
    assert_eq!(calls.lock().len(), 2);
}

#[tokio::test]
async fn test_offline_replay_preserves_order() {
    let (client, calls) = stub_client();
    client.set_offline();

    let pending: Vec<_> = ["first", "second", "third"]
        .into_iter()
        .map(|m| client.notify(CapturedError::msg(m)))
        .collect();
    assert_eq!(client.offline_len(), 3);
    assert!(pending.iter().all(|d| !d.is_settled()));
    assert!(calls.lock().is_empty());

    client.set_online();
    for deferred in pending {
        assert_eq!(deferred.await.unwrap().id, "X");
    }
    assert_eq!(*calls.lock(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_offline_buffer_capacity() {
    let (client, calls) = stub_client();
    client.set_offline();

    let pending: Vec<_> = (0..105)
        .map(|i| {
            client.notify(CapturedError::msg(format!("error {i}")).with_location("src/job.rs", 8, 1))
        })
        .collect();
    assert_eq!(client.offline_len(), 100);

    for deferred in &pending[..5] {
        assert_eq!(
            deferred.outcome(),
            Some(Err(NotifyError::Evicted { capacity: 100 }))
        );
    }

    client.set_online();
    for deferred in pending.into_iter().skip(5) {
        deferred.await.unwrap();
    }
    let calls = calls.lock();
    assert_eq!(calls.len(), 100);
    assert_eq!(calls[0], "error 5");
}

#[inline(never)]
fn notify_from_call_site(client: &Client) -> Deferred {
    client.notify(CapturedError::msg("no stack given"))
}

#[tokio::test]
async fn test_fallback_stack_starts_at_caller() {
    let functions = Arc::new(Mutex::new(Vec::new()));
    let f = Arc::clone(&functions);
    let options = Options::new("17", "secret").reporter(ReporterSpec::custom(ReporterFn::new(
        move |notice: Notice, _opts| {
            let f = Arc::clone(&f);
            async move {
                f.lock()
                    .extend(notice.errors[0].backtrace.iter().map(|fr| fr.function.clone()));
                Ok(Notice { id: "X".into(), ..notice })
            }
        },
    )));
    let client = Client::new(options).unwrap();

    notify_from_call_site(&client).await.unwrap();

    let functions = functions.lock();
    let top = functions.first().expect("fallback frames");
    assert!(
        !top.starts_with("blunder::") && !top.starts_with("backtrace::"),
        "{functions:?}"
    );
    assert!(
        functions.iter().any(|f| f.contains("notify_from_call_site")),
        "{functions:?}"
    );
}

#[tokio::test]
async fn test_wrap_twice_returns_same_callable() {
    let (client, _) = stub_client();
    let wrapped = client.wrap_fn(|_| Value::Null);
    let again = client.wrap(Arc::clone(&wrapped));
    assert!(Arc::ptr_eq(&wrapped, &again));
}

#[tokio::test]
async fn test_wrapped_panic_reported_once_and_rethrown() {
    let (client, calls) = stub_client();

    let outer = client.wrap_fn(|args: Vec<Arg>| {
        let callback = args[1].as_func().expect("callback").clone();
        callback.call(vec![Arg::from("inner")])
    });
    let callback = Arg::func(|_| -> Value { panic!("callback exploded") });

    let result = catch_unwind(AssertUnwindSafe(|| {
        outer.call(vec![Arg::from(7), callback])
    }));

    let payload = result.expect_err("panic must reach the caller");
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"callback exploded"));

    for _ in 0..100 {
        if !calls.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(*calls.lock(), vec!["callback exploded"]);
}

#[tokio::test]
async fn test_wrapped_panic_suppresses_next_uncaught() {
    let (client, calls) = stub_client();
    let wrapped = client.wrap_fn(|_| -> Value { panic!("once") });

    let _ = catch_unwind(AssertUnwindSafe(|| wrapped.call(Vec::new())));

    // No panic hook: the rethrown panic reaching a host-level handler is not reported again
    assert_eq!(
        client
            .historian()
            .on_uncaught(CapturedError::from_panic(&"once", None)),
        0
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.lock().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panic_hook_reports_unwrapped_panic_after_wrapped_one() {
    let (client, calls) = stub_client();
    client.onerror();

    let wrapped = client.wrap_fn(|_| -> Value { panic!("wrapped fault") });
    assert!(catch_unwind(AssertUnwindSafe(|| wrapped.call(Vec::new()))).is_err());
    assert!(std::thread::spawn(|| panic!("unrelated fault")).join().is_err());

    for _ in 0..500 {
        if calls.lock().iter().any(|m| m == "unrelated fault") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let calls = calls.lock();
    assert!(calls.iter().any(|m| m == "unrelated fault"), "{calls:?}");
    assert_eq!(calls.iter().filter(|m| *m == "wrapped fault").count(), 1);
}

#[tokio::test]
async fn test_wrapped_arguments_in_params() {
    let seen = Arc::new(Mutex::new(None));
    let s = Arc::clone(&seen);
    let options = Options::new("17", "secret").reporter(ReporterSpec::custom(ReporterFn::new(
        move |notice: Notice, _opts| {
            let s = Arc::clone(&s);
            async move {
                *s.lock() = Some(notice.params.clone());
                Ok(notice)
            }
        },
    )));
    let client = Client::new(options).unwrap();

    let _ = catch_unwind(AssertUnwindSafe(|| {
        client.call(
            Arc::new(|_: Vec<Arg>| -> Value { panic!("bad input") }),
            vec![Arg::from("a"), Arg::func(|_| Value::Null)],
        )
    }));

    for _ in 0..100 {
        if seen.lock().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let params = seen.lock().clone().unwrap();
    assert_eq!(params["arguments"], json!(["a", "[function]"]));
}

#[tokio::test]
async fn test_two_clients_share_historian() {
    let historian = blunder::Historian::new();
    let first_calls = Arc::new(Mutex::new(Vec::new()));
    let second_calls = Arc::new(Mutex::new(Vec::new()));

    let first = Client::with_historian(
        Options::new("1", "a").reporter(counting_reporter(Arc::clone(&first_calls))),
        Arc::clone(&historian),
    )
    .unwrap();
    let second = Client::with_historian(
        Options::new("2", "b").reporter(counting_reporter(Arc::clone(&second_calls))),
        Arc::clone(&historian),
    )
    .unwrap();

    assert_eq!(historian.on_uncaught(CapturedError::msg("shared fault")), 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(first_calls.lock().len(), 1);
    assert_eq!(second_calls.lock().len(), 1);
    drop((first, second));
}
