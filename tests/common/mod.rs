// Each integration test file is a separate binary; helpers not used in every
// binary would otherwise trigger dead_code warnings from clippy.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    routing,
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tower::ServiceExt;

use bearlink_preview::{
    handlers,
    preview::{FetchError, PageFetcher, PreviewService},
    queue::{Acknowledge, Broker, BrokerSession, Delivery, Publish, QueueError},
    state::AppState,
};

/// Markup used by most round-trip tests.
pub const EXAMPLE_HTML: &str = r#"
<html>
  <head>
    <meta property="og:title" content="Example Domain">
    <meta property="og:description" content="An example site">
    <meta property="og:image" content="https://example.com/img.jpg">
    <link rel="icon" href="/favicon.ico">
  </head>
</html>
"#;

// ── Fetcher double ───────────────────────────────────────────────────────────

enum Page {
    Html(String),
    Unreachable,
    /// Held until the gate is notified, then served.
    Gated(Arc<Notify>, String),
}

/// In-memory `PageFetcher`. URLs without a registered page fail as if the host
/// were unreachable.
#[derive(Clone, Default)]
pub struct StubFetcher {
    pages: Arc<Mutex<HashMap<String, Arc<Page>>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: &str, html: &str) -> Self {
        self.insert(url, Page::Html(html.to_owned()));
        self
    }

    pub fn with_unreachable(self, url: &str) -> Self {
        self.insert(url, Page::Unreachable);
        self
    }

    /// Register a page whose fetch blocks until the returned gate is notified.
    pub fn with_gated_page(self, url: &str, html: &str) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.insert(url, Page::Gated(gate.clone(), html.to_owned()));
        (self, gate)
    }

    fn insert(&self, url: &str, page: Page) {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_owned(), Arc::new(page));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn service(&self) -> PreviewService {
        PreviewService::new(Arc::new(self.clone()))
    }
}

#[async_trait]
impl PageFetcher for StubFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        self.calls.lock().unwrap().push(url.to_owned());
        let page = self.pages.lock().unwrap().get(url).cloned();
        match page.as_deref() {
            Some(Page::Html(html)) => Ok(html.clone()),
            Some(Page::Gated(gate, html)) => {
                gate.notified().await;
                Ok(html.clone())
            }
            Some(Page::Unreachable) | None => Err(FetchError::Timeout),
        }
    }
}

// ── HTTP helpers ─────────────────────────────────────────────────────────────

/// Build the full application router around a stubbed fetcher.
pub fn create_test_app(fetcher: &StubFetcher) -> Router {
    let state = AppState {
        previews: fetcher.service(),
    };
    Router::new()
        .route("/health", routing::get(handlers::health_check))
        .route("/ready", routing::get(handlers::ready_check))
        .route("/preview", routing::get(handlers::preview::get_preview))
        .with_state(state)
}

pub async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(app, req).await
}

async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

// ── Broker double ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Ack(u64),
    Reject(u64),
    Requeue(u64),
}

type Inbound = Result<(u64, Vec<u8>), QueueError>;

struct BrokerShared {
    connect_failures: Mutex<VecDeque<QueueError>>,
    connects: AtomicUsize,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    settlements: Mutex<Vec<Settlement>>,
    fail_publish: AtomicBool,
    hold_connects: AtomicBool,
    connect_gate: Notify,
    published_signal: Notify,
    settled_signal: Notify,
}

/// Scriptable in-memory broker: queue up connect failures, push deliveries or
/// transport errors into the consumer stream, and inspect what was published
/// and how each delivery was settled.
#[derive(Clone)]
pub struct ScriptedBroker {
    shared: Arc<BrokerShared>,
}

/// Test-side handle for driving a `ScriptedBroker`.
#[derive(Clone)]
pub struct BrokerHandle {
    shared: Arc<BrokerShared>,
    tx: mpsc::UnboundedSender<Inbound>,
    next_tag: Arc<AtomicUsize>,
}

pub fn scripted_broker() -> (ScriptedBroker, BrokerHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(BrokerShared {
        connect_failures: Mutex::new(VecDeque::new()),
        connects: AtomicUsize::new(0),
        inbound: tokio::sync::Mutex::new(rx),
        published: Mutex::new(Vec::new()),
        settlements: Mutex::new(Vec::new()),
        fail_publish: AtomicBool::new(false),
        hold_connects: AtomicBool::new(false),
        connect_gate: Notify::new(),
        published_signal: Notify::new(),
        settled_signal: Notify::new(),
    });
    (
        ScriptedBroker {
            shared: shared.clone(),
        },
        BrokerHandle {
            shared,
            tx,
            next_tag: Arc::new(AtomicUsize::new(1)),
        },
    )
}

impl BrokerHandle {
    /// The next `n` connect attempts fail with a transport error.
    pub fn fail_next_connects(&self, n: usize) {
        let mut failures = self.shared.connect_failures.lock().unwrap();
        for i in 0..n {
            failures.push_back(QueueError::Transport(format!("connection refused ({i})")));
        }
    }

    /// Make connect attempts hang until `release_connect` is called.
    pub fn hold_connects(&self, hold: bool) {
        self.shared.hold_connects.store(hold, Ordering::SeqCst);
    }

    pub fn release_connect(&self) {
        self.shared.connect_gate.notify_one();
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.shared.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Deliver a raw payload; returns its delivery tag.
    pub fn deliver(&self, payload: impl Into<Vec<u8>>) -> u64 {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) as u64;
        self.tx.send(Ok((tag, payload.into()))).unwrap();
        tag
    }

    pub fn deliver_json(&self, value: &Value) -> u64 {
        self.deliver(serde_json::to_vec(value).unwrap())
    }

    /// Break the current session as if the channel had been closed.
    pub fn drop_connection(&self) {
        self.tx
            .send(Err(QueueError::Transport("channel closed".into())))
            .unwrap();
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<(String, Value)> {
        self.shared
            .published
            .lock()
            .unwrap()
            .iter()
            .map(|(queue, body)| (queue.clone(), serde_json::from_slice(body).unwrap()))
            .collect()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.shared.settlements.lock().unwrap().clone()
    }

    /// Wait until at least `n` results have been published.
    pub async fn wait_for_published(&self, n: usize) -> Vec<(String, Value)> {
        let shared = self.shared.clone();
        wait(async move {
            loop {
                let notified = shared.published_signal.notified();
                if shared.published.lock().unwrap().len() >= n {
                    return;
                }
                notified.await;
            }
        })
        .await;
        self.published()
    }

    /// Wait until at least `n` deliveries have been settled.
    pub async fn wait_for_settlements(&self, n: usize) -> Vec<Settlement> {
        let shared = self.shared.clone();
        wait(async move {
            loop {
                let notified = shared.settled_signal.notified();
                if shared.settlements.lock().unwrap().len() >= n {
                    return;
                }
                notified.await;
            }
        })
        .await;
        self.settlements()
    }
}

pub async fn wait<F: std::future::Future<Output = ()>>(fut: F) {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out waiting for condition");
}

#[async_trait]
impl Broker for ScriptedBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, QueueError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        if self.shared.hold_connects.load(Ordering::SeqCst) {
            self.shared.connect_gate.notified().await;
        }
        let failure = self.shared.connect_failures.lock().unwrap().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(Box::new(ScriptedSession {
            shared: self.shared.clone(),
        }))
    }
}

struct ScriptedSession {
    shared: Arc<BrokerShared>,
}

#[async_trait]
impl BrokerSession for ScriptedSession {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, QueueError>> {
        let next = self.shared.inbound.lock().await.recv().await?;
        Some(next.map(|(tag, payload)| Delivery {
            payload,
            acker: Box::new(ScriptedAcker {
                tag,
                shared: self.shared.clone(),
            }),
        }))
    }

    fn publisher(&self) -> Arc<dyn Publish> {
        Arc::new(ScriptedPublisher {
            shared: self.shared.clone(),
        })
    }
}

struct ScriptedPublisher {
    shared: Arc<BrokerShared>,
}

#[async_trait]
impl Publish for ScriptedPublisher {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        if self.shared.fail_publish.load(Ordering::SeqCst) {
            return Err(QueueError::Transport("publish refused".into()));
        }
        self.shared
            .published
            .lock()
            .unwrap()
            .push((queue.to_owned(), payload.to_vec()));
        self.shared.published_signal.notify_waiters();
        Ok(())
    }
}

struct ScriptedAcker {
    tag: u64,
    shared: Arc<BrokerShared>,
}

impl ScriptedAcker {
    fn settle(&self, settlement: Settlement) {
        self.shared.settlements.lock().unwrap().push(settlement);
        self.shared.settled_signal.notify_waiters();
    }
}

#[async_trait]
impl Acknowledge for ScriptedAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        self.settle(Settlement::Ack(self.tag));
        Ok(())
    }

    async fn reject(&self) -> Result<(), QueueError> {
        self.settle(Settlement::Reject(self.tag));
        Ok(())
    }

    async fn requeue(&self) -> Result<(), QueueError> {
        self.settle(Settlement::Requeue(self.tag));
        Ok(())
    }
}
