// Concurrent multi-origin fetch orchestrator
//
// `fetch_all` spawns one task per origin and returns at once. Outcomes are
// pushed onto a shared unbounded channel in completion order. Every unit owns a
// `CompletionGuard` holding a sender clone; the channel closes exactly once,
// when the last guard drops, so the consumer sees exactly N outcomes and then
// `None`.

use crate::client::FlightSearcher;
use crate::config::FanOutConfig;
use crate::error::ApiError;
use crate::models::{FetchOutcome, FetchRequest};
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutState {
    // every unit still outstanding
    Running,
    // some units have reported, or outcomes are still buffered unread
    Draining,
    // every unit reported and every outcome was received; terminal
    Closed,
    // cancellation was requested before every unit finished; terminal
    Cancelled,
}

// Aborts whatever units are still waiting or in flight. Cloneable so a signal
// handler can hold one while the consumer drains.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

#[derive(Debug)]
struct Progress {
    total: usize,
    outstanding: AtomicUsize,
    cancelled: AtomicUsize,
}

struct CompletionGuard {
    tx: mpsc::UnboundedSender<FetchOutcome>,
    progress: Arc<Progress>,
    origin: String,
    emitted: bool,
}

impl CompletionGuard {
    fn emit(mut self, outcome: FetchOutcome) {
        if matches!(&outcome, FetchOutcome::Failure { error: ApiError::Cancelled, .. }) {
            self.progress.cancelled.fetch_add(1, Ordering::SeqCst);
        }
        self.report(outcome);
    }

    // Counted before the send so a consumer holding the outcome never sees
    // its unit as outstanding. The channel itself closes when the sender drops.
    fn report(&mut self, outcome: FetchOutcome) {
        self.emitted = true;
        let remaining = self.progress.outstanding.fetch_sub(1, Ordering::SeqCst) - 1;

        if self.tx.send(outcome).is_err() {
            tracing::debug!(origin = %self.origin, "outcome stream dropped by consumer");
        }

        tracing::debug!(origin = %self.origin, remaining, "fetch unit complete");
        if remaining == 0 {
            tracing::info!(total = self.progress.total, "all fetch units complete, closing outcome stream");
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        // A unit that panicked or was torn down with the runtime still reports
        if !self.emitted {
            let origin = self.origin.clone();
            self.report(FetchOutcome::Failure {
                origin,
                error: ApiError::Aborted("unit stopped before producing an outcome".to_string()),
            });
        }
    }
}

// Lazy, unordered, finite stream of outcomes for one fan-out call.
// Not restartable: once it yields `None` it stays closed.
pub struct FanOut {
    rx: mpsc::UnboundedReceiver<FetchOutcome>,
    progress: Arc<Progress>,
    cancel: CancelHandle,
    received: usize,
}

impl FanOut {
    // Waits for the next outcome; `None` once every unit has reported
    pub async fn recv(&mut self) -> Option<FetchOutcome> {
        let outcome = self.rx.recv().await;
        if outcome.is_some() {
            self.received += 1;
        }
        outcome
    }

    pub async fn collect_all(mut self) -> Vec<FetchOutcome> {
        let mut outcomes = Vec::with_capacity(self.total());
        while let Some(outcome) = self.recv().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    pub fn total(&self) -> usize {
        self.progress.total
    }

    // Units that have not reported yet. Reaching zero does not mean the
    // consumer has pulled every outcome; see `state`.
    pub fn outstanding(&self) -> usize {
        self.progress.outstanding.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn state(&self) -> FanOutState {
        let outstanding = self.outstanding();
        let cancelled_units = self.progress.cancelled.load(Ordering::SeqCst);

        if self.cancel.is_cancelled() && (outstanding > 0 || cancelled_units > 0) {
            FanOutState::Cancelled
        } else if outstanding == 0 && self.received == self.progress.total {
            FanOutState::Closed
        } else if outstanding == self.progress.total {
            FanOutState::Running
        } else {
            FanOutState::Draining
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for FanOut {
    type Item = FetchOutcome;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<FetchOutcome>> {
        let this = self.get_mut();
        let polled = this.rx.poll_recv(cx);
        if let Poll::Ready(Some(_)) = &polled {
            this.received += 1;
        }
        polled
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.progress.total.saturating_sub(self.received);
        (0, Some(remaining))
    }
}

/// Launches one concurrent fetch per origin and returns immediately.
///
/// Must be called from within a tokio runtime. Duplicate origins are fetched
/// independently. Dropping the returned `FanOut` together with every
/// `CancelHandle` cloned from it cancels units that have not finished.
pub fn fetch_all<S, I>(
    searcher: Arc<S>,
    origins: I,
    max_price: &str,
    config: &FanOutConfig,
) -> FanOut
where
    S: FlightSearcher + ?Sized,
    I: IntoIterator,
    I::Item: Into<String>,
{
    let requests: Vec<FetchRequest> = origins
        .into_iter()
        .map(|origin| FetchRequest::new(origin, max_price))
        .collect();
    let total = requests.len();

    let (tx, rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let progress = Arc::new(Progress {
        total,
        outstanding: AtomicUsize::new(total),
        cancelled: AtomicUsize::new(0),
    });
    let limiter = config
        .max_concurrency
        .map(|limit| Arc::new(Semaphore::new(limit.max(1))));

    tracing::info!(
        units = total,
        max_concurrency = ?config.max_concurrency,
        max_price,
        "launching fan-out"
    );

    for request in requests {
        let guard = CompletionGuard {
            tx: tx.clone(),
            progress: Arc::clone(&progress),
            origin: request.origin.clone(),
            emitted: false,
        };
        tokio::spawn(run_unit(
            Arc::clone(&searcher),
            request,
            guard,
            limiter.clone(),
            cancel_rx.clone(),
        ));
    }

    // Only the unit guards keep the channel open from here on
    drop(tx);

    FanOut {
        rx,
        progress,
        cancel: CancelHandle {
            tx: Arc::new(cancel_tx),
        },
        received: 0,
    }
}

async fn run_unit<S>(
    searcher: Arc<S>,
    request: FetchRequest,
    guard: CompletionGuard,
    limiter: Option<Arc<Semaphore>>,
    mut cancel: watch::Receiver<bool>,
) where
    S: FlightSearcher + ?Sized,
{
    let origin = request.origin.clone();

    let work = async {
        // never closed
        let _permit = match &limiter {
            Some(semaphore) => semaphore.acquire().await.ok(),
            None => None,
        };
        searcher.fetch_one(request).await
    };

    // Resolves on cancel, or when every CancelHandle is gone
    let cancelled = async {
        let _ = cancel.wait_for(|cancelled| *cancelled).await;
    };

    let outcome = tokio::select! {
        biased;
        _ = cancelled => {
            tracing::debug!(origin = %origin, "fetch unit cancelled");
            FetchOutcome::Failure { origin, error: ApiError::Cancelled }
        }
        outcome = work => outcome,
    };

    guard.emit(outcome);
}


#[cfg(test)]
mod tests {
    use super::mock_server::{MockSearcher, ServerMode};
    use super::*;
    use crate::error::ErrorKind;
    use futures::StreamExt;
    use std::collections::HashSet;
    use std::time::{Duration, Instant};

    fn origins(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("O{:02}", i)).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_emits_exactly_one_outcome_per_origin() {
        let searcher = Arc::new(MockSearcher::new());
        let input = origins(25);
        for origin in &input {
            searcher.set_delay(origin, rand::random::<u64>() % 50);
        }

        let mut fan_out = fetch_all(Arc::clone(&searcher), input.clone(), "300", &FanOutConfig::default());
        assert_eq!(fan_out.total(), 25);

        let mut seen = HashSet::new();
        while let Some(outcome) = fan_out.recv().await {
            assert!(outcome.is_success());
            assert!(seen.insert(outcome.origin().to_string()), "Duplicate outcome for {}", outcome.origin());
        }

        assert_eq!(seen, input.into_iter().collect::<HashSet<_>>());
        assert_eq!(fan_out.received(), 25);
        assert_eq!(fan_out.outstanding(), 0);
        assert_eq!(fan_out.state(), FanOutState::Closed);
    }

    #[tokio::test]
    async fn test_empty_origin_set_closes_immediately() {
        let searcher = Arc::new(MockSearcher::new());
        let mut fan_out = fetch_all(searcher.clone(), Vec::<String>::new(), "300", &FanOutConfig::default());

        assert_eq!(fan_out.state(), FanOutState::Closed);
        let next = tokio::time::timeout(Duration::from_millis(100), fan_out.recv()).await;
        assert!(matches!(next, Ok(None)), "Expected an already-closed stream");
        assert_eq!(searcher.request_count(), 0);
    }

    #[tokio::test]
    async fn test_outcomes_arrive_in_completion_order() {
        let searcher = Arc::new(MockSearcher::new());
        searcher.set_delay("PAR", 300);
        searcher.set_delay("MAD", 10);
        searcher.set_delay("LON", 150);

        let outcomes = fetch_all(searcher, ["PAR", "MAD", "LON"], "300", &FanOutConfig::default())
            .collect_all()
            .await;

        let order: Vec<&str> = outcomes.iter().map(|o| o.origin()).collect();
        assert_eq!(order, vec!["MAD", "LON", "PAR"]);
    }

    #[tokio::test]
    async fn test_failed_auth_never_reaches_search() {
        let searcher = Arc::new(MockSearcher::new());
        searcher.set_mode(ServerMode::AuthOutage);

        let outcomes = fetch_all(searcher.clone(), origins(5), "300", &FanOutConfig::default())
            .collect_all()
            .await;

        assert_eq!(outcomes.len(), 5);
        for outcome in outcomes {
            match outcome {
                FetchOutcome::Failure { error, .. } => assert_eq!(error.kind(), ErrorKind::Auth),
                other => panic!("Expected auth failure, got {:?}", other),
            }
        }
        assert_eq!(searcher.request_count(), 5);
        assert_eq!(searcher.search_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mixed_outcomes_close_once_after_all_report() {
        let searcher = Arc::new(MockSearcher::new());
        let input = origins(12);
        for (i, origin) in input.iter().enumerate() {
            searcher.set_delay(origin, (i as u64 * 7) % 40);
            if i % 3 == 0 {
                searcher.fail_origin(origin);
            }
        }

        let mut fan_out = fetch_all(searcher, input, "300", &FanOutConfig::default());

        let mut successes = 0;
        let mut failures = 0;
        while let Some(outcome) = fan_out.recv().await {
            match outcome {
                FetchOutcome::Success { .. } => successes += 1,
                FetchOutcome::Failure { error, .. } => {
                    assert_eq!(error.status(), Some(429));
                    failures += 1;
                }
            }
        }

        assert_eq!(successes, 8);
        assert_eq!(failures, 4);

        // Closed stays closed
        assert!(fan_out.recv().await.is_none());
        assert!(fan_out.recv().await.is_none());
        assert_eq!(fan_out.received(), 12);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fetch_all_returns_before_units_finish() {
        let searcher = Arc::new(MockSearcher::new());
        searcher.set_default_delay(300);

        let started = Instant::now();
        let mut fan_out = fetch_all(searcher, origins(4), "300", &FanOutConfig::default());
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(fan_out.state(), FanOutState::Running);

        fan_out.recv().await.unwrap();
        let state = fan_out.state();
        assert!(
            matches!(state, FanOutState::Draining | FanOutState::Closed),
            "Unexpected state {:?}",
            state
        );

        while fan_out.recv().await.is_some() {}
        assert_eq!(fan_out.state(), FanOutState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unbounded_units_run_in_parallel() {
        let searcher = Arc::new(MockSearcher::new());
        searcher.set_default_delay(200);

        let started = Instant::now();
        let outcomes = fetch_all(searcher.clone(), origins(20), "300", &FanOutConfig::default())
            .collect_all()
            .await;
        let elapsed = started.elapsed();

        assert_eq!(outcomes.len(), 20);
        assert_eq!(searcher.max_in_flight(), 20);
        assert!(
            elapsed < Duration::from_millis(1500),
            "20 x 200ms fetches took {:?}, expected them to overlap",
            elapsed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_cap_is_respected() {
        let searcher = Arc::new(MockSearcher::new());
        searcher.set_default_delay(30);

        let config = FanOutConfig {
            max_concurrency: Some(3),
        };
        let outcomes = fetch_all(searcher.clone(), origins(12), "300", &config)
            .collect_all()
            .await;

        assert_eq!(outcomes.len(), 12);
        assert!(
            searcher.max_in_flight() <= 3,
            "Saw {} concurrent searches with a cap of 3",
            searcher.max_in_flight()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_aborts_outstanding_units() {
        let searcher = Arc::new(MockSearcher::new());
        searcher.set_default_delay(10_000);
        searcher.set_delay("FAST", 0);

        let mut input = origins(5);
        input.push("FAST".to_string());
        let mut fan_out = fetch_all(searcher.clone(), input, "300", &FanOutConfig::default());

        let first = fan_out.recv().await.unwrap();
        assert_eq!(first.origin(), "FAST");
        assert!(first.is_success());

        let started = Instant::now();
        fan_out.cancel_handle().cancel();

        let mut cancelled = 0;
        while let Some(outcome) = fan_out.recv().await {
            match outcome {
                FetchOutcome::Failure { error: ApiError::Cancelled, .. } => cancelled += 1,
                other => panic!("Expected cancellation, got {:?}", other),
            }
        }

        assert_eq!(cancelled, 5);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(fan_out.state(), FanOutState::Cancelled);
        assert_eq!(searcher.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_releases_units_waiting_for_a_permit() {
        let searcher = Arc::new(MockSearcher::new());
        searcher.set_default_delay(10_000);

        let config = FanOutConfig {
            max_concurrency: Some(1),
        };
        let fan_out = fetch_all(searcher.clone(), origins(4), "300", &config);
        fan_out.cancel();

        let outcomes = tokio::time::timeout(Duration::from_secs(2), fan_out.collect_all())
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 4);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, FetchOutcome::Failure { error: ApiError::Cancelled, .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropping_fan_out_stops_units() {
        let searcher = Arc::new(MockSearcher::new());
        searcher.set_default_delay(10_000);

        let fan_out = fetch_all(searcher.clone(), origins(3), "300", &FanOutConfig::default());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(searcher.in_flight(), 3);

        drop(fan_out);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(searcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_repeated_fan_outs_are_independent() {
        let searcher = Arc::new(MockSearcher::new());
        let input = vec!["PAR", "MAD", "LON"];

        let first = fetch_all(searcher.clone(), input.clone(), "300", &FanOutConfig::default())
            .collect_all()
            .await;
        let second = fetch_all(searcher.clone(), input, "300", &FanOutConfig::default())
            .collect_all()
            .await;

        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 3);
        assert_eq!(searcher.request_count(), 6);
    }

    #[tokio::test]
    async fn test_duplicate_origins_are_separate_units() {
        let searcher = Arc::new(MockSearcher::new());
        let outcomes = fetch_all(searcher.clone(), ["PAR", "PAR"], "300", &FanOutConfig::default())
            .collect_all()
            .await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(searcher.request_count(), 2);
    }

    struct PanickingSearcher {
        inner: MockSearcher,
        panic_on: &'static str,
    }

    #[async_trait::async_trait]
    impl FlightSearcher for PanickingSearcher {
        async fn fetch_one(&self, request: FetchRequest) -> FetchOutcome {
            if request.origin == self.panic_on {
                panic!("searcher blew up on {}", request.origin);
            }
            self.inner.fetch_one(request).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_unit_still_reports() {
        let searcher = Arc::new(PanickingSearcher {
            inner: MockSearcher::new(),
            panic_on: "BAD",
        });
        let mut fan_out = fetch_all(searcher, ["BAD", "OK1", "OK2"], "300", &FanOutConfig::default());

        let mut aborted = Vec::new();
        let mut successes = 0;
        while let Some(outcome) = tokio::time::timeout(Duration::from_secs(2), fan_out.recv())
            .await
            .unwrap()
        {
            match outcome {
                FetchOutcome::Failure { origin, error: ApiError::Aborted(_) } => aborted.push(origin),
                FetchOutcome::Success { .. } => successes += 1,
                other => panic!("Unexpected outcome {:?}", other),
            }
        }

        assert_eq!(aborted, vec!["BAD".to_string()]);
        assert_eq!(successes, 2);
        assert_eq!(fan_out.received(), 3);
        assert!(fan_out.recv().await.is_none());
        assert_eq!(fan_out.state(), FanOutState::Closed);
    }

    #[tokio::test]
    async fn test_closed_only_once_buffered_outcomes_are_received() {
        let searcher = Arc::new(MockSearcher::new());
        let mut fan_out = fetch_all(searcher, origins(3), "300", &FanOutConfig::default());

        // Let every unit report without reading anything
        tokio::time::timeout(Duration::from_secs(2), async {
            while fan_out.outstanding() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(fan_out.state(), FanOutState::Draining);

        fan_out.recv().await.unwrap();
        fan_out.recv().await.unwrap();
        assert_eq!(fan_out.state(), FanOutState::Draining);

        fan_out.recv().await.unwrap();
        assert_eq!(fan_out.state(), FanOutState::Closed);
        assert!(fan_out.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_consumed_as_stream() {
        let searcher = Arc::new(MockSearcher::new());
        let fan_out = fetch_all(searcher, origins(6), "120", &FanOutConfig::default());
        assert_eq!(fan_out.size_hint(), (0, Some(6)));

        let prices: Vec<String> = fan_out
            .filter_map(|outcome| async move { outcome.into_result().ok() })
            .map(|response| response.data[0].price.total.clone())
            .collect()
            .await;

        assert_eq!(prices.len(), 6);
        assert!(prices.iter().all(|p| p == "120"));
    }
}
