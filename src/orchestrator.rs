use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use indicatif::ProgressBar;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::classifier::{self, ClassifierThresholds, Outcome, ResponseFeatures};
use crate::config::RunConfig;
use crate::discovery::Endpoint;
use crate::executor::AttemptExecutor;
use crate::stats::StatsAggregator;
use crate::transport::{Transport, TransportError};
use crate::variant::Variant;

/// Floor for the stealth jitter window when the configured delay is tiny.
pub const MIN_STEALTH_JITTER: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptResult {
    pub variant: Variant,
    pub endpoint: Endpoint,
    pub timestamp: DateTime<Utc>,
    pub status_code: Option<u16>,
    /// Seconds.
    pub response_time: f64,
    pub outcome: Outcome,
    pub evidence: String,
    pub indicators: Vec<String>,
}

/// Stops dispatching new attempts once triggered.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        let (tx, _) = watch::channel(false);
        CancelHandle { tx: Arc::new(tx) }
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Minimum spacing between consecutive requests to the same endpoint.
/// Each caller reserves a slot under the lock, then sleeps outside it.
pub struct EndpointPacer {
    delay: Duration,
    jitter_max: Option<Duration>,
    last: Mutex<HashMap<String, Instant>>,
}

impl EndpointPacer {
    pub fn new(delay: Duration, stealth: bool) -> Self {
        EndpointPacer {
            delay,
            jitter_max: stealth.then(|| delay.max(MIN_STEALTH_JITTER)),
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn reserve(&self, endpoint: &str) -> Instant {
        let spacing = match self.jitter_max {
            Some(max) => self.delay + max.mul_f64(rand::thread_rng().gen_range(0.0..=1.0)),
            None => self.delay,
        };

        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let slot = match last.get(endpoint) {
            Some(previous) => now.max(*previous + spacing),
            None => now,
        };
        last.insert(endpoint.to_string(), slot);
        slot
    }
}

#[derive(Default)]
struct InFlightGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

struct InFlightGuard<'a>(&'a InFlightGauge);

impl InFlightGauge {
    fn enter(&self) -> InFlightGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

type WorkQueue = Mutex<VecDeque<(usize, usize)>>;

/// Shared, read-only state handed to every worker.
struct Shared {
    executor: AttemptExecutor,
    thresholds: ClassifierThresholds,
    timeout: Duration,
    pacer: EndpointPacer,
    gauge: InFlightGauge,
    variants: Vec<Variant>,
    endpoints: Vec<Endpoint>,
    baselines: Vec<Option<ResponseFeatures>>,
    queue: WorkQueue,
}

pub struct AttackOrchestrator {
    transport: Arc<dyn Transport>,
    config: RunConfig,
    cancel: CancelHandle,
    progress: Option<ProgressBar>,
}

impl AttackOrchestrator {
    pub fn new(transport: Arc<dyn Transport>, config: &RunConfig) -> Self {
        AttackOrchestrator {
            transport,
            config: config.clone(),
            cancel: CancelHandle::new(),
            progress: None,
        }
    }

    /// Shares an existing handle, e.g. one already wired to Ctrl-C.
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Runs the full variant x endpoint matrix and returns every recorded
    /// attempt, in completion order, folded into a `StatsAggregator`.
    #[tracing::instrument(skip_all, fields(variants = variants.len(), endpoints = endpoints.len()))]
    pub async fn run(
        &self,
        email: &str,
        variants: &[Variant],
        endpoints: &[Endpoint],
    ) -> StatsAggregator {
        let mut stats = StatsAggregator::new();
        if variants.is_empty() || endpoints.is_empty() {
            return stats;
        }

        let total = variants.len() * endpoints.len();
        let workers = self.config.concurrency.max(1);
        info!(total, workers, "starting attempt matrix");

        let deadline_task = self.config.deadline().map(|deadline| {
            let handle = self.cancel_handle();
            tokio::spawn(async move {
                sleep(deadline).await;
                warn!(?deadline, "run deadline reached, no new attempts will be dispatched");
                handle.cancel();
            })
        });

        let executor = AttemptExecutor::new(self.transport.clone(), &self.config);
        let pacer = EndpointPacer::new(self.config.delay(), self.config.stealth);
        let baselines = self.baselines(email, endpoints, &executor, &pacer, workers).await;

        let queue: VecDeque<(usize, usize)> = (0..variants.len())
            .flat_map(|v| (0..endpoints.len()).map(move |e| (v, e)))
            .collect();

        let shared = Arc::new(Shared {
            executor,
            thresholds: self.config.thresholds,
            timeout: self.config.timeout(),
            pacer,
            gauge: InFlightGauge::default(),
            variants: variants.to_vec(),
            endpoints: endpoints.to_vec(),
            baselines,
            queue: Mutex::new(queue),
        });

        if let Some(progress) = &self.progress {
            progress.set_length(total as u64);
        }

        let (tx, mut rx) = mpsc::channel::<AttemptResult>(workers * 4);
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let shared = shared.clone();
                let tx = tx.clone();
                let cancel = self.cancel.subscribe();
                tokio::spawn(worker(id, shared, tx, cancel))
            })
            .collect();
        drop(tx);

        // Single writer for the result sink
        while let Some(result) = rx.recv().await {
            if let Some(progress) = &self.progress {
                progress.inc(1);
            }
            stats.accumulate(result);
        }

        for joined in join_all(handles).await {
            if let Err(e) = joined {
                warn!(error = %e, "worker task failed");
            }
        }
        if let Some(task) = deadline_task {
            task.abort();
        }

        stats.record_peak_in_flight(shared.gauge.peak());
        let summary = stats.summary();
        info!(
            attempts = summary.total_attempts,
            successes = summary.successes,
            skipped = total - summary.total_attempts,
            "attempt matrix finished"
        );
        stats
    }

    async fn baselines(
        &self,
        email: &str,
        endpoints: &[Endpoint],
        executor: &AttemptExecutor,
        pacer: &EndpointPacer,
        workers: usize,
    ) -> Vec<Option<ResponseFeatures>> {
        let cancel = self.cancel_handle();
        stream::iter(endpoints)
            .map(|endpoint| {
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    sleep_until(pacer.reserve(&endpoint.url)).await;
                    let limit = executor.timeout();
                    match timeout(limit, executor.execute_baseline(email, endpoint)).await {
                        Ok(Ok(response)) => Some(ResponseFeatures::from_response(&response)),
                        Ok(Err(e)) => {
                            warn!(endpoint = %endpoint.url, error = %e, "baseline request failed");
                            None
                        }
                        Err(_) => {
                            let e = TransportError::Timeout(limit);
                            warn!(endpoint = %endpoint.url, error = %e, "baseline request failed");
                            None
                        }
                    }
                }
            })
            .buffered(workers)
            .collect()
            .await
    }
}

async fn worker(
    id: usize,
    shared: Arc<Shared>,
    tx: mpsc::Sender<AttemptResult>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        if *cancel.borrow() {
            break;
        }
        let next = shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let Some((v, e)) = next else {
            break;
        };
        let variant = &shared.variants[v];
        let endpoint = &shared.endpoints[e];

        let slot = shared.pacer.reserve(&endpoint.url);
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => break,
            _ = sleep_until(slot) => {}
        }

        let result = attempt(&shared, variant, endpoint, e).await;
        debug!(worker = id, outcome = ?result.outcome, variant = %variant.transformed, "attempt recorded");
        if tx.send(result).await.is_err() {
            break;
        }
    }
}

async fn attempt(
    shared: &Shared,
    variant: &Variant,
    endpoint: &Endpoint,
    endpoint_index: usize,
) -> AttemptResult {
    let _in_flight = shared.gauge.enter();
    let timestamp = Utc::now();
    let started = Instant::now();

    let response = match timeout(shared.timeout, shared.executor.execute(variant, endpoint)).await {
        Ok(response) => response,
        Err(_) => Err(TransportError::Timeout(shared.timeout)),
    };
    let response_time = started.elapsed().as_secs_f64();

    let features = response.as_ref().map(ResponseFeatures::from_response);
    let verdict = classifier::classify(
        features.as_ref().map_err(|e| *e),
        shared.baselines[endpoint_index].as_ref(),
        endpoint.kind,
        &shared.thresholds,
    );

    AttemptResult {
        variant: variant.clone(),
        endpoint: endpoint.clone(),
        timestamp,
        status_code: response.as_ref().ok().map(|r| r.status),
        response_time,
        outcome: verdict.outcome,
        evidence: classifier::evidence(response.as_ref()),
        indicators: verdict.indicators,
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without cancelling
            std::future::pending::<()>().await;
        }
    }
}
