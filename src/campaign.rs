use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use indicatif::ProgressBar;
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::discovery::{DiscoveryReport, Endpoint, EndpointDiscovery};
use crate::orchestrator::{AttackOrchestrator, CancelHandle};
use crate::report::{RunMode, RunReport};
use crate::stats::StatsAggregator;
use crate::transport::Transport;
use crate::variant::{VariantGenerator, VariantStats};

/// One run, from a validated `RunConfig` to a `RunReport`:
/// generate variants, discover endpoints, then attack the cross product.
pub struct Campaign {
    config: RunConfig,
    transport: Arc<dyn Transport>,
    cancel: CancelHandle,
    progress: Option<ProgressBar>,
}

impl Campaign {
    pub fn new(config: RunConfig, transport: Arc<dyn Transport>) -> Self {
        Campaign {
            config,
            transport,
            cancel: CancelHandle::new(),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn mode(&self) -> RunMode {
        if self.config.variants_only {
            RunMode::VariantsOnly
        } else if self.config.scan_only {
            RunMode::ScanOnly
        } else {
            RunMode::Attack
        }
    }

    #[tracing::instrument(skip(self), fields(email = %self.config.email, mode = ?self.mode()))]
    pub async fn run(self) -> RunReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mode = self.mode();

        let variants = if mode == RunMode::ScanOnly {
            Vec::new()
        } else {
            let mut generator = match self.config.seed {
                Some(seed) => VariantGenerator::with_seed(seed),
                None => VariantGenerator::new(),
            };
            generator.generate(
                &self.config.email,
                self.config.max_variants,
                &self.config.techniques,
            )
        };
        let variant_stats = VariantStats::from_variants(&variants);

        let mut report = RunReport {
            mode,
            target: self.config.target.clone(),
            email: self.config.email.clone(),
            started_at,
            duration_seconds: 0.0,
            interrupted: false,
            discovery: None,
            endpoints: Vec::new(),
            variants,
            variant_stats,
            attempts: Vec::new(),
            summary: StatsAggregator::new().summary(),
        };

        if mode == RunMode::VariantsOnly {
            report.duration_seconds = clock.elapsed().as_secs_f64();
            return report;
        }

        let discovery = self.discover().await;
        report.endpoints = self.attack_surface(&discovery);
        report.discovery = Some(discovery);
        info!(endpoints = report.endpoints.len(), "attack surface ready");

        if mode == RunMode::Attack {
            let mut orchestrator = AttackOrchestrator::new(self.transport.clone(), &self.config)
                .with_cancel_handle(self.cancel.clone());
            if let Some(progress) = &self.progress {
                orchestrator = orchestrator.with_progress(progress.clone());
            }

            let (summary, attempts) = orchestrator
                .run(&self.config.email, &report.variants, &report.endpoints)
                .await
                .finalize();

            let planned = report.variants.len() * report.endpoints.len();
            report.interrupted = self.cancel.is_cancelled() && summary.total_attempts < planned;
            report.summary = summary;
            report.attempts = attempts;
        }

        report.duration_seconds = clock.elapsed().as_secs_f64();
        report
    }

    async fn discover(&self) -> DiscoveryReport {
        let Some(target) = self.config.target_url() else {
            warn!("no usable target, skipping discovery");
            return DiscoveryReport::default();
        };
        EndpointDiscovery::new(self.transport.clone(), self.config.probe_timeout())
            .discover(&target)
            .await
    }

    /// Discovered endpoints followed by declared ones not already found.
    fn attack_surface(&self, discovery: &DiscoveryReport) -> Vec<Endpoint> {
        let mut endpoints = discovery.endpoints.clone();
        if let Some(target) = self.config.target_url() {
            let mut seen: HashSet<_> = endpoints.iter().map(|e| (e.method, e.url.clone())).collect();
            for path in &self.config.extra_paths {
                let declared = Endpoint::declared(&target, path);
                if seen.insert((declared.method, declared.url.clone())) {
                    endpoints.push(declared);
                }
            }
        }
        endpoints
    }
}

/// Convenience wrapper for callers that need neither progress nor interrupt.
pub async fn run(config: RunConfig, transport: Arc<dyn Transport>) -> RunReport {
    Campaign::new(config, transport).run().await
}
