use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use homoprobe::config::{
    DEFAULT_CONCURRENCY, DEFAULT_DELAY_SECONDS, DEFAULT_MAX_VARIANTS, DEFAULT_PROBE_TIMEOUT_SECONDS,
    DEFAULT_TIMEOUT_SECONDS,
};
use homoprobe::report::{RunMode, RunReport};
use homoprobe::transport::ReqwestTransport;
use homoprobe::{telemetry, Campaign, RunConfig, Technique};

const EXIT_CONFIG: u8 = 1;
const EXIT_REPORT: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "homoprobe")]
#[command(about = "Tests account-recovery endpoints against Unicode lookalikes of an email address")]
struct Cli {
    /// Target site (https:// is assumed when no scheme is given)
    #[arg(short, long)]
    target: Option<String>,

    /// Email address to build lookalike variants of
    #[arg(short, long)]
    email: Option<String>,

    /// Number of concurrent workers
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    threads: usize,

    /// Minimum seconds between two requests to the same endpoint
    #[arg(long, default_value_t = DEFAULT_DELAY_SECONDS)]
    delay: f64,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECONDS)]
    timeout: f64,

    /// Maximum number of variants to generate
    #[arg(long, default_value_t = DEFAULT_MAX_VARIANTS)]
    max_variants: usize,

    /// Add random jitter to request spacing and rotate user agents
    #[arg(long)]
    stealth: bool,

    /// Rotate user agents
    #[arg(long)]
    random_ua: bool,

    /// Proxy URL for every request
    #[arg(long)]
    proxy: Option<String>,

    /// Only discover endpoints, send no attempts
    #[arg(long)]
    scan_only: bool,

    /// Only print variants, no network activity
    #[arg(long)]
    variants_only: bool,

    /// Technique to enable (repeatable; all when omitted)
    #[arg(long = "technique", value_enum)]
    techniques: Vec<Technique>,

    /// Extra recovery path to attack without probing (repeatable)
    #[arg(long = "endpoint")]
    endpoints: Vec<String>,

    /// Seed for reproducible variant sampling
    #[arg(long)]
    seed: Option<u64>,

    /// Stop dispatching attempts after this many seconds
    #[arg(long)]
    deadline: Option<f64>,

    /// Timeout in seconds for each discovery probe
    #[arg(long, default_value_t = DEFAULT_PROBE_TIMEOUT_SECONDS)]
    probe_timeout: f64,

    /// Body length bucket in bytes for baseline comparison
    #[arg(long)]
    length_bucket: Option<usize>,

    /// How many times slower than the baseline counts as a timing difference
    #[arg(long)]
    timing_multiplier: Option<f64>,

    /// Directory for the JSON report
    #[arg(short, long, default_value = "results")]
    output: PathBuf,

    /// Do not write the JSON report
    #[arg(long)]
    no_report: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self, email: String) -> RunConfig {
        let mut config = RunConfig::new(email);
        config.target = self.target;
        config.concurrency = self.threads;
        config.delay_seconds = self.delay;
        config.timeout_seconds = self.timeout;
        config.probe_timeout_seconds = self.probe_timeout;
        config.max_variants = self.max_variants;
        config.stealth = self.stealth;
        config.random_ua = self.random_ua;
        config.proxy = self.proxy;
        config.scan_only = self.scan_only;
        config.variants_only = self.variants_only;
        if !self.techniques.is_empty() {
            config.techniques = self.techniques;
        }
        config.extra_paths = self.endpoints;
        config.seed = self.seed;
        config.deadline_seconds = self.deadline;
        if let Some(bucket) = self.length_bucket {
            config.thresholds.length_bucket = bucket;
        }
        if let Some(multiplier) = self.timing_multiplier {
            config.thresholds.timing_multiplier = multiplier;
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(EXIT_CONFIG),
            };
        }
    };

    telemetry::init(cli.verbose);

    let Some(email) = cli.email.clone() else {
        eprintln!("error: an email address is required (-e/--email)");
        return ExitCode::from(EXIT_CONFIG);
    };
    let output = cli.output.clone();
    let write_report = !cli.no_report;

    let config = match cli.into_config(email).validate() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let transport = match ReqwestTransport::from_config(&config) {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let mut campaign = Campaign::new(config.clone(), transport);
    let progress = (!config.scan_only && !config.variants_only).then(progress_bar);
    if let Some(bar) = &progress {
        campaign = campaign.with_progress(bar.clone());
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let cancel = campaign.cancel_handle();
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted, waiting for in-flight attempts");
                interrupted.store(true, Ordering::SeqCst);
                cancel.cancel();
            }
        });
    }

    let report = campaign.run().await;
    if let Some(bar) = progress {
        bar.finish_and_clear();
    }
    print_report(&report);

    if write_report {
        match save(&report, &output) {
            Ok(path) => eprintln!("Report written to {}", path.display()),
            Err(e) => {
                eprintln!("error: {:#}", e);
                return ExitCode::from(EXIT_REPORT);
            }
        }
    }

    if interrupted.load(Ordering::SeqCst) {
        ExitCode::from(EXIT_INTERRUPTED)
    } else {
        ExitCode::SUCCESS
    }
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    if let Ok(style) =
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} attempts")
    {
        bar.set_style(style);
    }
    bar
}

fn save(report: &RunReport, dir: &std::path::Path) -> anyhow::Result<PathBuf> {
    report
        .write_json(dir)
        .with_context(|| format!("writing report under {}", dir.display()))
}

/// Data lines go to stdout, everything else to stderr.
fn print_report(report: &RunReport) {
    match report.mode {
        RunMode::VariantsOnly => {
            for variant in &report.variants {
                println!(
                    "{}, {}, {}",
                    variant.transformed, variant.technique, variant.subtechnique
                );
            }
        }
        RunMode::ScanOnly => {
            for endpoint in &report.endpoints {
                println!("{}, {:?}, {:?}", endpoint.url, endpoint.method, endpoint.kind);
            }
        }
        RunMode::Attack => {
            for attempt in report.successes() {
                println!(
                    "{}, {}, {}, {}",
                    attempt.variant.transformed,
                    attempt.variant.technique,
                    attempt.endpoint.url,
                    attempt.indicators.join(" ")
                );
            }
        }
    }

    let stats = &report.variant_stats;
    eprintln!("Generated {} variants", stats.total);
    for (technique, count) in &stats.by_technique {
        eprintln!("  {}: {}", technique, count);
    }

    if let Some(discovery) = &report.discovery {
        eprintln!("Found {} endpoints", report.endpoints.len());
        if let Some(server) = &discovery.site.server {
            eprintln!("  server: {}", server);
        }
        if let Some(cms) = &discovery.site.cms {
            eprintln!("  cms: {}", cms);
        }
        for provider in discovery.providers.keys() {
            eprintln!("  oauth provider: {}", provider);
        }
    }

    if report.mode == RunMode::Attack {
        let summary = &report.summary;
        eprintln!(
            "{} attempts: {} successes, {} failures, {} errors, {} timeouts ({:.1}% success)",
            summary.total_attempts,
            summary.successes,
            summary.failures,
            summary.errors,
            summary.timeouts,
            summary.success_rate
        );
        eprintln!(
            "Response time avg {:.3}s (min {:.3}s, max {:.3}s), peak in flight {}",
            summary.avg_response_time,
            summary.min_response_time,
            summary.max_response_time,
            summary.peak_in_flight
        );
        if report.interrupted {
            eprintln!("Run stopped early, results are partial");
        }
    }
}
