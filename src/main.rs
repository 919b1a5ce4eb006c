use clap::Parser;
use colored::Colorize;
use itertools::Itertools;
use log::{info, warn};
use std::ops::Range;
use std::sync::Arc;

use seu_injector::error::Result;
use seu_injector::prelude::*;

use git_version::git_version;
const GIT_VERSION: &str = git_version!(fallback = "unknown");

const RESULTS_FILE: &str = "results.jsonl";

/// Program to inject single event upsets into embedded boards and simulators
///
fn main() -> std::result::Result<(), String> {
    // Get parameter from command line
    let args = Args::parse();
    env_logger::init(); // Switch on with: RUST_LOG=info cargo run

    println!("--- SEU fault injector: {GIT_VERSION} ---\n");

    let mut config = Config::from_file(&args.config)?;
    config.override_with_args(&args);

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            warn!("Interrupt received, finishing current iterations");
            cancel.cancel();
        })
        .map_err(|e| format!("Failed to install interrupt handler: {e}"))?;
    }

    run(&config, cancel).map_err(|e| e.to_string())
}

fn run(config: &Config, cancel: CancelToken) -> Result<()> {
    let catalog = Arc::new(config.catalog()?);
    info!(
        "Loaded {} catalog: {} targets, {} bits",
        config.architecture,
        catalog.targets().count(),
        catalog.total_bits()
    );

    let results = JsonLinesStore::open(&config.results_path.join(RESULTS_FILE))?;
    info!("Recording results to {}", results.path().display());
    let store: Arc<dyn ResultStore> = Arc::new(results);
    let injector_config = config.shared_injector_config()?;
    store.insert_campaign(&injector_config.campaign)?;

    let mode = match config.supervise {
        true => Mode::Supervise,
        false => Mode::Inject,
    };
    let workers = config.workers();
    println!(
        "Campaign {}: {} iterations from {} on {} worker(s) ({})",
        config.campaign_id,
        config.iterations,
        config.start_iteration,
        workers,
        config.backend.name()
    );

    let counter = IterationCounter::new(config.start_iteration, config.iterations);
    let scheduler = CampaignScheduler::new(workers, mode, cancel.clone());
    let report = scheduler.run(&counter, |worker| {
        FaultInjector::new(
            config.link(worker, &cancel)?,
            Arc::clone(&catalog),
            config.selector(worker),
            Arc::clone(&store),
            Arc::clone(&injector_config),
            cancel.clone(),
        )
    })?;

    print_summary(&report, store.as_ref(), config.campaign_id, counter.range())
}

fn print_summary(
    report: &SchedulerReport,
    store: &dyn ResultStore,
    campaign_id: u64,
    iterations: Range<u64>,
) -> Result<()> {
    println!("\nCompleted {} iteration(s) on {} worker(s)", report.completed, report.workers);
    for ((category, outcome), count) in store
        .results_in(campaign_id, iterations)?
        .into_iter()
        .map(|result| (result.outcome_category, result.outcome))
        .counts()
        .into_iter()
        .sorted()
    {
        println!("  {:<20} {:<30} {count}", category.to_string(), outcome);
    }
    if report.interrupted {
        println!("{}", format!("Interrupted, {} iteration(s) not started", report.remaining).yellow());
    }
    if report.failed_workers > 0 {
        println!("{}", format!("{} worker(s) stopped on errors", report.failed_workers).red());
    }
    Ok(())
}
