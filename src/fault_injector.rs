//! One worker's iteration state machine: select, apply, monitor, compare,
//! classify, tear down and persist.

use colored::Colorize;
use itertools::Itertools;
use log::{debug, info, warn};
use rand::seq::index;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::debugger::device::detected_errors;
use crate::debugger::{DebuggerLink, Device, IterationContext, LinkEvent};
use crate::error::{Error, Result};
use crate::record::{classify, Campaign, Failure, Injection, InjectionPoint, IterationResult, Observations, OutcomeCategory};
use crate::store::ResultStore;
use crate::targets::{Catalog, InjectionSelector, RegisterLocation};

/// Per-campaign settings shared by all workers.
#[derive(Debug, Clone)]
pub struct InjectorConfig {
    pub campaign: Campaign,
    pub num_injections: usize,
    pub dut_files: Vec<PathBuf>,
    pub aux_files: Vec<PathBuf>,
    pub results_dir: PathBuf,
    pub execution_timeout: Duration,
}

impl InjectorConfig {
    fn iteration_directory(&self, iteration: u64) -> PathBuf {
        self.results_dir
            .join(self.campaign.id.to_string())
            .join(iteration.to_string())
    }

    fn gold_output(&self, file: &str) -> PathBuf {
        self.results_dir
            .join(self.campaign.id.to_string())
            .join(format!("gold_{file}"))
    }
}

/// Draws the sorted injection points of one iteration.
///
/// Simulator campaigns use distinct checkpoints from `[0, num_checkpoints - 1)`,
/// device campaigns use offsets into the expected execution time.
pub fn injection_points<R: Rng>(rng: &mut R, campaign: &Campaign, count: usize) -> Result<Vec<InjectionPoint>> {
    if campaign.simulator {
        let available = campaign.num_checkpoints.saturating_sub(1);
        if count > available {
            return Err(Error::Config(format!(
                "{count} injections requested but only {available} checkpoints available"
            )));
        }
        let mut checkpoints = index::sample(rng, available, count).into_vec();
        checkpoints.sort_unstable();
        return Ok(checkpoints.into_iter().map(InjectionPoint::Checkpoint).collect());
    }
    let mut offsets: Vec<Duration> = (0..count)
        .map(|_| match campaign.exec_time.is_zero() {
            true => Duration::ZERO,
            false => campaign.exec_time.mul_f64(rng.gen::<f64>()),
        })
        .collect();
    offsets.sort_unstable();
    Ok(offsets.into_iter().map(InjectionPoint::Time).collect())
}

/// Byte-multiset similarity of two outputs, `1.0` for identical content.
pub fn similarity(gold: &[u8], output: &[u8]) -> f64 {
    let total = gold.len() + output.len();
    if total == 0 {
        return 1.0;
    }
    let gold_counts = gold.iter().counts();
    let output_counts = output.iter().counts();
    let matches: usize = gold_counts
        .iter()
        .map(|(byte, count)| (*count).min(output_counts.get(byte).copied().unwrap_or(0)))
        .sum();
    2.0 * matches as f64 / total as f64
}

/// Auxiliary workload running next to the DUT's.
struct AuxRun {
    handle: JoinHandle<(Device, Result<String>)>,
}

pub struct FaultInjector {
    link: Box<dyn DebuggerLink>,
    catalog: Arc<Catalog>,
    selector: InjectionSelector,
    store: Arc<dyn ResultStore>,
    config: Arc<InjectorConfig>,
    cancel: CancelToken,
}

impl FaultInjector {
    pub fn new(
        link: Box<dyn DebuggerLink>,
        catalog: Arc<Catalog>,
        selector: InjectionSelector,
        store: Arc<dyn ResultStore>,
        config: Arc<InjectorConfig>,
        cancel: CancelToken,
    ) -> Result<Self> {
        if config.num_injections == 0 {
            return Err(Error::Config("at least one injection per iteration is required".to_string()));
        }
        if catalog.is_empty() {
            return Err(Error::Selection("no injection targets left after restriction".to_string()));
        }
        Ok(Self {
            link,
            catalog,
            selector,
            store,
            config,
            cancel,
        })
    }

    pub fn connect(&mut self) -> Result<()> {
        self.link.connect()
    }

    pub fn close(&mut self) -> Result<()> {
        self.link.close()
    }

    pub fn link(&self) -> &dyn DebuggerLink {
        self.link.as_ref()
    }

    fn context(&self, iteration: u64) -> IterationContext {
        IterationContext {
            campaign_id: self.config.campaign.id,
            iteration,
            command: self.config.campaign.command.clone(),
        }
    }

    /// Runs one injection iteration and persists its result.
    ///
    /// Iteration-local failures become the outcome of the returned result.
    /// Errors that stop the worker are persisted as an incomplete result
    /// and returned.
    pub fn run_iteration(&mut self, iteration: u64) -> Result<IterationResult> {
        let mut result = IterationResult::new(self.config.campaign.id, iteration);
        let mut observations = Observations::default();
        let mut aux_run = None;

        let stop = match self.inject(iteration, &mut result, &mut aux_run) {
            Ok(()) => match self.link.continue_execution() {
                Ok(()) => self.monitor(&mut observations),
                Err(error) => self.record_failure(&mut observations, error),
            },
            Err(error) => self.record_failure(&mut observations, error),
        };
        self.finish(result, observations, aux_run, stop)
    }

    /// Runs the workload without injections.
    pub fn supervise(&mut self, iteration: u64) -> Result<IterationResult> {
        let result = IterationResult::new(self.config.campaign.id, iteration);
        let mut observations = Observations::default();
        let mut aux_run = None;

        let stop = match self.start_supervised(iteration, &mut aux_run) {
            Ok(()) => self.monitor(&mut observations),
            Err(error) => self.record_failure(&mut observations, error),
        };
        self.finish(result, observations, aux_run, stop)
    }

    fn start_supervised(&mut self, iteration: u64, aux_run: &mut Option<AuxRun>) -> Result<()> {
        let context = self.context(iteration);
        self.link.begin_supervision(&context)?;
        if self.config.campaign.simulator {
            *aux_run = self.start_aux();
            self.link.continue_execution()
        } else {
            self.link.send_files(&self.config.dut_files)?;
            *aux_run = self.start_aux();
            self.link.dut()?.write_line(&context.command)
        }
    }

    /// Applies all injections and follows them through the monitored window.
    fn inject(
        &mut self,
        iteration: u64,
        result: &mut IterationResult,
        aux_run: &mut Option<AuxRun>,
    ) -> Result<()> {
        let config = Arc::clone(&self.config);
        let campaign = &config.campaign;
        let context = self.context(iteration);
        self.link.begin_iteration(&context)?;
        let points = injection_points(self.selector.rng(), campaign, config.num_injections)?;
        if !campaign.simulator {
            self.link.send_files(&config.dut_files)?;
            *aux_run = self.start_aux();
        }

        let mut injected: Vec<(Injection, RegisterLocation)> = Vec::with_capacity(points.len());
        for (position, point) in points.iter().enumerate() {
            self.cancel.check()?;
            self.link.advance_to(point)?;
            if campaign.simulator && position == 0 {
                *aux_run = self.start_aux();
            }

            let site = self.selector.choose(&self.catalog)?;
            let location = self.catalog.locate(&site)?;
            self.link.select_context(site.core)?;
            let gold_value = self.link.read_register(&location)?;
            let injection = Injection::new(campaign.id, iteration, position + 1, site, *point, gold_value);
            info!(
                "Iteration {iteration} injection {}: {location} bit {} ({:#x} -> {:#x}) at {:?}",
                injection.injection_number, injection.site.bit, gold_value, injection.injected_value, point
            );
            self.link.write_register(&location, injection.injected_value)?;
            self.store.insert_injection(&injection)?;
            result.num_injections += 1;

            let actual = self.link.read_register(&location)?;
            if actual != injection.injected_value {
                return Err(Error::Verification {
                    location: location.to_string(),
                    expected: injection.injected_value,
                    actual,
                });
            }
            self.link.commit_injection(&injection)?;
            injected.push((injection, location));
        }
        self.link.monitor_injections(&injected)
    }

    /// Waits for the DUT workload to return to the prompt.
    ///
    /// Returns an error only if it stops the worker.
    fn monitor(&mut self, observations: &mut Observations) -> Option<Error> {
        let timeout = self.config.execution_timeout;
        let buffer = self.link.dut().and_then(|dut| dut.read_until_prompt_within(timeout));
        match buffer {
            Ok(buffer) => {
                observations.detected_errors += detected_errors(&buffer).unwrap_or(0);
                None
            }
            Err(error) if error.is_fatal_for_worker() => Some(error),
            Err(error) => {
                debug!("DUT monitoring failed: {error}");
                observations.execution_failure = Some(error.outcome());
                None
            }
        }
    }

    /// Turns a failed link phase into an observation, or hands back an
    /// error that stops the worker.
    fn record_failure(&self, observations: &mut Observations, error: Error) -> Option<Error> {
        debug!("Iteration phase failed: {error}");
        match error {
            error if error.is_fatal_for_worker() => return Some(error),
            Error::Transfer(_) => observations.transfer_failure = Some(error.outcome()),
            error => {
                observations.link_failure = Some(Failure {
                    outcome: error.outcome(),
                    category: self.link.error_category(),
                })
            }
        }
        None
    }

    fn start_aux(&mut self) -> Option<AuxRun> {
        if !self.config.campaign.use_aux {
            return None;
        }
        let Some(mut aux) = self.link.take_aux() else {
            warn!("Campaign uses an AUX device but {} has none", self.link.describe());
            return None;
        };
        let command = self.config.campaign.aux_command.clone();
        let files = self.config.aux_files.clone();
        let timeout = self.config.execution_timeout;
        let cancel = self.cancel.clone();
        let handle = thread::spawn(move || {
            let result = aux
                .send_files(&files, &cancel)
                .and_then(|_| aux.write_line(&command))
                .and_then(|_| aux.read_until_prompt_within(timeout));
            (aux, result)
        });
        Some(AuxRun { handle })
    }

    /// Joins the AUX run and hands its device back to the link.
    fn join_aux(&mut self, run: AuxRun, observations: &mut Observations) -> String {
        match run.handle.join() {
            Ok((mut aux, result)) => {
                match result {
                    Ok(buffer) => observations.detected_errors += detected_errors(&buffer).unwrap_or(0),
                    Err(error) => {
                        if observations.execution_failure.is_none() {
                            observations.execution_failure = Some(format!("AUX {}", error.outcome()));
                        }
                    }
                }
                let output = aux.take_output();
                self.link.restore_aux(aux);
                output
            }
            Err(_) => {
                observations.execution_failure.get_or_insert_with(|| "AUX run panicked".to_string());
                String::new()
            }
        }
    }

    fn retrieve_output(&mut self, file: &str, local: &Path) -> Result<()> {
        if !self.config.campaign.use_aux_output {
            return self.link.get_file(file, local);
        }
        let mut aux = self
            .link
            .take_aux()
            .ok_or_else(|| Error::Transfer("no AUX device to retrieve output from".to_string()))?;
        let result = aux.get_file(file, local, &self.cancel);
        self.link.restore_aux(aux);
        result
    }

    /// Retrieves the output file and compares it with the gold output.
    fn check_output(&mut self, iteration: u64, file: &str) -> Result<f64> {
        let config = Arc::clone(&self.config);
        let directory = config.iteration_directory(iteration);
        std::fs::create_dir_all(&directory)?;
        let local = directory.join(file);
        let compared = self.retrieve_output(file, &local).and_then(|_| {
            let gold = std::fs::read(config.gold_output(file))?;
            let output = std::fs::read(&local)?;
            Ok(similarity(&gold, &output))
        });
        match compared {
            Ok(ratio) if ratio == 1.0 => {
                std::fs::remove_file(&local)?;
                let _ = std::fs::remove_dir(&directory);
                Ok(ratio)
            }
            Ok(ratio) => Ok(ratio),
            Err(error) => {
                let _ = std::fs::remove_dir(&directory);
                Err(error)
            }
        }
    }

    fn finish(
        &mut self,
        mut result: IterationResult,
        mut observations: Observations,
        aux_run: Option<AuxRun>,
        mut stop: Option<Error>,
    ) -> Result<IterationResult> {
        let iteration = result.iteration;
        if let Some(run) = aux_run {
            result.aux_output = self.join_aux(run, &mut observations);
        }
        if self.cancel.is_cancelled() {
            stop = Some(Error::Interrupted);
        }

        // A crashed workload may still have left output worth keeping
        let link_failed = observations.link_failure.is_some();
        let output_file = self.config.campaign.output_file.clone().filter(|_| stop.is_none() && !link_failed);
        if let Some(file) = output_file {
            match self.check_output(iteration, &file) {
                Ok(ratio) => observations.data_diff = Some(ratio),
                Err(Error::Interrupted) => stop = Some(Error::Interrupted),
                Err(error) => {
                    warn!("Iteration {iteration}: could not retrieve {file}: {error}");
                    observations.transfer_failure = Some(Error::Transfer(error.to_string()).outcome());
                }
            }
        }

        result.dut_output = self.link.dut().map(|dut| dut.take_output()).unwrap_or_default();
        if stop.is_none() && observations.link_failure.is_none() {
            match self.link.latent_faults() {
                Ok(latent_faults) => observations.latent_faults = latent_faults,
                Err(Error::Interrupted) => stop = Some(Error::Interrupted),
                Err(error) => {
                    warn!("Iteration {iteration}: latent fault comparison failed: {error}");
                    observations.link_failure = Some(Failure {
                        outcome: error.outcome(),
                        category: self.link.error_category(),
                    });
                }
            }
        }
        result.debugger_output = self.link.take_transcript();
        for event in self.link.take_events() {
            let LinkEvent::Recovery { reason } = event;
            result
                .debugger_output
                .push_str(&format!("\n[debugger recovery] {reason}\n"));
        }
        if let Err(error) = self.link.end_iteration() {
            warn!("Iteration {iteration}: teardown failed: {error}");
            if observations.link_failure.is_none() {
                observations.link_failure = Some(Failure {
                    outcome: error.outcome(),
                    category: self.link.error_category(),
                });
            }
        }

        result.detected_errors = observations.detected_errors;
        result.latent_faults = observations.latent_faults;
        result.data_diff = observations.data_diff.unwrap_or(-1.0);
        if let Some(error) = stop {
            return self.persist_incomplete(result, error);
        }

        let (outcome, category) = classify(&observations);
        result.outcome = outcome;
        result.outcome_category = category;
        self.store.insert_result(&result)?;
        print_outcome(&result);
        Ok(result)
    }

    /// Persists an iteration that stops the worker and returns the error.
    fn persist_incomplete(&mut self, mut result: IterationResult, error: Error) -> Result<IterationResult> {
        let directory = self.config.iteration_directory(result.iteration);
        if directory.exists() {
            if let Err(e) = std::fs::remove_dir_all(&directory) {
                warn!("Could not remove {}: {}", directory.display(), e);
            }
        }
        result.outcome = error.outcome();
        result.outcome_category = OutcomeCategory::Incomplete;
        self.store.insert_result(&result)?;
        print_outcome(&result);
        Err(error)
    }
}

fn print_outcome(result: &IterationResult) {
    let line = format!(
        "Iteration {}: {} ({})",
        result.iteration, result.outcome, result.outcome_category
    );
    match result.outcome_category {
        OutcomeCategory::NoError => println!("{}", line.green()),
        OutcomeCategory::DataError => println!("{}", line.yellow()),
        OutcomeCategory::Incomplete => println!("{}", line.dimmed()),
        _ => println!("{}", line.red()),
    }
}
