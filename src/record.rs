use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

use crate::targets::InjectionSite;

/// Category stored next to every outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OutcomeCategory {
    #[serde(rename = "No error")]
    NoError,
    #[serde(rename = "Data error")]
    DataError,
    #[serde(rename = "Execution error")]
    ExecutionError,
    #[serde(rename = "Debugger error")]
    DebuggerError,
    #[serde(rename = "Simics error")]
    SimicsError,
    #[serde(rename = "SCP error")]
    ScpError,
    #[serde(rename = "Incomplete")]
    Incomplete,
}

impl fmt::Display for OutcomeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            OutcomeCategory::NoError => "No error",
            OutcomeCategory::DataError => "Data error",
            OutcomeCategory::ExecutionError => "Execution error",
            OutcomeCategory::DebuggerError => "Debugger error",
            OutcomeCategory::SimicsError => "Simics error",
            OutcomeCategory::ScpError => "SCP error",
            OutcomeCategory::Incomplete => "Incomplete",
        };
        f.write_str(text)
    }
}

/// When an injection is applied during the run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum InjectionPoint {
    /// Simulator: gold checkpoint to start from.
    Checkpoint(usize),
    /// Physical device: offset from workload start.
    Time(Duration),
}

/// One applied bit flip. Never changed after it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Injection {
    pub campaign_id: u64,
    pub iteration: u64,
    /// Sequence number inside the iteration, starting at 1.
    pub injection_number: usize,
    #[serde(flatten)]
    pub site: InjectionSite,
    pub point: InjectionPoint,
    pub gold_value: u64,
    pub injected_value: u64,
    pub timestamp: SystemTime,
}

impl Injection {
    pub fn new(
        campaign_id: u64,
        iteration: u64,
        injection_number: usize,
        site: InjectionSite,
        point: InjectionPoint,
        gold_value: u64,
    ) -> Self {
        let injected_value = gold_value ^ (1u64 << site.bit);
        Self {
            campaign_id,
            iteration,
            injection_number,
            site,
            point,
            gold_value,
            injected_value,
            timestamp: SystemTime::now(),
        }
    }
}

/// Outcome of one iteration. Filled in while the iteration runs and
/// persisted exactly once at its end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    pub campaign_id: u64,
    pub iteration: u64,
    pub outcome: String,
    pub outcome_category: OutcomeCategory,
    /// `-1.0` when not computed.
    pub data_diff: f64,
    pub detected_errors: u32,
    pub latent_faults: usize,
    pub num_injections: usize,
    pub dut_output: String,
    pub aux_output: String,
    pub debugger_output: String,
    pub timestamp: SystemTime,
}

impl IterationResult {
    pub fn new(campaign_id: u64, iteration: u64) -> Self {
        Self {
            campaign_id,
            iteration,
            outcome: String::new(),
            outcome_category: OutcomeCategory::Incomplete,
            data_diff: -1.0,
            detected_errors: 0,
            latent_faults: 0,
            num_injections: 0,
            dut_output: String::new(),
            aux_output: String::new(),
            debugger_output: String::new(),
            timestamp: SystemTime::now(),
        }
    }
}

/// Static per-run campaign description written to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: u64,
    pub architecture: String,
    pub simulator: bool,
    pub use_aux: bool,
    pub command: String,
    pub aux_command: String,
    pub output_file: Option<String>,
    pub use_aux_output: bool,
    pub exec_time: Duration,
    pub num_checkpoints: usize,
    pub cycles_between: u64,
    pub timestamp: SystemTime,
}

/// A failure observed at a given phase of the iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub outcome: String,
    pub category: OutcomeCategory,
}

/// Everything the classifier looks at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observations {
    pub link_failure: Option<Failure>,
    pub execution_failure: Option<String>,
    pub transfer_failure: Option<String>,
    pub detected_errors: u32,
    /// `None` when no output comparison took place.
    pub data_diff: Option<f64>,
    pub latent_faults: usize,
}

/// Maps the observations of an iteration to (outcome, category).
///
/// Priority: debugger/link error, execution error, transfer error,
/// detected data error, silent data error, latent faults, no error.
pub fn classify(observations: &Observations) -> (String, OutcomeCategory) {
    if let Some(failure) = &observations.link_failure {
        return (failure.outcome.clone(), failure.category);
    }
    if let Some(outcome) = &observations.execution_failure {
        return (outcome.clone(), OutcomeCategory::ExecutionError);
    }
    if let Some(outcome) = &observations.transfer_failure {
        return (outcome.clone(), OutcomeCategory::ScpError);
    }
    if observations.detected_errors > 0 {
        return ("Detected data error".to_string(), OutcomeCategory::DataError);
    }
    if matches!(observations.data_diff, Some(diff) if diff < 1.0) {
        return ("Silent data error".to_string(), OutcomeCategory::DataError);
    }
    if observations.latent_faults > 0 {
        return ("Latent faults".to_string(), OutcomeCategory::NoError);
    }
    ("No error".to_string(), OutcomeCategory::NoError)
}
