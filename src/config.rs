use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::cancel::CancelToken;
use crate::debugger::{
    BdiLink, BdiProfile, DebuggerLink, Device, DeviceConfig, SimicsConfig, SimicsLink, TelnetConnector,
};
use crate::error::{Error, Result};
use crate::fault_injector::InjectorConfig;
use crate::record::Campaign;
use crate::scheduler::effective_concurrency;
use crate::targets::{Catalog, InjectionSelector};

/// One BDI3000 debugger and the serial ports of the board it is wired to.
#[derive(Debug, Clone, Deserialize)]
pub struct DebuggerConfig {
    pub address: String,
    #[serde(default = "DebuggerConfig::default_port")]
    pub port: u16,
    #[serde(default)]
    pub dut_serial_port: Option<String>,
    #[serde(default)]
    pub aux_serial_port: Option<String>,
}

impl DebuggerConfig {
    fn default_port() -> u16 {
        23
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Fleet of physical boards, one worker per board.
    Jtag { debuggers: Vec<DebuggerConfig> },
    Simics(SimicsConfig),
}

impl BackendConfig {
    /// Name used for catalog overlays.
    pub fn name(&self) -> &'static str {
        match self {
            BackendConfig::Jtag { .. } => "jtag",
            BackendConfig::Simics(_) => "simics",
        }
    }

    pub fn is_simulator(&self) -> bool {
        matches!(self, BackendConfig::Simics(_))
    }
}

/// Campaign configuration loaded from a JSON5 file
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub campaign_id: u64,
    pub architecture: String,
    pub backend: BackendConfig,
    pub command: String,
    #[serde(default)]
    pub aux_command: String,
    #[serde(default)]
    pub use_aux: bool,
    #[serde(default)]
    pub output_file: Option<String>,
    #[serde(default)]
    pub use_aux_output: bool,
    #[serde(default)]
    pub exec_time_secs: f64,
    #[serde(default = "Config::default_num_injections")]
    pub num_injections: usize,
    #[serde(default)]
    pub selected_targets: Option<Vec<String>>,
    #[serde(default)]
    pub selected_registers: Option<Vec<String>>,
    #[serde(default)]
    pub selected_target_indices: Option<Vec<usize>>,
    #[serde(default)]
    pub dut: DeviceConfig,
    #[serde(default)]
    pub aux: DeviceConfig,
    #[serde(default)]
    pub dut_files: Vec<PathBuf>,
    #[serde(default)]
    pub aux_files: Vec<PathBuf>,
    #[serde(default = "Config::default_debugger_timeout")]
    pub debugger_timeout_secs: f64,
    #[serde(default = "Config::default_execution_timeout")]
    pub execution_timeout_secs: f64,
    #[serde(default = "Config::default_catalog_dir")]
    pub catalog_dir: PathBuf,
    #[serde(default = "Config::default_results_path")]
    pub results_path: PathBuf,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "Config::default_iterations")]
    pub iterations: u64,
    #[serde(default = "Config::default_start_iteration")]
    pub start_iteration: u64,
    #[serde(default = "Config::default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub supervise: bool,
}

impl Config {
    // Keep defaults in sync with CLI help
    fn default_num_injections() -> usize {
        1
    }

    fn default_debugger_timeout() -> f64 {
        30.0
    }

    fn default_execution_timeout() -> f64 {
        300.0
    }

    fn default_catalog_dir() -> PathBuf {
        PathBuf::from("targets")
    }

    fn default_results_path() -> PathBuf {
        PathBuf::from("campaign-data")
    }

    fn default_iterations() -> u64 {
        1
    }

    fn default_start_iteration() -> u64 {
        1
    }

    fn default_concurrency() -> usize {
        1
    }

    /// Load configuration from JSON5 file
    pub fn from_file(path: &PathBuf) -> std::result::Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("Failed to read config file: {}", e))?;

        Self::from_json5(&content)
    }

    pub fn from_json5(content: &str) -> std::result::Result<Self, String> {
        json5::from_str(content).map_err(|e| format!("Failed to parse JSON5 config: {}", e))
    }

    /// Override config values with command line arguments
    pub fn override_with_args(&mut self, args: &Args) {
        if let Some(iterations) = args.iterations {
            self.iterations = iterations;
        }
        if let Some(start_iteration) = args.start_iteration {
            self.start_iteration = start_iteration;
        }
        if let Some(concurrency) = args.concurrency {
            self.concurrency = concurrency;
        }
        if let Some(num_injections) = args.num_injections {
            self.num_injections = num_injections;
        }
        if args.seed.is_some() {
            self.seed = args.seed;
        }
        if let Some(results_path) = &args.results_path {
            self.results_path = results_path.clone();
        }
        if !args.targets.is_empty() {
            self.selected_targets = Some(args.targets.clone());
        }
        if !args.registers.is_empty() {
            self.selected_registers = Some(args.registers.clone());
        }
        // Only override boolean flags if they're true (explicitly set by user)
        if args.supervise {
            self.supervise = true;
        }
    }

    fn seconds(value: f64, name: &str) -> Result<Duration> {
        Duration::try_from_secs_f64(value).map_err(|e| Error::Config(format!("{name}: {e}")))
    }

    pub fn campaign(&self) -> Result<Campaign> {
        let (num_checkpoints, cycles_between) = match &self.backend {
            BackendConfig::Simics(simics) => (simics.num_checkpoints, simics.cycles_between),
            BackendConfig::Jtag { .. } => (0, 0),
        };
        Ok(Campaign {
            id: self.campaign_id,
            architecture: self.architecture.clone(),
            simulator: self.backend.is_simulator(),
            use_aux: self.use_aux,
            command: self.command.clone(),
            aux_command: self.aux_command.clone(),
            output_file: self.output_file.clone(),
            use_aux_output: self.use_aux_output,
            exec_time: Self::seconds(self.exec_time_secs, "exec_time_secs")?,
            num_checkpoints,
            cycles_between,
            timestamp: SystemTime::now(),
        })
    }

    pub fn injector_config(&self) -> Result<InjectorConfig> {
        Ok(InjectorConfig {
            campaign: self.campaign()?,
            num_injections: self.num_injections,
            dut_files: self.dut_files.clone(),
            aux_files: self.aux_files.clone(),
            results_dir: self.results_path.clone(),
            execution_timeout: Self::seconds(self.execution_timeout_secs, "execution_timeout_secs")?,
        })
    }

    /// Loads the catalog for the architecture and applies the allow-lists.
    pub fn catalog(&self) -> Result<Catalog> {
        Catalog::load(&self.catalog_dir, &self.architecture, self.backend.name())?
            .restrict(self.selected_targets.as_deref(), self.selected_registers.as_deref())
    }

    pub fn workers(&self) -> usize {
        let fleet_size = match &self.backend {
            BackendConfig::Jtag { debuggers } => debuggers.len(),
            BackendConfig::Simics(_) => 0,
        };
        effective_concurrency(self.concurrency, self.backend.is_simulator(), fleet_size)
    }

    /// Selector of one worker, derived from the campaign seed if there is one.
    pub fn selector(&self, worker: usize) -> InjectionSelector {
        let selector = match self.seed {
            Some(seed) => InjectionSelector::seeded(seed.wrapping_add(worker as u64)),
            None => InjectionSelector::from_entropy(),
        };
        selector.with_target_indices(self.selected_target_indices.clone())
    }

    /// Builds the debugger link owned by `worker`.
    pub fn link(&self, worker: usize, cancel: &CancelToken) -> Result<Box<dyn DebuggerLink>> {
        let timeout = Self::seconds(self.debugger_timeout_secs, "debugger_timeout_secs")?;
        match &self.backend {
            BackendConfig::Jtag { debuggers } => {
                let debugger = debuggers
                    .get(worker)
                    .ok_or_else(|| Error::Config(format!("no debugger configured for worker {worker}")))?;
                let connector = TelnetConnector::new(&debugger.address, debugger.port, timeout, cancel.clone());
                let dut = Device::open(
                    "dut",
                    self.dut.clone(),
                    debugger.dut_serial_port.as_deref(),
                    timeout,
                    cancel.clone(),
                )?;
                let aux = match self.use_aux {
                    true => Some(Device::open(
                        "aux",
                        self.aux.clone(),
                        debugger.aux_serial_port.as_deref(),
                        timeout,
                        cancel.clone(),
                    )?),
                    false => None,
                };
                let profile = BdiProfile::for_architecture(&self.architecture)?;
                Ok(Box::new(BdiLink::new(Box::new(connector), profile, dut, aux, cancel.clone())))
            }
            BackendConfig::Simics(simics) => {
                let aux = self.use_aux.then(|| self.aux.clone());
                let execution_timeout = Self::seconds(self.execution_timeout_secs, "execution_timeout_secs")?;
                let link = SimicsLink::new(simics.clone(), self.dut.clone(), aux, timeout, cancel.clone())
                    .with_run_timeout(execution_timeout);
                Ok(Box::new(link))
            }
        }
    }

    pub fn shared_injector_config(&self) -> Result<Arc<InjectorConfig>> {
        self.injector_config().map(Arc::new)
    }
}

/// Command-line arguments of the fault injector.
///
/// The campaign itself is described by the JSON5 file given with
/// `--config`; the options below override single entries of it.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Load campaign configuration from JSON5 file
    #[arg(short = 'c', long)]
    pub config: PathBuf,

    /// Number of iterations to run
    #[arg(short = 'n', long)]
    pub iterations: Option<u64>,

    /// Number of the first iteration
    #[arg(long)]
    pub start_iteration: Option<u64>,

    /// Number of workers started in parallel
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Injections per iteration
    #[arg(short = 'i', long)]
    pub num_injections: Option<usize>,

    /// Seed for reproducible injection selection
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Directory for result records and output files
    #[arg(short, long)]
    pub results_path: Option<PathBuf>,

    /// Restrict injections to these targets
    ///   E.g.: --targets GPR,SPR
    #[arg(long, value_delimiter = ',', verbatim_doc_comment)]
    pub targets: Vec<String>,

    /// Restrict injections to these registers
    #[arg(long, value_delimiter = ',')]
    pub registers: Vec<String>,

    /// Run the workload without injections
    #[arg(long, default_value_t = false)]
    pub supervise: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const JTAG: &str = r#"{
        // P2020 fleet
        campaign_id: 3,
        architecture: "p2020",
        backend: {
            type: "jtag",
            debuggers: [
                {address: "10.42.0.50", dut_serial_port: "/dev/ttyUSB0"},
                {address: "10.42.0.51", port: 2023, dut_serial_port: "/dev/ttyUSB1"},
            ],
        },
        command: "./ppc_fi_2d_conv_fft_omp",
        output_file: "sobel.bmp",
        exec_time_secs: 1.5,
        dut: {prompt: "root@p2020rdb:~#", ip_address: "10.42.0.21"},
        seed: 7,
    }"#;

    const SIMICS: &str = r#"{
        campaign_id: 4,
        architecture: "p2020",
        backend: {type: "simics", simics_path: "simics-workspace/simics", workspace: "simics-workspace",
                  num_checkpoints: 50, cycles_between: 2000000},
        command: "./app",
        concurrency: 8,
    }"#;

    #[test]
    fn jtag_fleet_config() {
        let config = Config::from_json5(JTAG).unwrap();
        let BackendConfig::Jtag { debuggers } = &config.backend else {
            panic!("expected jtag backend");
        };
        assert_eq!(debuggers[0].port, 23);
        assert_eq!(debuggers[1].port, 2023);
        assert_eq!(config.num_injections, 1);
        assert_eq!(config.dut.baud_rate, 115200);

        let campaign = config.campaign().unwrap();
        assert!(!campaign.simulator);
        assert_eq!(campaign.exec_time, Duration::from_millis(1500));
    }

    #[test]
    fn fleet_bounds_workers() {
        let mut config = Config::from_json5(JTAG).unwrap();
        config.concurrency = 8;
        assert_eq!(config.workers(), 2);
        let config = Config::from_json5(SIMICS).unwrap();
        assert_eq!(config.workers(), 8);
        assert_eq!(config.backend.name(), "simics");
        assert_eq!(config.campaign().unwrap().num_checkpoints, 50);
    }

    #[test]
    fn command_line_overrides() {
        let mut config = Config::from_json5(SIMICS).unwrap();
        let args = Args::parse_from(["seu_injector", "-c", "campaign.json5", "-n", "20", "--targets", "GPR,TLB1"]);
        config.override_with_args(&args);
        assert_eq!(config.iterations, 20);
        assert_eq!(config.concurrency, 8);
        assert_eq!(
            config.selected_targets,
            Some(vec!["GPR".to_string(), "TLB1".to_string()])
        );
        assert!(!config.supervise);
    }

    #[test]
    fn seeded_workers_draw_different_sequences() {
        let config = Config::from_json5(JTAG).unwrap();
        let mut first = config.selector(0);
        let mut again = config.selector(0);
        let mut second = config.selector(1);
        use rand::RngCore;
        let a = first.rng().next_u64();
        assert_eq!(a, again.rng().next_u64());
        assert_ne!(a, second.rng().next_u64());
    }
}
