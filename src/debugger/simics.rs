use itertools::Itertools;
use log::{debug, info, warn};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use super::command::CommandSession;
use super::console::Console;
use super::device::{Device, DeviceConfig};
use super::{not_connected, DebuggerLink, IterationContext, LinkEvent, LinkState};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::record::{Injection, InjectionPoint, OutcomeCategory};
use crate::targets::{Access, RegisterLocation};

const PROMPT: &str = "simics> ";
const ERROR_MESSAGES: [&str; 1] = ["Error"];
const PSEUDO_DEVICE: &str = "pseudo device opened: ";
const SERIAL_BAUD_RATE: u32 = 38400;

#[derive(Debug, Clone, Deserialize)]
pub struct SimicsConfig {
    pub simics_path: PathBuf,
    pub workspace: PathBuf,
    pub num_checkpoints: usize,
    pub cycles_between: u64,
    /// Processor object prefix, indexed by core.
    #[serde(default = "SimicsConfig::default_processor")]
    pub processor: String,
}

impl SimicsConfig {
    fn default_processor() -> String {
        "DUT_p2020rdb.soc.cpu".to_string()
    }
}

/// Workspace-relative path of a gold checkpoint.
pub fn gold_checkpoint(campaign_id: u64, checkpoint: usize) -> PathBuf {
    PathBuf::from(format!("gold-checkpoints/{campaign_id}/checkpoint-{checkpoint}.ckpt"))
}

/// Workspace-relative directory holding one iteration's injected checkpoints.
pub fn injected_directory(campaign_id: u64, iteration: u64) -> PathBuf {
    PathBuf::from(format!("injected-checkpoints/{campaign_id}/{iteration}"))
}

/// Pseudo terminals announced in a boot transcript, in order.
fn pseudo_terminals(buffer: &str) -> Vec<String> {
    buffer
        .lines()
        .filter_map(|line| line.split_once(PSEUDO_DEVICE))
        .map(|(_, pty)| pty.trim().to_string())
        .collect()
}

/// Value printed by `read-reg`, `get` or a python expression.
fn parse_simics_value(buffer: &str) -> Option<u64> {
    let line = buffer
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains(PROMPT.trim()))
        .last()?;
    let token = line.split_whitespace().last()?;
    let token = token.trim_matches(|c: char| c == '\'' || c == '"').trim_end_matches('L').replace('_', "");
    match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => token.parse().ok(),
    }
}

pub struct SimicsLink {
    config: SimicsConfig,
    dut_config: DeviceConfig,
    aux_config: Option<DeviceConfig>,
    timeout: Duration,
    run_timeout: Duration,
    process: Option<Child>,
    session: Option<CommandSession>,
    dut: Option<Device>,
    aux: Option<Device>,
    state: LinkState,
    campaign_id: u64,
    iteration: Option<u64>,
    /// Checkpoint the simulation currently stands at.
    checkpoint: Option<usize>,
    core: usize,
    /// Faulty state read at the end of the monitored window.
    snapshot: Option<Snapshot>,
    transcript: String,
    cancel: CancelToken,
}

/// Register values read at one checkpoint.
#[derive(Debug)]
struct Snapshot {
    checkpoint: usize,
    locations: Vec<(usize, RegisterLocation)>,
    values: Vec<u64>,
}

impl SimicsLink {
    pub fn new(
        config: SimicsConfig,
        dut_config: DeviceConfig,
        aux_config: Option<DeviceConfig>,
        timeout: Duration,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            dut_config,
            aux_config,
            timeout,
            run_timeout: timeout,
            process: None,
            session: None,
            dut: None,
            aux: None,
            state: LinkState::Disconnected,
            campaign_id: 0,
            iteration: None,
            checkpoint: None,
            core: 0,
            snapshot: None,
            transcript: String::new(),
            cancel,
        }
    }

    /// Bound for `run-cycles` and other commands that advance simulated time.
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    fn session(&mut self) -> Result<&mut CommandSession> {
        self.session.as_mut().ok_or_else(|| not_connected("simics"))
    }

    fn command(&mut self, text: &str, label: &str) -> Result<String> {
        self.session()?.command(text, &[] as &[&str], label)
    }

    fn run_command(&mut self, text: &str, label: &str) -> Result<String> {
        let run_timeout = self.run_timeout;
        let session = self.session()?;
        let previous = session.console().timeout();
        session.console().set_timeout(run_timeout);
        let result = session.command(text, &[] as &[&str], label);
        session.console().set_timeout(previous);
        result
    }

    /// Starts a simulator from `checkpoint` and attaches the serial consoles.
    fn launch(&mut self, checkpoint: &Path) -> Result<()> {
        let mut child = Command::new(&self.config.simics_path)
            .args(["-no-win", "-no-gui", "-q"])
            .current_dir(&self.config.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::LinkUnavailable(format!("{}: {}", self.config.simics_path.display(), e)))?;
        let pipes = child.stdout.take().zip(child.stdin.take());
        self.process = Some(child);
        let (stdout, stdin) = pipes.ok_or_else(|| Error::LinkUnavailable("simics pipes unavailable".to_string()))?;
        let console = Console::spawn("simics", stdout, stdin, self.timeout, self.cancel.clone());
        let mut session = CommandSession::new(console, &[PROMPT], &ERROR_MESSAGES, "\n")?;
        session.wait_for_prompt("Error launching simics")?;
        self.session = Some(session);

        let buffer = self.run_command(
            &format!("read-configuration {}", checkpoint.display()),
            "Error launching simics",
        )?;
        self.command("output-radix 16", "Error launching simics")?;
        let ptys = pseudo_terminals(&buffer);
        let dut_pty = ptys
            .first()
            .ok_or_else(|| Error::protocol("Error launching simics", "could not find pseudoterminal to attach to"))?;
        let dut_config = DeviceConfig {
            baud_rate: SERIAL_BAUD_RATE,
            ..self.dut_config.clone()
        };
        self.dut = Some(Device::open("dut", dut_config, Some(dut_pty.as_str()), self.timeout, self.cancel.clone())?);
        if let Some(aux_config) = self.aux_config.clone() {
            let aux_pty = ptys
                .get(1)
                .ok_or_else(|| Error::protocol("Error launching simics", "no pseudoterminal for the AUX device"))?;
            let aux_config = DeviceConfig {
                baud_rate: SERIAL_BAUD_RATE,
                ..aux_config
            };
            self.aux = Some(Device::open("aux", aux_config, Some(aux_pty.as_str()), self.timeout, self.cancel.clone())?);
        }
        info!("Launched simics from {}", checkpoint.display());
        self.state = LinkState::Halted;
        Ok(())
    }

    /// Quits the simulator and drops its consoles.
    fn shutdown(&mut self) {
        if self.state == LinkState::Running {
            if let Err(e) = self.halt() {
                debug!("halt before quit failed: {e}");
            }
        }
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.send("quit") {
                warn!("Could not send quit to simics: {e}");
            }
            self.transcript.push_str(&session.close());
        }
        if let Some(mut child) = self.process.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        for mut device in [self.dut.take(), self.aux.take()].into_iter().flatten() {
            device.close();
        }
        self.checkpoint = None;
        self.state = LinkState::Connected;
    }

    fn injected_checkpoint(&self, checkpoint: usize) -> Result<PathBuf> {
        let iteration = self
            .iteration
            .ok_or_else(|| Error::Config("no iteration in progress".to_string()))?;
        Ok(injected_directory(self.campaign_id, iteration).join(format!("checkpoint-{checkpoint}.ckpt")))
    }

    fn processor(&self) -> String {
        format!("{}[{}]", self.config.processor, self.core)
    }

    fn register_command(&self, location: &RegisterLocation, value: Option<u64>) -> String {
        let attribute = || {
            let indices: String = location.register_index.iter().map(|index| format!("[{index}]")).collect();
            (format!("conf.{}.{}", self.processor(), location.target.to_lowercase()), indices)
        };
        match (location.access, value) {
            (Access::Named | Access::Spr(_) | Access::Pmr(_), None) => format!("read-reg {}", location.wire_name()),
            (Access::Named | Access::Spr(_) | Access::Pmr(_), Some(value)) => {
                format!("write-reg {} {value:#x}", location.wire_name())
            }
            (Access::Memory { address, bits }, None) => format!("get {address:#x} {}", bits / 8),
            (Access::Memory { address, bits }, Some(value)) => format!("set {address:#x} {value:#x} {}", bits / 8),
            (Access::TlbEntry | Access::CacheEntry, None) => {
                let (object, indices) = attribute();
                format!("@hex({object}{indices})")
            }
            (Access::TlbEntry | Access::CacheEntry, Some(value)) => {
                let (object, indices) = attribute();
                format!("@entries = {object}; entries{indices} = {value:#x}; {object} = entries")
            }
        }
    }

    /// Reads every location on its core, in order.
    fn read_locations(&mut self, locations: &[(usize, RegisterLocation)]) -> Result<Vec<u64>> {
        locations
            .iter()
            .map(|(core, location)| {
                self.select_context(*core)?;
                self.read_register(location)
            })
            .collect()
    }
}

/// Distinct (core, location) pairs written during an iteration.
fn touched_locations(injected: &[(Injection, RegisterLocation)]) -> Vec<(usize, RegisterLocation)> {
    injected
        .iter()
        .map(|(injection, location)| (injection.site.core, location.clone()))
        .unique()
        .collect()
}

/// Total number of bits that differ between two register snapshots.
fn differing_bits(gold: &[u64], faulty: &[u64]) -> usize {
    gold.iter()
        .zip(faulty)
        .map(|(gold, faulty)| (gold ^ faulty).count_ones() as usize)
        .sum()
}

impl DebuggerLink for SimicsLink {
    fn describe(&self) -> String {
        format!("simics in {}", self.config.workspace.display())
    }

    fn state(&self) -> LinkState {
        self.state
    }

    fn error_category(&self) -> OutcomeCategory {
        OutcomeCategory::SimicsError
    }

    fn connect(&mut self) -> Result<()> {
        if !self.config.simics_path.exists() {
            return Err(Error::LinkUnavailable(format!(
                "simics not found at {}",
                self.config.simics_path.display()
            )));
        }
        self.state = LinkState::Connected;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.shutdown();
        Ok(())
    }

    fn halt(&mut self) -> Result<()> {
        let pid = self
            .process
            .as_ref()
            .map(Child::id)
            .ok_or_else(|| not_connected("simics"))?;
        // SAFETY: plain signal delivery to our own child process.
        if unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        self.session()?.wait_for_prompt("Error halting DUT")?;
        self.state = LinkState::Halted;
        Ok(())
    }

    fn continue_execution(&mut self) -> Result<()> {
        self.session()?.send("run")?;
        self.state = LinkState::Running;
        Ok(())
    }

    fn select_context(&mut self, core: usize) -> Result<()> {
        self.core = core;
        let processor = self.processor();
        self.command(&format!("pselect {processor}"), "Error selecting core")?;
        Ok(())
    }

    fn read_register(&mut self, location: &RegisterLocation) -> Result<u64> {
        let command = self.register_command(location, None);
        let buffer = self.command(&command, "Error getting register value")?;
        parse_simics_value(&buffer)
            .ok_or_else(|| Error::protocol("Error getting register value", format!("no value for {location}")))
    }

    fn write_register(&mut self, location: &RegisterLocation, value: u64) -> Result<()> {
        let command = self.register_command(location, Some(value));
        self.command(&command, "Error setting register value")?;
        Ok(())
    }

    fn dut(&mut self) -> Result<&mut Device> {
        self.dut.as_mut().ok_or_else(|| not_connected("simics dut"))
    }

    fn take_aux(&mut self) -> Option<Device> {
        self.aux.take()
    }

    fn restore_aux(&mut self, aux: Device) {
        self.aux = Some(aux);
    }

    fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn begin_iteration(&mut self, context: &IterationContext) -> Result<()> {
        self.shutdown();
        self.snapshot = None;
        self.campaign_id = context.campaign_id;
        self.iteration = Some(context.iteration);
        Ok(())
    }

    fn advance_to(&mut self, point: &InjectionPoint) -> Result<()> {
        let InjectionPoint::Checkpoint(target) = *point else {
            return Err(Error::Config("simulator injections are scheduled by checkpoint".to_string()));
        };
        match self.checkpoint {
            None => self.launch(&gold_checkpoint(self.campaign_id, target))?,
            Some(current) if target > current => {
                let cycles = (target - current) as u64 * self.config.cycles_between;
                self.run_command(&format!("run-cycles {cycles}"), "Error advancing simulation")?;
            }
            Some(current) => {
                return Err(Error::Config(format!(
                    "checkpoint {target} requested after checkpoint {current}"
                )))
            }
        }
        self.checkpoint = Some(target);
        Ok(())
    }

    fn commit_injection(&mut self, injection: &Injection) -> Result<()> {
        let InjectionPoint::Checkpoint(checkpoint) = injection.point else {
            return Ok(());
        };
        let path = self.injected_checkpoint(checkpoint)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(self.config.workspace.join(parent))?;
        }
        self.run_command(
            &format!("write-configuration {}", path.display()),
            "Error creating injected checkpoint",
        )?;
        Ok(())
    }

    fn monitor_injections(&mut self, injected: &[(Injection, RegisterLocation)]) -> Result<()> {
        let Some(mut last) = self.checkpoint else {
            return Ok(());
        };
        let monitored = self.injected_checkpoint(last)?.with_file_name("monitored");
        std::fs::create_dir_all(self.config.workspace.join(&monitored))?;
        for checkpoint in last + 1..self.config.num_checkpoints {
            self.cancel.check()?;
            self.run_command(
                &format!("run-cycles {}", self.config.cycles_between),
                "Error monitoring simulation",
            )?;
            let path = monitored.join(format!("checkpoint-{checkpoint}.ckpt"));
            self.run_command(
                &format!("write-configuration {}", path.display()),
                "Error monitoring simulation",
            )?;
            self.checkpoint = Some(checkpoint);
            last = checkpoint;
        }

        let locations = touched_locations(injected);
        let values = self.read_locations(&locations)?;
        self.snapshot = Some(Snapshot {
            checkpoint: last,
            locations,
            values,
        });
        Ok(())
    }

    fn latent_faults(&mut self) -> Result<usize> {
        let Some(snapshot) = self.snapshot.take() else {
            return Ok(0);
        };
        self.shutdown();
        self.launch(&gold_checkpoint(self.campaign_id, snapshot.checkpoint))?;
        self.checkpoint = Some(snapshot.checkpoint);
        let gold = self.read_locations(&snapshot.locations)?;
        let latent = differing_bits(&gold, &snapshot.values);
        debug!(
            "{latent} bit(s) differ from gold checkpoint {} over {} register(s)",
            snapshot.checkpoint,
            snapshot.locations.len()
        );
        Ok(latent)
    }

    fn begin_supervision(&mut self, context: &IterationContext) -> Result<()> {
        self.begin_iteration(context)?;
        self.launch(&gold_checkpoint(context.campaign_id, 0))?;
        self.checkpoint = Some(0);
        Ok(())
    }

    fn end_iteration(&mut self) -> Result<()> {
        self.shutdown();
        if let Some(iteration) = self.iteration.take() {
            let directory = self.config.workspace.join(injected_directory(self.campaign_id, iteration));
            if directory.exists() {
                if let Err(e) = std::fs::remove_dir_all(&directory) {
                    warn!("Could not remove {}: {}", directory.display(), e);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let result = self.end_iteration();
        self.state = LinkState::Disconnected;
        result
    }

    fn take_transcript(&mut self) -> String {
        let mut transcript = std::mem::take(&mut self.transcript);
        if let Some(session) = self.session.as_mut() {
            transcript.push_str(&session.take_transcript());
        }
        transcript
    }

    fn take_events(&mut self) -> Vec<LinkEvent> {
        Vec::new()
    }
}
