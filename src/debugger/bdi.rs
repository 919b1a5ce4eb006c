//! BDI3000 JTAG debugger reached over telnet.
//!
//! The BDI halts and resumes the physical board, reads and writes its
//! registers and resets it before every iteration. The workload itself runs
//! on the board's serial console ([`Device`]).

use log::{info, warn};
use std::time::Duration;

use super::command::{parse_value, CommandSession};
use super::console::Console;
use super::device::Device;
use super::{not_connected, DebuggerLink, IterationContext, LinkEvent, LinkState};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::record::{InjectionPoint, OutcomeCategory};
use crate::targets::{Access, RegisterLocation};

const LINE_ENDING: &str = "\r\n";

/// Opens the transport to the debugger.
pub trait Connector: Send {
    fn connect(&mut self) -> Result<Console>;

    fn describe(&self) -> String;
}

pub struct TelnetConnector {
    address: String,
    port: u16,
    timeout: Duration,
    cancel: CancelToken,
}

impl TelnetConnector {
    pub fn new(address: &str, port: u16, timeout: Duration, cancel: CancelToken) -> Self {
        Self {
            address: address.to_string(),
            port,
            timeout,
            cancel,
        }
    }
}

impl Connector for TelnetConnector {
    fn connect(&mut self) -> Result<Console> {
        Console::tcp("debugger", &self.address, self.port, self.timeout, self.cancel.clone())
    }

    fn describe(&self) -> String {
        format!("BDI3000 at {} port {}", self.address, self.port)
    }
}

/// Command set and expected responses of one board/debugger combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BdiProfile {
    pub prompts: Vec<String>,
    pub error_messages: Vec<String>,
    /// Regular expressions, matched in order.
    pub reset_sequence: Vec<String>,
    pub halt_command: String,
    pub halt_expected: Vec<String>,
    pub continue_command: String,
    pub select_expected: Vec<String>,
}

fn strings(list: &[&str]) -> Vec<String> {
    list.iter().map(|item| item.to_string()).collect()
}

impl BdiProfile {
    pub fn p2020() -> Self {
        Self {
            prompts: strings(&["P2020>"]),
            error_messages: strings(&[
                "syntax error in command",
                "timeout while waiting for halt",
                "wrong state for requested command",
                "read access failed",
            ]),
            reset_sequence: strings(&[
                r"- TARGET: processing user reset request",
                r"- BDI asserts HRESET",
                r"- Reset JTAG controller passed",
                r"- JTAG exists check passed",
                r"- BDI removes HRESET",
                r"- TARGET: resetting target passed",
                r"- TARGET: processing target startup \.\.\.\.",
                r"- TARGET: processing target startup passed",
            ]),
            halt_command: "halt 0 1".to_string(),
            halt_expected: strings(&[
                "- TARGET: core #0 has entered debug mode",
                "- TARGET: core #1 has entered debug mode",
            ]),
            continue_command: "go 0 1".to_string(),
            select_expected: strings(&["Target CPU", "Core state"]),
        }
    }

    /// Dual Cortex-A9 (ZedBoard).
    pub fn a9() -> Self {
        Self {
            prompts: strings(&["A9#0>", "A9#1>"]),
            error_messages: strings(&[
                "syntax error in command",
                "timeout while waiting for halt",
                "wrong state for requested command",
                "read access failed",
            ]),
            reset_sequence: strings(&[
                r"- TARGET: processing reset request",
                r"- TARGET: BDI removes TRST",
                r"- TARGET: Bypass check",
                r"- TARGET: JTAG exists check passed",
                r"- Core#0: ID code",
                r"- Core#0: DP-CSW",
                r"- Core#0: DBG-AP",
                r"- Core#0: DIDR",
                r"- Core#1: ID code",
                r"- Core#1: DP-CSW",
                r"- Core#1: DBG-AP",
                r"- Core#1: DIDR",
                r"- TARGET: BDI removes RESET",
                r"- TARGET: BDI waits for RESET inactive",
                r"- TARGET: Reset sequence passed",
                r"- TARGET: resetting target passed",
                r"- TARGET: processing target startup",
                r"- TARGET: processing target startup passed",
            ]),
            halt_command: "halt 3".to_string(),
            halt_expected: strings(&[
                "- TARGET: core #0 has entered debug mode",
                "- TARGET: core #1 has entered debug mode",
            ]),
            continue_command: "cont 3".to_string(),
            select_expected: strings(&["Core number", "Core state", "Debug entry cause", "Current PC", "Current CPSR"]),
        }
    }

    pub fn for_architecture(architecture: &str) -> Result<Self> {
        match architecture.to_lowercase().as_str() {
            "p2020" => Ok(Self::p2020()),
            "a9" => Ok(Self::a9()),
            other => Err(Error::Config(format!("no BDI profile for architecture {other}"))),
        }
    }
}

fn width_suffix(bits: u32) -> &'static str {
    match bits {
        8 => "b",
        16 => "h",
        64 => "d",
        _ => "",
    }
}

pub struct BdiLink {
    connector: Box<dyn Connector>,
    profile: BdiProfile,
    session: Option<CommandSession>,
    state: LinkState,
    dut: Device,
    aux: Option<Device>,
    transcript: String,
    events: Vec<LinkEvent>,
    recovery_delay: Duration,
    /// Workload not yet started in this iteration.
    pending_workload: Option<String>,
    /// Run time of the workload so far, halted time excluded.
    workload_offset: Duration,
    cancel: CancelToken,
}

impl BdiLink {
    pub fn new(
        connector: Box<dyn Connector>,
        profile: BdiProfile,
        dut: Device,
        aux: Option<Device>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            connector,
            profile,
            session: None,
            state: LinkState::Disconnected,
            dut,
            aux,
            transcript: String::new(),
            events: Vec::new(),
            recovery_delay: Duration::from_secs(1),
            pending_workload: None,
            workload_offset: Duration::ZERO,
            cancel,
        }
    }

    /// Pause before and after reconnecting a rebooted debugger.
    pub fn with_recovery_delay(mut self, delay: Duration) -> Self {
        self.recovery_delay = delay;
        self
    }

    fn session(&mut self) -> Result<&mut CommandSession> {
        let name = self.connector.describe();
        self.session.as_mut().ok_or_else(|| not_connected(&name))
    }

    fn command(&mut self, text: &str, expected: &[String], label: &str) -> Result<String> {
        self.session()?.command(text, expected, label)
    }

    fn open_session(&mut self) -> Result<()> {
        let console = self.connector.connect().map_err(|e| match e {
            Error::Interrupted => e,
            other => Error::LinkUnavailable(other.to_string()),
        })?;
        let session = CommandSession::new(console, &self.profile.prompts, &self.profile.error_messages, LINE_ENDING)?;
        self.session = Some(session);
        self.command("", &[], "Debugger not ready")?;
        self.state = LinkState::Connected;
        Ok(())
    }

    fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            self.transcript.push_str(&session.close());
        }
        self.state = LinkState::Disconnected;
    }

    fn reset_once(&mut self) -> Result<()> {
        let sequence = self.profile.reset_sequence.clone();
        self.command("reset", &sequence, "Error resetting DUT")?;
        self.state = LinkState::Running;
        Ok(())
    }

    /// Reboots the debugger and reconnects.
    fn recover(&mut self, reason: &Error) -> Result<()> {
        warn!("Resetting {} after: {}", self.connector.describe(), reason);
        self.events.push(LinkEvent::Recovery {
            reason: reason.to_string(),
        });
        if let Some(session) = self.session.as_mut() {
            // The debugger drops the connection while rebooting
            if let Err(e) = session.send("boot") {
                warn!("Could not send boot to {}: {}", self.connector.describe(), e);
            }
        }
        self.close_session();
        self.cancel.sleep(self.recovery_delay)?;
        self.open_session()?;
        self.cancel.sleep(self.recovery_delay)?;
        Ok(())
    }

    fn register_command(location: &RegisterLocation, value: Option<u64>) -> Result<String> {
        let value = value.map(|value| format!(" {value:#x}"));
        let command = match (location.access, value) {
            (Access::Named, None) => format!("rd {}", location.wire_name()),
            (Access::Named, Some(value)) => format!("rm {}{value}", location.wire_name()),
            (Access::Spr(number), None) => format!("rdspr {number}"),
            (Access::Spr(number), Some(value)) => format!("rmspr {number}{value}"),
            (Access::Pmr(number), None) => format!("rdpmr {number}"),
            (Access::Pmr(number), Some(value)) => format!("rmpmr {number}{value}"),
            (Access::Memory { address, bits }, None) => format!("md{} {address:#x} 1", width_suffix(bits)),
            (Access::Memory { address, bits }, Some(value)) => {
                format!("mm{} {address:#x}{value} 1", width_suffix(bits))
            }
            (Access::TlbEntry | Access::CacheEntry, _) => {
                return Err(Error::protocol(
                    "Error getting register value",
                    format!("{location} is not reachable through the BDI"),
                ))
            }
        };
        Ok(command)
    }
}

impl DebuggerLink for BdiLink {
    fn describe(&self) -> String {
        self.connector.describe()
    }

    fn state(&self) -> LinkState {
        self.state
    }

    fn error_category(&self) -> OutcomeCategory {
        OutcomeCategory::DebuggerError
    }

    fn connect(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        match self.open_session() {
            Ok(()) => {
                info!("Connected to {}", self.connector.describe());
                Ok(())
            }
            Err(error) => {
                self.close_session();
                warn!("Could not connect to debugger, running in supervisor-only mode: {error}");
                Err(error)
            }
        }
    }

    fn reset(&mut self) -> Result<()> {
        match self.reset_once() {
            Ok(()) => Ok(()),
            Err(error @ (Error::Interrupted | Error::LinkUnavailable(_) | Error::Config(_))) => Err(error),
            Err(error) => {
                self.recover(&error)?;
                self.reset_once()
            }
        }
    }

    fn halt(&mut self) -> Result<()> {
        let command = self.profile.halt_command.clone();
        let expected = self.profile.halt_expected.clone();
        self.command(&command, &expected, "Error halting DUT")?;
        self.state = LinkState::Halted;
        Ok(())
    }

    fn continue_execution(&mut self) -> Result<()> {
        let command = self.profile.continue_command.clone();
        self.command(&command, &[], "Error continuing DUT")?;
        self.state = LinkState::Running;
        Ok(())
    }

    fn select_context(&mut self, core: usize) -> Result<()> {
        let expected = self.profile.select_expected.clone();
        self.command(&format!("select {core}"), &expected, "Error selecting core")?;
        Ok(())
    }

    fn read_register(&mut self, location: &RegisterLocation) -> Result<u64> {
        let command = Self::register_command(location, None)?;
        let buffer = self.command(&command, &[":".to_string()], "Error getting register value")?;
        parse_value(&buffer)
            .ok_or_else(|| Error::protocol("Error getting register value", format!("no value for {location}")))
    }

    fn write_register(&mut self, location: &RegisterLocation, value: u64) -> Result<()> {
        let command = Self::register_command(location, Some(value))?;
        self.command(&command, &[], "Error setting register value")?;
        Ok(())
    }

    fn dut(&mut self) -> Result<&mut Device> {
        Ok(&mut self.dut)
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
        self.reset()?;
        self.dut.login()?;
        self.pending_workload = Some(context.command.clone());
        self.workload_offset = Duration::ZERO;
        Ok(())
    }

    fn advance_to(&mut self, point: &InjectionPoint) -> Result<()> {
        let InjectionPoint::Time(offset) = *point else {
            return Err(Error::Config("JTAG injections are scheduled by time".to_string()));
        };
        match self.pending_workload.take() {
            Some(command) => self.dut.write_line(&command)?,
            None => self.continue_execution()?,
        }
        self.cancel.sleep(offset.saturating_sub(self.workload_offset))?;
        self.workload_offset = offset;
        self.halt()
    }

    fn begin_supervision(&mut self, _context: &IterationContext) -> Result<()> {
        // Without a debugger the board is left as it is and only watched.
        if self.session.is_some() {
            self.reset()?;
            self.dut.login()?;
        }
        Ok(())
    }

    fn end_iteration(&mut self) -> Result<()> {
        self.pending_workload = None;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(session) = self.session.as_mut() {
            if let Err(e) = session.send("quit") {
                warn!("Could not send quit to {}: {}", self.connector.describe(), e);
            }
        }
        self.close_session();
        self.dut.close();
        if let Some(aux) = self.aux.as_mut() {
            aux.close();
        }
        Ok(())
    }

    fn take_transcript(&mut self) -> String {
        let mut transcript = std::mem::take(&mut self.transcript);
        if let Some(session) = self.session.as_mut() {
            transcript.push_str(&session.take_transcript());
        }
        transcript
    }

    fn take_events(&mut self) -> Vec<LinkEvent> {
        std::mem::take(&mut self.events)
    }
}
