//! Debugger links: the capability set used to halt a device, address its
//! registers and run the workload.
//!
//! Two backends implement [`DebuggerLink`]: [`BdiLink`] drives a physical
//! board through a BDI3000 JTAG debugger over telnet, [`SimicsLink`] drives a
//! Simics simulation through its command pipe and checkpoints.

pub mod bdi;
pub mod command;
pub mod console;
pub mod device;
pub mod simics;

use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::record::{Injection, InjectionPoint, OutcomeCategory};
use crate::targets::RegisterLocation;

pub use bdi::{BdiLink, BdiProfile, Connector, TelnetConnector};
pub use command::CommandSession;
pub use console::Console;
pub use device::{Device, DeviceConfig};
pub use simics::{SimicsConfig, SimicsLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connected,
    Halted,
    Running,
}

/// Notable link events kept for the debugger transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The debugger was rebooted after a failed reset.
    Recovery { reason: String },
}

/// What a link needs to know about the iteration it prepares.
#[derive(Debug, Clone)]
pub struct IterationContext {
    pub campaign_id: u64,
    pub iteration: u64,
    /// Workload command line started on the DUT.
    pub command: String,
}

pub trait DebuggerLink: Send {
    fn describe(&self) -> String;

    fn state(&self) -> LinkState;

    /// Outcome category used for failures of this backend.
    fn error_category(&self) -> OutcomeCategory;

    fn connect(&mut self) -> Result<()>;

    fn reset(&mut self) -> Result<()>;

    fn halt(&mut self) -> Result<()>;

    fn continue_execution(&mut self) -> Result<()>;

    /// Makes `core` the target of register access.
    fn select_context(&mut self, core: usize) -> Result<()>;

    fn read_register(&mut self, location: &RegisterLocation) -> Result<u64>;

    fn write_register(&mut self, location: &RegisterLocation, value: u64) -> Result<()>;

    fn dut(&mut self) -> Result<&mut Device>;

    /// Hands the auxiliary device to a concurrent run.
    fn take_aux(&mut self) -> Option<Device>;

    fn restore_aux(&mut self, aux: Device);

    fn cancel_token(&self) -> &CancelToken;

    fn send_files(&mut self, files: &[PathBuf]) -> Result<()> {
        let cancel = self.cancel_token().clone();
        self.dut()?.send_files(files, &cancel)
    }

    fn get_file(&mut self, remote_file: &str, local: &Path) -> Result<()> {
        let cancel = self.cancel_token().clone();
        self.dut()?.get_file(remote_file, local, &cancel)
    }

    fn run_shell_command(&mut self, command: &str) -> Result<String> {
        self.dut()?.command(command)
    }

    /// Brings the device into the state an iteration starts from.
    fn begin_iteration(&mut self, context: &IterationContext) -> Result<()>;

    /// Runs the workload up to `point` and leaves the device halted there.
    fn advance_to(&mut self, point: &InjectionPoint) -> Result<()>;

    /// Called once an injection has been written and verified.
    fn commit_injection(&mut self, _injection: &Injection) -> Result<()> {
        Ok(())
    }

    /// Follows the injected state up to the end of the monitored window.
    fn monitor_injections(&mut self, _injected: &[(Injection, RegisterLocation)]) -> Result<()> {
        Ok(())
    }

    /// Number of bits in the monitored state that differ from the gold run.
    ///
    /// Called once the workload output has been collected, so a backend
    /// may tear down the faulty run to read the gold state.
    fn latent_faults(&mut self) -> Result<usize> {
        Ok(0)
    }

    /// Prepares a run without injections, leaving the workload unstarted.
    fn begin_supervision(&mut self, _context: &IterationContext) -> Result<()> {
        Ok(())
    }

    /// Releases per-iteration resources.
    fn end_iteration(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    /// Debugger console output since the last call.
    fn take_transcript(&mut self) -> String;

    fn take_events(&mut self) -> Vec<LinkEvent>;
}

pub(crate) fn not_connected(name: &str) -> Error {
    Error::LinkUnavailable(format!("{name} is not connected"))
}
