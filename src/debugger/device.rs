use log::{info, warn};
use regex::Regex;
use serde::Deserialize;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::console::Console;
use crate::cancel::CancelToken;
use crate::error::{Error, Result};

/// Console messages that mean the workload or the kernel crashed.
pub const DEVICE_ERROR_MESSAGES: [&str; 6] = [
    "Kernel panic",
    "Segmentation fault",
    "Illegal instruction",
    "Oops",
    "Call Trace:",
    "Bus error",
];

/// In-band marker printed by a self-checking workload.
pub const DETECTED_ERRORS_MARKER: &str = "detected_errors:";

const TRANSFER_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub serial_port: Option<String>,
    #[serde(default = "DeviceConfig::default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "DeviceConfig::default_prompt")]
    pub prompt: String,
    #[serde(default = "DeviceConfig::default_username")]
    pub username: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default = "DeviceConfig::default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub rsa_key: Option<PathBuf>,
}

impl DeviceConfig {
    fn default_baud_rate() -> u32 {
        115200
    }

    fn default_prompt() -> String {
        "root@p2020rdb:~#".to_string()
    }

    fn default_username() -> String {
        "root".to_string()
    }

    fn default_ssh_port() -> u16 {
        22
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            serial_port: None,
            baud_rate: Self::default_baud_rate(),
            prompt: Self::default_prompt(),
            username: Self::default_username(),
            ip_address: None,
            ssh_port: Self::default_ssh_port(),
            rsa_key: None,
        }
    }
}

/// Shell console of a device under test (or the auxiliary device).
pub struct Device {
    name: String,
    config: DeviceConfig,
    console: Console,
    prompt: Regex,
}

impl Device {
    pub fn new(name: &str, config: DeviceConfig, console: Console) -> Result<Self> {
        let prompt = Regex::new(&regex::escape(&config.prompt)).map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            config,
            console,
            prompt,
        })
    }

    /// Opens the serial port named in `config` (or `port` if given).
    pub fn open(
        name: &str,
        config: DeviceConfig,
        port: Option<&str>,
        timeout: Duration,
        cancel: CancelToken,
    ) -> Result<Self> {
        let port = port
            .map(str::to_string)
            .or_else(|| config.serial_port.clone())
            .ok_or_else(|| Error::Config(format!("no serial port configured for {name}")))?;
        let file = open_serial(&port, config.baud_rate)?;
        let writer = file.try_clone()?;
        let closed = Arc::new(AtomicBool::new(false));
        let reader = SerialReader {
            file,
            closed: Arc::clone(&closed),
        };
        let console = Console::spawn(name, reader, writer, timeout, cancel).with_closer(move || {
            closed.store(true, Ordering::SeqCst);
        });
        info!("Opened {name} console on {port}");
        Self::new(name, config, console)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn console(&mut self) -> &mut Console {
        &mut self.console
    }

    /// Writes one line to the shell.
    pub fn write_line(&mut self, text: &str) -> Result<()> {
        self.console.write_str(&format!("{text}\n"))
    }

    /// Sends Ctrl-C to the foreground process.
    pub fn interrupt(&mut self) -> Result<()> {
        self.console.write_str("\x03")
    }

    /// Reads until the shell prompt and checks for crash messages.
    pub fn read_until_prompt(&mut self) -> Result<String> {
        let prompt = self.prompt.clone();
        let (_, buffer) = self.console.expect(&[prompt])?;
        match DEVICE_ERROR_MESSAGES.iter().find(|message| buffer.contains(*message)) {
            Some(message) => Err(Error::protocol(*message, format!("{} console", self.name))),
            None => Ok(buffer),
        }
    }

    /// Like [`Device::read_until_prompt`] with a one-off timeout.
    pub fn read_until_prompt_within(&mut self, timeout: Duration) -> Result<String> {
        let previous = self.console.timeout();
        self.console.set_timeout(timeout);
        let result = self.read_until_prompt();
        self.console.set_timeout(previous);
        result
    }

    pub fn command(&mut self, text: &str) -> Result<String> {
        self.write_line(text)?;
        self.read_until_prompt()
    }

    pub fn login(&mut self) -> Result<()> {
        self.console.expect_literal("login: ")?;
        let username = self.config.username.clone();
        self.write_line(&username)?;
        self.read_until_prompt()?;
        Ok(())
    }

    /// Copies local files into the home directory of the device.
    pub fn send_files(&mut self, files: &[PathBuf], cancel: &CancelToken) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let destination = format!("{}:", self.remote()?);
        let mut arguments: Vec<String> = files.iter().map(|file| file.display().to_string()).collect();
        arguments.push(destination);
        self.scp(&arguments, cancel)
    }

    pub fn get_file(&mut self, remote_file: &str, local: &Path, cancel: &CancelToken) -> Result<()> {
        let source = format!("{}:{}", self.remote()?, remote_file);
        self.scp(&[source, local.display().to_string()], cancel)
    }

    pub fn take_output(&mut self) -> String {
        self.console.take_transcript()
    }

    pub fn close(&mut self) {
        self.console.close();
    }

    fn remote(&self) -> Result<String> {
        let address = self
            .config
            .ip_address
            .as_ref()
            .ok_or_else(|| Error::Transfer(format!("no ip address configured for {}", self.name)))?;
        Ok(format!("{}@{}", self.config.username, address))
    }

    fn scp(&self, arguments: &[String], cancel: &CancelToken) -> Result<()> {
        let mut last_error = String::new();
        for attempt in 1..=TRANSFER_ATTEMPTS {
            cancel.check()?;
            let mut command = Command::new("scp");
            command
                .arg("-q")
                .args(["-o", "StrictHostKeyChecking=no"])
                .args(["-P", &self.config.ssh_port.to_string()]);
            if let Some(key) = &self.config.rsa_key {
                command.arg("-i").arg(key);
            }
            match command.args(arguments).output() {
                Ok(output) if output.status.success() => return Ok(()),
                Ok(output) => last_error = String::from_utf8_lossy(&output.stderr).trim().to_string(),
                Err(e) => last_error = e.to_string(),
            }
            warn!("{} transfer attempt {attempt}/{TRANSFER_ATTEMPTS} failed: {last_error}", self.name);
            cancel.sleep(Duration::from_secs(1))?;
        }
        Err(Error::Transfer(format!("{}: {}", self.name, last_error)))
    }
}

/// Parses the count of the first `detected_errors:<N>` line, if any.
pub fn detected_errors(buffer: &str) -> Option<u32> {
    buffer.lines().find_map(|line| {
        let (_, count) = line.split_once(DETECTED_ERRORS_MARKER)?;
        count.trim().parse().ok()
    })
}

/// Reads a serial port in short polls so that closing can stop the reader.
struct SerialReader {
    file: File,
    closed: Arc<AtomicBool>,
}

impl Read for SerialReader {
    fn read(&mut self, buffer: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let count = self.file.read(buffer)?;
            if count > 0 || self.closed.load(Ordering::SeqCst) {
                return Ok(count);
            }
        }
    }
}

fn open_serial(path: &str, baud_rate: u32) -> Result<File> {
    let speed = match baud_rate {
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        other => return Err(Error::Config(format!("unsupported baud rate {other}"))),
    };
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(path)
        .map_err(|e| Error::LinkUnavailable(format!("{path}: {e}")))?;
    let fd = file.as_raw_fd();
    // SAFETY: `fd` is an open descriptor owned by `file` for the whole block.
    unsafe {
        let mut termios: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut termios) != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        libc::cfmakeraw(&mut termios);
        libc::cfsetispeed(&mut termios, speed);
        libc::cfsetospeed(&mut termios, speed);
        // Return from read after 1 s of silence.
        termios.c_cc[libc::VMIN] = 0;
        termios.c_cc[libc::VTIME] = 10;
        if libc::tcsetattr(fd, libc::TCSANOW, &termios) != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok(file)
}
