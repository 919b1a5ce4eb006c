use crossbeam_channel::{unbounded, Receiver, Sender};
use seu_injector::debugger::{Console, IterationContext, LinkEvent};
use seu_injector::error::Result;
use seu_injector::prelude::*;
use seu_injector::targets::RegisterLocation;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

const CATALOG: &str = r#"{
    "cores": 2,
    "targets": {
        "GPR": {"registers": {"r": {"count": [8]}}},
        "SPR": {"registers": {"srr0": {"SPR": 26}, "srr1": {"SPR": 27}}}
    }
}"#;

const PROMPT: &str = "root@p2020rdb:~#";

/// DUT console input fed by the mock debugger.
struct FeedReader {
    receiver: Receiver<Vec<u8>>,
    leftover: Vec<u8>,
}

impl Read for FeedReader {
    fn read(&mut self, buffer: &mut [u8]) -> std::io::Result<usize> {
        if self.leftover.is_empty() {
            match self.receiver.recv() {
                Ok(bytes) => self.leftover = bytes,
                Err(_) => return Ok(0),
            }
        }
        let count = buffer.len().min(self.leftover.len());
        buffer[..count].copy_from_slice(&self.leftover[..count]);
        self.leftover.drain(..count);
        Ok(count)
    }
}

/// Debugger stand-in backed by a register map.
///
/// Resuming the target makes the DUT print `workload_output` followed by
/// the shell prompt.
struct MockLink {
    registers: Arc<Mutex<HashMap<String, u64>>>,
    dut: Device,
    feed: Sender<Vec<u8>>,
    output: Vec<u8>,
    workload_output: String,
    /// Writes are dropped, so every readback disagrees.
    stuck: bool,
    /// Compares the injected registers with their gold values after the run.
    track_state: bool,
    /// Gold and monitored value of every injected register.
    monitored: Vec<(u64, u64)>,
    /// Panics on connect.
    broken: bool,
    state: LinkState,
    cancel: CancelToken,
}

impl MockLink {
    fn new(cancel: &CancelToken) -> Self {
        let (feed, receiver) = unbounded();
        let reader = FeedReader {
            receiver,
            leftover: Vec::new(),
        };
        let console = Console::spawn("dut", reader, std::io::sink(), Duration::from_secs(2), cancel.clone());
        Self {
            registers: Arc::new(Mutex::new(HashMap::new())),
            dut: Device::new("dut", DeviceConfig::default(), console).unwrap(),
            feed,
            output: b"gold output".to_vec(),
            workload_output: "done\r\n".to_string(),
            stuck: false,
            track_state: false,
            monitored: Vec::new(),
            broken: false,
            state: LinkState::Disconnected,
            cancel: cancel.clone(),
        }
    }
}

impl DebuggerLink for MockLink {
    fn describe(&self) -> String {
        "mock".to_string()
    }

    fn state(&self) -> LinkState {
        self.state
    }

    fn error_category(&self) -> OutcomeCategory {
        OutcomeCategory::DebuggerError
    }

    fn connect(&mut self) -> Result<()> {
        assert!(!self.broken, "debugger connection panicked");
        self.state = LinkState::Connected;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.state = LinkState::Halted;
        Ok(())
    }

    fn halt(&mut self) -> Result<()> {
        self.state = LinkState::Halted;
        Ok(())
    }

    fn continue_execution(&mut self) -> Result<()> {
        self.state = LinkState::Running;
        let _ = self
            .feed
            .send(format!("{}{PROMPT} ", self.workload_output).into_bytes());
        Ok(())
    }

    fn select_context(&mut self, core: usize) -> Result<()> {
        assert!(core < 2);
        Ok(())
    }

    fn read_register(&mut self, location: &RegisterLocation) -> Result<u64> {
        let mut registers = self.registers.lock().unwrap();
        Ok(*registers.entry(location.wire_name()).or_insert(0x1234_5678))
    }

    fn write_register(&mut self, location: &RegisterLocation, value: u64) -> Result<()> {
        if !self.stuck {
            self.registers.lock().unwrap().insert(location.wire_name(), value);
        }
        Ok(())
    }

    fn dut(&mut self) -> Result<&mut Device> {
        Ok(&mut self.dut)
    }

    fn take_aux(&mut self) -> Option<Device> {
        None
    }

    fn restore_aux(&mut self, _aux: Device) {}

    fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn send_files(&mut self, _files: &[PathBuf]) -> Result<()> {
        Ok(())
    }

    fn get_file(&mut self, _remote_file: &str, local: &Path) -> Result<()> {
        std::fs::write(local, &self.output)?;
        Ok(())
    }

    fn begin_iteration(&mut self, _context: &IterationContext) -> Result<()> {
        self.monitored.clear();
        self.reset()
    }

    fn advance_to(&mut self, _point: &InjectionPoint) -> Result<()> {
        self.halt()
    }

    fn monitor_injections(&mut self, injected: &[(Injection, RegisterLocation)]) -> Result<()> {
        if self.track_state {
            for (injection, location) in injected {
                let value = self.read_register(location)?;
                self.monitored.push((injection.gold_value, value));
            }
        }
        Ok(())
    }

    fn latent_faults(&mut self) -> Result<usize> {
        Ok(self
            .monitored
            .iter()
            .map(|(gold, value)| (gold ^ value).count_ones() as usize)
            .sum())
    }

    fn end_iteration(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.state = LinkState::Disconnected;
        Ok(())
    }

    fn take_transcript(&mut self) -> String {
        String::new()
    }

    fn take_events(&mut self) -> Vec<LinkEvent> {
        Vec::new()
    }
}

fn campaign(output_file: Option<&str>) -> Campaign {
    Campaign {
        id: 1,
        architecture: "p2020".to_string(),
        simulator: false,
        use_aux: false,
        command: "./app".to_string(),
        aux_command: String::new(),
        output_file: output_file.map(str::to_string),
        use_aux_output: false,
        exec_time: Duration::ZERO,
        num_checkpoints: 0,
        cycles_between: 0,
        timestamp: SystemTime::now(),
    }
}

fn injector_config(results_dir: &Path, output_file: Option<&str>, num_injections: usize) -> Arc<InjectorConfig> {
    Arc::new(InjectorConfig {
        campaign: campaign(output_file),
        num_injections,
        dut_files: vec![],
        aux_files: vec![],
        results_dir: results_dir.to_path_buf(),
        execution_timeout: Duration::from_secs(2),
    })
}

fn catalog() -> Arc<Catalog> {
    Arc::new(Catalog::from_json("p2020", CATALOG, "jtag").unwrap())
}

#[test]
/// Identical output is classified as no error and the retrieved copy is removed
fn matching_output_is_no_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("1")).unwrap();
    std::fs::write(dir.path().join("1").join("gold_out.bin"), b"gold output").unwrap();

    let cancel = CancelToken::new();
    let store = Arc::new(MemoryStore::new());
    let mut injector = FaultInjector::new(
        Box::new(MockLink::new(&cancel)),
        catalog(),
        InjectionSelector::seeded(1),
        store.clone(),
        injector_config(dir.path(), Some("out.bin"), 1),
        cancel,
    )
    .unwrap();
    injector.connect().unwrap();
    assert_eq!(injector.link().state(), LinkState::Connected);

    let result = injector.run_iteration(1).unwrap();
    assert_eq!(injector.link().state(), LinkState::Running);
    assert_eq!(result.outcome, "No error");
    assert_eq!(result.outcome_category, OutcomeCategory::NoError);
    assert_eq!(result.data_diff, 1.0);
    assert_eq!(result.num_injections, 1);
    assert!(result.dut_output.contains("done"));
    assert!(!dir.path().join("1").join("1").exists());
    assert_eq!(store.results(1).unwrap(), vec![result]);
}

#[test]
/// Differing output is kept next to the gold copy and counted as silent data error
fn differing_output_is_silent_data_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("1")).unwrap();
    std::fs::write(dir.path().join("1").join("gold_out.bin"), b"gold output").unwrap();

    let cancel = CancelToken::new();
    let mut link = MockLink::new(&cancel);
    link.output = b"gold outpux".to_vec();
    let store = Arc::new(MemoryStore::new());
    let mut injector = FaultInjector::new(
        Box::new(link),
        catalog(),
        InjectionSelector::seeded(2),
        store,
        injector_config(dir.path(), Some("out.bin"), 1),
        cancel,
    )
    .unwrap();

    let result = injector.run_iteration(4).unwrap();
    assert_eq!(result.outcome, "Silent data error");
    assert_eq!(result.outcome_category, OutcomeCategory::DataError);
    assert!(result.data_diff < 1.0);
    assert!(dir.path().join("1").join("4").join("out.bin").exists());
}

#[test]
/// A crashing workload is an execution error, its output is still compared and kept
fn crashed_workload_output_is_compared() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("1")).unwrap();
    std::fs::write(dir.path().join("1").join("gold_out.bin"), b"gold output").unwrap();

    let cancel = CancelToken::new();
    let mut link = MockLink::new(&cancel);
    link.workload_output = "Segmentation fault\r\n".to_string();
    link.output = b"gold".to_vec();
    let mut injector = FaultInjector::new(
        Box::new(link),
        catalog(),
        InjectionSelector::seeded(6),
        Arc::new(MemoryStore::new()),
        injector_config(dir.path(), Some("out.bin"), 1),
        cancel,
    )
    .unwrap();

    let result = injector.run_iteration(2).unwrap();
    assert_eq!(result.outcome, "Segmentation fault");
    assert_eq!(result.outcome_category, OutcomeCategory::ExecutionError);
    assert!(result.data_diff >= 0.0 && result.data_diff < 1.0);
    assert!(dir.path().join("1").join("2").join("out.bin").exists());
}

#[test]
/// Injected state that survives the run is reported once the output matched
fn surviving_injections_are_latent_faults() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("1")).unwrap();
    std::fs::write(dir.path().join("1").join("gold_out.bin"), b"gold output").unwrap();

    let cancel = CancelToken::new();
    let mut link = MockLink::new(&cancel);
    link.track_state = true;
    let mut injector = FaultInjector::new(
        Box::new(link),
        catalog(),
        InjectionSelector::seeded(7),
        Arc::new(MemoryStore::new()),
        injector_config(dir.path(), Some("out.bin"), 2),
        cancel,
    )
    .unwrap();

    let result = injector.run_iteration(1).unwrap();
    assert_eq!(result.data_diff, 1.0);
    assert!(result.latent_faults >= 1);
    assert_eq!(result.outcome, "Latent faults");
    assert_eq!(result.outcome_category, OutcomeCategory::NoError);
}

#[test]
/// A self-checking workload reporting errors is a detected data error
fn detected_errors_are_data_errors() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    let mut link = MockLink::new(&cancel);
    link.workload_output = "detected_errors: 3\r\n".to_string();
    let mut injector = FaultInjector::new(
        Box::new(link),
        catalog(),
        InjectionSelector::seeded(3),
        Arc::new(MemoryStore::new()),
        injector_config(dir.path(), None, 1),
        cancel,
    )
    .unwrap();

    let result = injector.run_iteration(1).unwrap();
    assert_eq!(result.detected_errors, 3);
    assert_eq!(result.outcome, "Detected data error");
    assert_eq!(result.outcome_category, OutcomeCategory::DataError);
}

#[test]
/// A write that does not stick fails the iteration, the injection stays recorded
fn failed_readback_is_debugger_error() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    let mut link = MockLink::new(&cancel);
    link.stuck = true;
    let store = Arc::new(MemoryStore::new());
    let mut injector = FaultInjector::new(
        Box::new(link),
        catalog(),
        InjectionSelector::seeded(4),
        store.clone(),
        injector_config(dir.path(), None, 3),
        cancel,
    )
    .unwrap();

    let result = injector.run_iteration(1).unwrap();
    assert_eq!(result.outcome, "Error injecting fault");
    assert_eq!(result.outcome_category, OutcomeCategory::DebuggerError);
    assert_eq!(result.num_injections, 1);
    let injections = store.injections(1, 1).unwrap();
    assert_eq!(injections.len(), 1);
    assert_eq!(injections[0].injection_number, 1);
}

#[test]
/// Every injection flips exactly the selected bit of the gold value
fn injections_flip_one_bit() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    let link = MockLink::new(&cancel);
    let registers = Arc::clone(&link.registers);
    let store = Arc::new(MemoryStore::new());
    let mut injector = FaultInjector::new(
        Box::new(link),
        catalog(),
        InjectionSelector::seeded(5),
        store.clone(),
        injector_config(dir.path(), None, 1),
        cancel,
    )
    .unwrap();

    for iteration in 1..=20 {
        injector.run_iteration(iteration).unwrap();
        let injections = store.injections(1, iteration).unwrap();
        assert_eq!(injections.len(), 1);
        let injection = &injections[0];
        assert!(injection.site.bit < 32);
        assert!(injection.site.core < 2);
        assert_eq!(injection.injected_value, injection.gold_value ^ (1 << injection.site.bit));
        assert_eq!((injection.gold_value ^ injection.injected_value).count_ones(), 1);
        let location = catalog().locate(&injection.site).unwrap();
        assert_eq!(registers.lock().unwrap()[&location.wire_name()], injection.injected_value);
    }
}

#[test]
/// Four workers share ten iterations, each iteration runs exactly once
fn concurrent_workers_run_each_iteration_once() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    let store = Arc::new(MemoryStore::new());
    let config = injector_config(dir.path(), None, 2);
    let catalog = catalog();

    let counter = IterationCounter::new(1, 10);
    let scheduler = CampaignScheduler::new(4, Mode::Inject, cancel.clone());
    let report = scheduler
        .run(&counter, |worker| {
            FaultInjector::new(
                Box::new(MockLink::new(&cancel)),
                Arc::clone(&catalog),
                InjectionSelector::seeded(worker as u64),
                store.clone(),
                Arc::clone(&config),
                cancel.clone(),
            )
        })
        .unwrap();

    assert_eq!(report.workers, 4);
    assert_eq!(report.completed, 10);
    assert_eq!(report.failed_workers, 0);
    assert_eq!(report.remaining, 0);
    assert!(!report.interrupted);
    let results = store.results(1).unwrap();
    let iterations: Vec<u64> = results.iter().map(|result| result.iteration).collect();
    assert_eq!(iterations, (1..=10).collect::<Vec<_>>());
    assert_eq!(iterations.iter().collect::<HashSet<_>>().len(), 10);
    for iteration in 1..=10 {
        assert_eq!(store.injections(1, iteration).unwrap().len(), 2);
    }
}

#[test]
/// A worker that panics is counted as failed while the others finish the campaign
fn panicking_worker_does_not_stop_campaign() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    let store = Arc::new(MemoryStore::new());
    let config = injector_config(dir.path(), None, 1);
    let catalog = catalog();

    let counter = IterationCounter::new(1, 6);
    let report = CampaignScheduler::new(3, Mode::Inject, cancel.clone())
        .run(&counter, |worker| {
            let mut link = MockLink::new(&cancel);
            link.broken = worker == 0;
            FaultInjector::new(
                Box::new(link),
                Arc::clone(&catalog),
                InjectionSelector::seeded(worker as u64),
                store.clone(),
                Arc::clone(&config),
                cancel.clone(),
            )
        })
        .unwrap();

    assert_eq!(report.workers, 3);
    assert_eq!(report.failed_workers, 1);
    assert_eq!(report.completed, 6);
    assert_eq!(report.remaining, 0);
    assert!(!report.interrupted);
    assert_eq!(store.results(1).unwrap().len(), 6);
}

#[test]
/// A cancelled campaign starts no further iterations
fn cancelled_campaign_stops() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    let store = Arc::new(MemoryStore::new());
    let config = injector_config(dir.path(), None, 1);
    let catalog = catalog();

    let counter = IterationCounter::new(1, 5);
    let report = CampaignScheduler::new(2, Mode::Inject, cancel.clone())
        .run(&counter, |_| {
            FaultInjector::new(
                Box::new(MockLink::new(&cancel)),
                Arc::clone(&catalog),
                InjectionSelector::seeded(0),
                store.clone(),
                Arc::clone(&config),
                cancel.clone(),
            )
        })
        .unwrap();
    assert!(report.interrupted);
    assert_eq!(report.completed, 0);
    assert_eq!(report.remaining, 5);
    assert!(store.results(1).unwrap().is_empty());
}

#[test]
/// The shipped catalogs load for both backends
fn shipped_catalogs_load() {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("targets");
    for architecture in ["p2020", "a9"] {
        for backend in ["jtag", "simics"] {
            let catalog = Catalog::load(&dir, architecture, backend).unwrap();
            assert!(catalog.total_bits() > 0, "{architecture}/{backend}");
        }
    }
    let jtag = Catalog::load(&dir, "p2020", "jtag").unwrap();
    assert!(jtag.target("TLB1").is_none());
    let simics = Catalog::load(&dir, "p2020", "simics").unwrap();
    assert!(simics.target("TLB1").is_some());
    assert!(simics.target("PMR").is_none());
}
