pub mod cancel;
pub mod config;
pub mod debugger;
pub mod deserializers;
pub mod error;
pub mod fault_injector;
pub mod record;
pub mod scheduler;
pub mod store;
pub mod targets;

pub mod prelude {
    pub use crate::cancel::CancelToken;
    pub use crate::config::{Args, BackendConfig, Config};
    pub use crate::debugger::{DebuggerLink, Device, DeviceConfig, LinkState};
    pub use crate::error::Error;
    pub use crate::fault_injector::{FaultInjector, InjectorConfig};
    pub use crate::record::{Campaign, Injection, InjectionPoint, IterationResult, OutcomeCategory};
    pub use crate::scheduler::{CampaignScheduler, IterationCounter, Mode, SchedulerReport};
    pub use crate::store::{JsonLinesStore, MemoryStore, ResultStore};
    pub use crate::targets::{Catalog, InjectionSelector, InjectionSite};
}
