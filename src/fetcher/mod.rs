//! Per-tenant fetch scheduling.

pub mod manager;
pub mod scheduler;

pub use manager::{BootstrapReport, FetcherManager, ManagerConfig};
pub use scheduler::{CycleRun, CycleRunner, FetcherConfig, FetcherStatus, TenantFetcher};
