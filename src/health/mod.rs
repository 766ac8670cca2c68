//! Health check module

mod checker;

pub use self::checker::{HealthChecker, HealthMonitor, HealthReport, Probe, ProbeResult};
