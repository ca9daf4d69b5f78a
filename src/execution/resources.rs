//! Resource ceilings for a sandbox container.
//!
//! Ceilings are configured in human units (MB, core fractions, durations)
//! and translated here into the units the Docker API expects.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// CFS scheduler period in microseconds (fixed at 100ms).
pub const CPU_PERIOD_MICROS: i64 = 100_000;

/// Resource ceilings enforced for the lifetime of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Deadline for the executed command.
    pub cpu_timeout: Duration,
    /// CPU cores available (e.g., 0.5, 1.0, 2.0).
    pub cpu_cores: f64,
    /// Memory limit in megabytes. Also the memory+swap limit.
    pub memory_mb: u64,
    /// Size of the writable workspace in megabytes. Zero disables the cap.
    pub disk_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_timeout: Duration::from_secs(10),
            cpu_cores: 1.0,
            memory_mb: 256,
            disk_mb: 64,
        }
    }
}

impl ResourceLimits {
    /// Creates new resource limits with the given parameters.
    pub fn new(cpu_timeout: Duration, cpu_cores: f64, memory_mb: u64, disk_mb: u64) -> Self {
        Self {
            cpu_timeout,
            cpu_cores,
            memory_mb,
            disk_mb,
        }
    }

    /// Returns memory limit in bytes.
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb * 1024 * 1024) as i64
    }

    /// Returns the memory+swap limit in bytes.
    ///
    /// Equal to [`Self::memory_bytes`], so no swap is granted beyond the
    /// hard memory ceiling.
    pub fn memory_swap_bytes(&self) -> i64 {
        self.memory_bytes()
    }

    /// Returns CPU period in microseconds.
    pub fn cpu_period(&self) -> i64 {
        CPU_PERIOD_MICROS
    }

    /// Returns CPU quota based on cores allocated.
    ///
    /// Formula: quota = period * cores
    /// e.g., 0.5 core = 50000 quota (half of one CPU)
    pub fn cpu_quota(&self) -> i64 {
        (self.cpu_period() as f64 * self.cpu_cores) as i64
    }

    /// Returns disk space limit in bytes.
    pub fn disk_bytes(&self) -> u64 {
        self.disk_mb * 1024 * 1024
    }

    /// Mount options for the size-capped workspace tmpfs, if any.
    ///
    /// `exec` is required so compiled binaries can run from the workspace.
    pub fn workspace_tmpfs_options(&self) -> Option<String> {
        if self.disk_mb == 0 {
            return None;
        }
        Some(format!("rw,exec,size={}m", self.disk_mb))
    }
}
