//! # Memory Bounds
//!
//! Bulk runs check resident memory after every chunk. Crossing the soft
//! limit adds a warning and the run continues; crossing the hard limit stops
//! the run with `MEMORY_LIMIT`.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use sysinfo::{Pid, System};
use tracing::debug;

use crate::config::BatchConfig;

pub trait MemoryProbe: Send + Sync + fmt::Debug {
    /// Resident memory of this process in megabytes, `None` when unknown
    fn used_mb(&self) -> Option<u64>;
}

/// Reads resident memory of the current process through `sysinfo`
pub struct ProcessMemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            debug!("Current pid unavailable, memory checks disabled");
        }
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProcessMemoryProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessMemoryProbe")
            .field("pid", &self.pid)
            .finish()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn used_mb(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock();
        if !system.refresh_process(pid) {
            return None;
        }
        system
            .process(pid)
            .map(|process| process.memory() / (1024 * 1024))
    }
}

/// Reports whatever value it was last set to
#[derive(Debug, Default)]
pub struct FixedMemoryProbe {
    used_mb: AtomicU64,
}

impl FixedMemoryProbe {
    pub fn new(used_mb: u64) -> Self {
        Self {
            used_mb: AtomicU64::new(used_mb),
        }
    }

    pub fn set(&self, used_mb: u64) {
        self.used_mb.store(used_mb, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn used_mb(&self) -> Option<u64> {
        Some(self.used_mb.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    Normal,
    Soft { used_mb: u64 },
    Hard { used_mb: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimits {
    pub soft_mb: u64,
    pub hard_mb: u64,
}

impl From<&BatchConfig> for MemoryLimits {
    fn from(config: &BatchConfig) -> Self {
        Self {
            soft_mb: config.memory_soft_limit_mb,
            hard_mb: config.memory_hard_limit_mb,
        }
    }
}

impl MemoryLimits {
    pub fn classify(&self, probe: &dyn MemoryProbe) -> MemoryPressure {
        match probe.used_mb() {
            Some(used_mb) if used_mb >= self.hard_mb => MemoryPressure::Hard { used_mb },
            Some(used_mb) if used_mb >= self.soft_mb => MemoryPressure::Soft { used_mb },
            _ => MemoryPressure::Normal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let limits = MemoryLimits {
            soft_mb: 512,
            hard_mb: 1024,
        };
        let probe = FixedMemoryProbe::new(100);
        assert_eq!(limits.classify(&probe), MemoryPressure::Normal);

        probe.set(600);
        assert_eq!(limits.classify(&probe), MemoryPressure::Soft { used_mb: 600 });

        probe.set(1024);
        assert_eq!(limits.classify(&probe), MemoryPressure::Hard { used_mb: 1024 });
    }

    #[test]
    fn test_process_probe_reads_something() {
        let probe = ProcessMemoryProbe::new();
        if let Some(used) = probe.used_mb() {
            assert!(used < 1024 * 1024);
        }
    }
}
