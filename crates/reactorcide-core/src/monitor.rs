//! `ResourceMonitor`: self-process CPU/memory introspection, feeding the
//! `worker_cpu_usage_percent`/`worker_memory_usage_bytes` metrics (spec
//! §4.7.4). Grounded directly on `performance::monitor::ResourceMonitor`,
//! self-introspecting via `sysinfo::get_current_pid` (spec §9's open
//! question on "current process" resolved the same way the teacher does).

use sysinfo::System;

pub struct ResourceMonitor {
    system: System,
    pid: sysinfo::Pid,
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        let pid = sysinfo::get_current_pid().unwrap_or(sysinfo::Pid::from(0usize));
        let mut system = System::new_all();
        system.refresh_all();
        Self { system, pid }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerResourceUsage {
    pub cpu_usage_percent: f64,
    pub memory_usage_bytes: u64,
    pub virtual_memory_bytes: u64,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refreshes and reads this process's own usage; `Default` (all zero)
    /// if the process entry has gone missing from the table mid-refresh.
    pub fn current_usage(&mut self) -> WorkerResourceUsage {
        self.system.refresh_all();
        match self.system.process(self.pid) {
            Some(process) => WorkerResourceUsage {
                cpu_usage_percent: process.cpu_usage() as f64,
                memory_usage_bytes: process.memory(),
                virtual_memory_bytes: process.virtual_memory(),
            },
            None => WorkerResourceUsage::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_usage_does_not_panic_on_a_live_process() {
        let mut monitor = ResourceMonitor::new();
        let usage = monitor.current_usage();
        assert!(usage.memory_usage_bytes < u64::MAX);
    }
}
