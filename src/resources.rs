use sysinfo::System;

/// Host CPU and memory usage, both as fractions in `0.0..=1.0`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SystemResources {
    pub cpu: f64,
    pub mem: f64,
}

/// Keeps a [`System`] between flush cycles so CPU usage is measured over the cycle.
pub struct ResourceSampler {
    system: System,
}

impl Default for ResourceSampler {
    fn default() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl ResourceSampler {
    pub fn sample(&mut self) -> SystemResources {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        let cpu = f64::from(self.system.global_cpu_usage()) / 100.0;
        let total = self.system.total_memory();
        let mem = if total == 0 { 0.0 } else { self.system.used_memory() as f64 / total as f64 };
        // columns hold two decimal places
        SystemResources { cpu: round2(cpu), mem: round2(mem) }
    }
}

fn round2(value: f64) -> f64 {
    (value.clamp(0.0, 1.0) * 100.0).round() / 100.0
}
