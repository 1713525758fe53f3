//! System load sampling

use serde::{Deserialize, Serialize};
use sysinfo::{Components, System};

/// Thermal pressure, worst first when compared in reverse
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermalState {
    #[default]
    Nominal,
    Fair,
    Serious,
    Critical,
}

impl ThermalState {
    /// Temperature assumed critical when a sensor reports none
    pub const DEFAULT_CRITICAL_CELSIUS: f32 = 100.0;

    /// Map a sensor reading to a thermal state
    pub fn from_temperature(celsius: f32, critical: Option<f32>) -> Self {
        let critical = critical
            .filter(|c| c.is_finite() && *c > 0.0)
            .unwrap_or(Self::DEFAULT_CRITICAL_CELSIUS);
        if !celsius.is_finite() {
            ThermalState::Nominal
        } else if celsius >= critical {
            ThermalState::Critical
        } else if celsius >= critical - 15.0 {
            ThermalState::Serious
        } else if celsius >= critical - 30.0 {
            ThermalState::Fair
        } else {
            ThermalState::Nominal
        }
    }
}

/// One load sample
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemLoad {
    /// Global CPU usage, 0-100
    pub cpu_percent: f32,
    /// Used memory, 0-100
    pub memory_percent: f32,
    pub thermal: ThermalState,
}

/// Source of load samples
pub trait SystemMonitor: Send {
    fn sample(&mut self) -> SystemLoad;
}

/// [`SystemMonitor`] backed by `sysinfo`
///
/// CPU usage is computed between refreshes, so the first sample reads 0.
pub struct SysinfoMonitor {
    system: System,
    components: Components,
}

impl Default for SysinfoMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system,
            components: Components::new_with_refreshed_list(),
        }
    }

    fn thermal(&mut self) -> ThermalState {
        self.components.refresh();
        self.components
            .list()
            .iter()
            .map(|c| ThermalState::from_temperature(c.temperature(), c.critical()))
            .max()
            .unwrap_or_default()
    }
}

impl SystemMonitor for SysinfoMonitor {
    fn sample(&mut self) -> SystemLoad {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let cpu_percent = self.system.global_cpu_info().cpu_usage().clamp(0.0, 100.0);
        let total_memory = self.system.total_memory();
        let memory_percent = if total_memory > 0 {
            (self.system.used_memory() as f64 / total_memory as f64 * 100.0) as f32
        } else {
            0.0
        };

        SystemLoad {
            cpu_percent,
            memory_percent: memory_percent.clamp(0.0, 100.0),
            thermal: self.thermal(),
        }
    }
}
