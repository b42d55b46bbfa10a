use serde::{Deserialize, Serialize};

use crate::task_graph::{CriticalPath, MaxParallel, RateAware, SchedulingStrategy};

/// Which `SchedulingStrategy` the scheduler's main loop consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    MaxParallel,
    RateAware,
    CriticalPath,
}

impl Default for StrategyKind {
    fn default() -> Self {
        Self::MaxParallel
    }
}

impl StrategyKind {
    /// Builds the concrete strategy this variant names. `max_rpm` and
    /// `estimated_rpm_per_task` only matter for `RateAware`; the other
    /// variants ignore them.
    pub fn build(&self, max_rpm: u32, estimated_rpm_per_task: u32) -> Box<dyn SchedulingStrategy> {
        match self {
            StrategyKind::MaxParallel => Box::new(MaxParallel),
            StrategyKind::RateAware => Box::new(RateAware { max_rpm, estimated_rpm_per_task }),
            StrategyKind::CriticalPath => Box::new(CriticalPath),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub strategy: StrategyKind,
    pub max_rpm: u32,
    pub estimated_rpm_per_task: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            max_rpm: 3800,
            estimated_rpm_per_task: 15,
        }
    }
}
