use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub max_workers: u32,
    pub spawn_timeout_ms: u64,
    pub auto_cleanup: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            spawn_timeout_ms: 3000,
            auto_cleanup: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolConfigError {
    #[error("max_workers must be in [2, 50], got {0}")]
    OutOfRange(u32),
}

impl WorkerPoolConfig {
    pub fn validate(&self) -> Result<(), WorkerPoolConfigError> {
        if !(2..=50).contains(&self.max_workers) {
            return Err(WorkerPoolConfigError::OutOfRange(self.max_workers));
        }
        Ok(())
    }
}
