//! Pluggable scheduling strategies. Each is a pure function: no hidden
//! state, no mutation of its inputs.

use super::TaskGraph;

/// Decides which ready tasks to dispatch this tick.
pub trait SchedulingStrategy: Send + Sync {
    fn select_tasks(
        &self,
        ready: &[String],
        available_workers: usize,
        current_rpm: Option<u32>,
        graph: Option<&TaskGraph>,
    ) -> Vec<String>;
}

/// Dispatch as many ready tasks as there are available worker slots.
#[derive(Debug, Default, Clone, Copy)]
pub struct MaxParallel;

impl SchedulingStrategy for MaxParallel {
    fn select_tasks(
        &self,
        ready: &[String],
        available_workers: usize,
        _current_rpm: Option<u32>,
        _graph: Option<&TaskGraph>,
    ) -> Vec<String> {
        let n = ready.len().min(available_workers);
        ready[..n].to_vec()
    }
}

/// Dispatch only as many tasks as the remaining rate-limit headroom allows.
#[derive(Debug, Clone, Copy)]
pub struct RateAware {
    pub max_rpm: u32,
    pub estimated_rpm_per_task: u32,
}

impl SchedulingStrategy for RateAware {
    fn select_tasks(
        &self,
        ready: &[String],
        available_workers: usize,
        current_rpm: Option<u32>,
        _graph: Option<&TaskGraph>,
    ) -> Vec<String> {
        let current_rpm = current_rpm.unwrap_or(0);
        let headroom = self.max_rpm.saturating_sub(current_rpm);

        if headroom == 0 || self.estimated_rpm_per_task == 0 {
            return Vec::new();
        }

        let by_rate = (headroom / self.estimated_rpm_per_task) as usize;
        let n = ready.len().min(available_workers).min(by_rate);
        ready[..n].to_vec()
    }
}

/// Prefer tasks on the critical path, then fall back to input order.
#[derive(Debug, Default, Clone, Copy)]
pub struct CriticalPath;

impl SchedulingStrategy for CriticalPath {
    fn select_tasks(
        &self,
        ready: &[String],
        available_workers: usize,
        _current_rpm: Option<u32>,
        graph: Option<&TaskGraph>,
    ) -> Vec<String> {
        let Some(graph) = graph else {
            return MaxParallel.select_tasks(ready, available_workers, None, None);
        };

        let path = graph.critical_path();
        let mut sorted: Vec<String> = ready.to_vec();
        sorted.sort_by_key(|id| path.iter().position(|p| p == id).unwrap_or(usize::MAX));

        let n = sorted.len().min(available_workers);
        sorted[..n].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_graph::TaskSpec;

    fn spec(id: &str, deps: &[&str]) -> TaskSpec {
        TaskSpec {
            id: id.to_string(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            instructions: String::new(),
            workspace_path: format!("/work/{id}"),
            worker_type: None,
            estimated_rpm: None,
        }
    }

    #[test]
    fn test_max_parallel_truncates_to_available_workers() {
        let ready = vec!["A".into(), "B".into(), "C".into()];
        let picked = MaxParallel.select_tasks(&ready, 2, None, None);
        assert_eq!(picked, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_rate_aware_limits_by_headroom() {
        let ready: Vec<String> = (0..10).map(|i| format!("T{i}")).collect();
        let strategy = RateAware {
            max_rpm: 100,
            estimated_rpm_per_task: 40,
        };
        let picked = strategy.select_tasks(&ready, 10, Some(0), None);
        assert_eq!(picked.len(), 2); // floor(100/40)
    }

    #[test]
    fn test_rate_aware_zero_headroom_returns_empty() {
        let ready = vec!["A".into()];
        let strategy = RateAware {
            max_rpm: 100,
            estimated_rpm_per_task: 40,
        };
        assert!(strategy.select_tasks(&ready, 5, Some(100), None).is_empty());
    }

    #[test]
    fn test_rate_aware_zero_estimate_returns_empty() {
        let ready = vec!["A".into()];
        let strategy = RateAware {
            max_rpm: 100,
            estimated_rpm_per_task: 0,
        };
        assert!(strategy.select_tasks(&ready, 5, Some(0), None).is_empty());
    }

    #[test]
    fn test_critical_path_prioritizes_path_members() {
        let graph = TaskGraph::new(vec![spec("A", &[]), spec("B", &["A"]), spec("C", &["B"]), spec("D", &["A"])])
            .unwrap();

        let ready = vec!["D".to_string(), "B".to_string()]; // B on critical path A->B->C
        let picked = CriticalPath.select_tasks(&ready, 1, None, Some(&graph));
        assert_eq!(picked, vec!["B".to_string()]);
    }

    #[test]
    fn test_critical_path_falls_back_without_graph() {
        let ready = vec!["A".into(), "B".into()];
        let picked = CriticalPath.select_tasks(&ready, 1, None, None);
        assert_eq!(picked, vec!["A".to_string()]);
    }
}
