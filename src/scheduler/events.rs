//! Scheduler lifecycle events, broadcast the way the teacher's `EventBus`
//! streams loop activity to its TUI and file logger.

use tokio::sync::broadcast;

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Started,
    TaskAssigned { task_id: String, worker_id: String },
    TaskCompleted { task_id: String },
    TaskFailed { task_id: String, error: String },
    TaskAssignFailed { task_id: String, error: String },
    Completed,
    Error(String),
}

pub(crate) struct SchedulerEventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl SchedulerEventBus {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub(crate) fn emit(&self, event: SchedulerEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = SchedulerEventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(SchedulerEvent::Started);
        assert!(matches!(rx.recv().await.unwrap(), SchedulerEvent::Started));
    }

    #[tokio::test]
    async fn test_emit_without_subscriber_does_not_panic() {
        let bus = SchedulerEventBus::new();
        bus.emit(SchedulerEvent::Completed);
    }
}
