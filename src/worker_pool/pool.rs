//! The worker pool itself: bounded, tracked, torn down with timeouts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use super::config::WorkerPoolConfig;
use super::session::{Session, SessionEvent, SessionFactory, SessionOptions};

const TERMINATE_GRACE: Duration = Duration::from_millis(100);
const WAIT_FOR_ALL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum WorkerPoolError {
    #[error("worker pool is at capacity")]
    LimitExceeded,

    #[error("a worker with id '{0}' is already tracked")]
    DuplicateId(String),

    #[error("spawning worker '{0}' timed out")]
    SpawnTimeout(String),

    #[error("no worker tracked with id '{0}'")]
    NotFound(String),

    #[error(transparent)]
    Session(#[from] super::session::SessionError),

    #[error(transparent)]
    InvalidConfig(#[from] super::config::WorkerPoolConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerStatus {
    Idle,
    Busy,
    Error,
    Terminated,
}

pub struct WorkerInstance {
    pub id: String,
    pub working_dir: String,
    pub created_at: i64,
    status: Mutex<WorkerStatus>,
    session: Arc<dyn Session>,
    event_listener: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WorkerInstance {
    pub async fn status(&self) -> WorkerStatus {
        *self.status.lock().await
    }

    async fn set_status(&self, status: WorkerStatus) {
        *self.status.lock().await = status;
    }
}

/// Registers the session-event handlers named in `spec.md` §4.4: started
/// moves the worker to busy, completed to idle, aborted/tool-failure to
/// error. Runs for the lifetime of the instance; `terminate` aborts it.
fn spawn_event_listener(instance: Arc<WorkerInstance>) -> tokio::task::JoinHandle<()> {
    let mut events = instance.session.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Started) => instance.set_status(WorkerStatus::Busy).await,
                Ok(SessionEvent::Completed) => instance.set_status(WorkerStatus::Idle).await,
                Ok(SessionEvent::Aborted) => instance.set_status(WorkerStatus::Error).await,
                Ok(SessionEvent::ToolFailed { error }) => {
                    warn!(worker_id = %instance.id, error, "session tool failure");
                    instance.set_status(WorkerStatus::Error).await;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

pub struct SpawnRequest {
    pub task_id: String,
    pub working_dir: String,
    pub system_prompt: String,
    pub mcp_servers: Vec<String>,
}

/// Bounded pool of worker sessions, spawned via an injected `SessionFactory`
/// so the core never depends on how a worker is actually implemented.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    factory: Arc<dyn SessionFactory>,
    workers: Mutex<HashMap<String, Arc<WorkerInstance>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, factory: Arc<dyn SessionFactory>) -> Result<Arc<Self>, WorkerPoolError> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            factory,
            workers: Mutex::new(HashMap::new()),
        }))
    }

    pub async fn spawn(&self, req: SpawnRequest) -> Result<Arc<WorkerInstance>, WorkerPoolError> {
        {
            let workers = self.workers.lock().await;
            if workers.len() as u32 >= self.config.max_workers {
                return Err(WorkerPoolError::LimitExceeded);
            }
            if workers.contains_key(&req.task_id) {
                return Err(WorkerPoolError::DuplicateId(req.task_id));
            }
        }

        let options = SessionOptions {
            instructions: req.system_prompt,
            workspace_path: req.working_dir.clone(),
            ..SessionOptions::default()
        };

        let create = self.factory.create(options);
        let session = match tokio::time::timeout(
            Duration::from_millis(self.config.spawn_timeout_ms),
            create,
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Err(WorkerPoolError::Session(e)),
            Err(_) => {
                warn!(task_id = %req.task_id, "spawn: timed out, attempting cleanup");
                if self.config.auto_cleanup {
                    // Best effort: nothing was tracked yet, so there is nothing to
                    // abort beyond the factory-internal partial state.
                }
                return Err(WorkerPoolError::SpawnTimeout(req.task_id));
            }
        };

        // Starts idle per `spec.md` §4.4; the event listener is subscribed
        // before the caller (or a test) can possibly drive the session's
        // `started` event, so the idle → busy transition is always reachable.
        let instance = Arc::new(WorkerInstance {
            id: req.task_id.clone(),
            working_dir: req.working_dir,
            created_at: Utc::now().timestamp_millis(),
            status: Mutex::new(WorkerStatus::Idle),
            session,
            event_listener: Mutex::new(None),
        });

        let listener = spawn_event_listener(instance.clone());
        if let Ok(mut guard) = instance.event_listener.try_lock() {
            *guard = Some(listener);
        }

        let mut workers = self.workers.lock().await;
        if workers.contains_key(&req.task_id) {
            return Err(WorkerPoolError::DuplicateId(req.task_id));
        }
        workers.insert(req.task_id.clone(), instance.clone());
        debug!(task_id = %req.task_id, pool_size = workers.len(), "spawn: worker tracked");
        Ok(instance)
    }

    /// Idempotent: absent ids are a no-op.
    pub async fn terminate(&self, id: &str) {
        let instance = {
            let mut workers = self.workers.lock().await;
            workers.remove(id)
        };
        let Some(instance) = instance else {
            return;
        };

        if let Some(handle) = instance.event_listener.lock().await.take() {
            handle.abort();
        }
        instance.set_status(WorkerStatus::Terminated).await;
        instance.session.abort().await;
        tokio::time::sleep(TERMINATE_GRACE).await;
        instance.session.dispose().await;
        info!(id, "terminate: worker removed");
    }

    pub async fn cleanup(&self) {
        let ids: Vec<String> = {
            let workers = self.workers.lock().await;
            workers.keys().cloned().collect()
        };
        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            let instance = {
                let mut workers = self.workers.lock().await;
                workers.remove(&id)
            };
            if let Some(instance) = instance {
                handles.push(tokio::spawn(async move {
                    if let Some(handle) = instance.event_listener.lock().await.take() {
                        handle.abort();
                    }
                    instance.set_status(WorkerStatus::Terminated).await;
                    instance.session.abort().await;
                    tokio::time::sleep(TERMINATE_GRACE).await;
                    instance.session.dispose().await;
                }));
            }
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "cleanup: worker termination task panicked");
            }
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<WorkerInstance>> {
        self.workers.lock().await.get(id).cloned()
    }

    pub async fn status_of(&self, id: &str) -> Option<WorkerStatus> {
        match self.workers.lock().await.get(id) {
            Some(instance) => Some(instance.status().await),
            None => None,
        }
    }

    pub async fn active(&self) -> Vec<Arc<WorkerInstance>> {
        let workers = self.workers.lock().await;
        let mut result = Vec::new();
        for instance in workers.values() {
            if instance.status().await == WorkerStatus::Busy {
                result.push(instance.clone());
            }
        }
        result
    }

    pub async fn pool_size(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub fn max_workers(&self) -> u32 {
        self.config.max_workers
    }

    /// Resolves once every worker's status is in {idle, error, terminated}.
    /// Returns immediately if the pool is empty.
    pub async fn wait_for_all(&self) {
        loop {
            let workers: Vec<Arc<WorkerInstance>> = self.workers.lock().await.values().cloned().collect();
            if workers.is_empty() {
                return;
            }
            let mut all_settled = true;
            for instance in &workers {
                if instance.status().await == WorkerStatus::Busy {
                    all_settled = false;
                    break;
                }
            }
            if all_settled {
                return;
            }
            tokio::time::sleep(WAIT_FOR_ALL_POLL).await;
        }
    }

    /// Mark a worker idle (e.g. once its assigned task completes) without
    /// removing it from the pool.
    pub async fn mark_idle(&self, id: &str) {
        if let Some(instance) = self.workers.lock().await.get(id) {
            instance.set_status(WorkerStatus::Idle).await;
        }
    }

    pub async fn mark_error(&self, id: &str) {
        if let Some(instance) = self.workers.lock().await.get(id) {
            instance.set_status(WorkerStatus::Error).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker_pool::session::{InProcessSession, InProcessSessionFactory, SessionError};

    /// A factory that hands back the same `InProcessSession` every time, so
    /// a test can drive its events directly after `spawn` returns.
    struct FixedSessionFactory(Arc<InProcessSession>);

    #[async_trait::async_trait]
    impl SessionFactory for FixedSessionFactory {
        async fn create(&self, _options: SessionOptions) -> Result<Arc<dyn Session>, SessionError> {
            Ok(self.0.clone() as Arc<dyn Session>)
        }
    }

    /// Hands back pre-built sessions in call order, so a test can track each
    /// spawned worker's underlying session independently.
    struct SequencedSessionFactory(std::sync::Mutex<std::collections::VecDeque<Arc<InProcessSession>>>);

    impl SequencedSessionFactory {
        fn new(sessions: Vec<Arc<InProcessSession>>) -> Self {
            Self(std::sync::Mutex::new(sessions.into()))
        }
    }

    #[async_trait::async_trait]
    impl SessionFactory for SequencedSessionFactory {
        async fn create(&self, _options: SessionOptions) -> Result<Arc<dyn Session>, SessionError> {
            let session = self.0.lock().unwrap().pop_front().expect("factory exhausted");
            Ok(session as Arc<dyn Session>)
        }
    }

    fn config(max_workers: u32) -> WorkerPoolConfig {
        WorkerPoolConfig {
            max_workers,
            spawn_timeout_ms: 1000,
            auto_cleanup: true,
        }
    }

    fn req(task_id: &str) -> SpawnRequest {
        SpawnRequest {
            task_id: task_id.to_string(),
            working_dir: "/tmp/ws".to_string(),
            system_prompt: "do the task".to_string(),
            mcp_servers: vec![],
        }
    }

    #[tokio::test]
    async fn test_spawn_and_terminate() {
        let pool = WorkerPool::new(config(5), Arc::new(InProcessSessionFactory)).unwrap();
        let worker = pool.spawn(req("task-1")).await.unwrap();
        assert_eq!(worker.id, "task-1");
        assert_eq!(pool.pool_size().await, 1);

        pool.terminate("task-1").await;
        assert_eq!(pool.pool_size().await, 0);
        assert!(pool.get("task-1").await.is_none());
    }

    #[tokio::test]
    async fn test_terminate_unknown_id_is_noop() {
        let pool = WorkerPool::new(config(5), Arc::new(InProcessSessionFactory)).unwrap();
        pool.terminate("nope").await; // must not panic
    }

    #[tokio::test]
    async fn test_terminate_twice_is_noop() {
        let pool = WorkerPool::new(config(5), Arc::new(InProcessSessionFactory)).unwrap();
        pool.spawn(req("task-1")).await.unwrap();
        pool.terminate("task-1").await;
        pool.terminate("task-1").await; // second call is a no-op
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let pool = WorkerPool::new(config(5), Arc::new(InProcessSessionFactory)).unwrap();
        pool.spawn(req("task-1")).await.unwrap();
        let result = pool.spawn(req("task-1")).await;
        assert!(matches!(result, Err(WorkerPoolError::DuplicateId(ref id)) if id == "task-1"));
    }

    #[tokio::test]
    async fn test_limit_exceeded() {
        let pool = WorkerPool::new(config(2), Arc::new(InProcessSessionFactory)).unwrap();
        pool.spawn(req("task-1")).await.unwrap();
        pool.spawn(req("task-2")).await.unwrap();
        let result = pool.spawn(req("task-3")).await;
        assert!(matches!(result, Err(WorkerPoolError::LimitExceeded)));
    }

    #[tokio::test]
    async fn test_active_only_returns_busy() {
        let session_one = InProcessSession::new();
        let session_two = InProcessSession::new();
        let factory = SequencedSessionFactory::new(vec![session_one.clone(), session_two.clone()]);
        let pool = WorkerPool::new(config(5), Arc::new(factory)).unwrap();

        pool.spawn(req("task-1")).await.unwrap();
        pool.spawn(req("task-2")).await.unwrap();

        // Both start idle; only task-2's session reports started.
        session_two.emit_started();
        tokio::time::timeout(Duration::from_millis(200), async {
            while pool.status_of("task-2").await != Some(WorkerStatus::Busy) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("task-2 should transition to busy after a started event");

        let active = pool.active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "task-2");
    }

    #[tokio::test]
    async fn test_wait_for_all_returns_immediately_when_empty() {
        let pool = WorkerPool::new(config(5), Arc::new(InProcessSessionFactory)).unwrap();
        tokio::time::timeout(Duration::from_millis(100), pool.wait_for_all())
            .await
            .expect("wait_for_all should resolve immediately on an empty pool");
    }

    #[tokio::test]
    async fn test_wait_for_all_resolves_once_settled() {
        let session = InProcessSession::new();
        let pool = WorkerPool::new(config(5), Arc::new(FixedSessionFactory(session.clone()))).unwrap();
        pool.spawn(req("task-1")).await.unwrap();
        session.emit_started();
        tokio::time::timeout(Duration::from_millis(200), async {
            while pool.status_of("task-1").await != Some(WorkerStatus::Busy) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("task-1 should become busy before the settle race starts");

        let pool_clone = pool.clone();
        let settler = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            pool_clone.mark_idle("task-1").await;
        });

        tokio::time::timeout(Duration::from_millis(500), pool.wait_for_all())
            .await
            .expect("wait_for_all should resolve once the worker settles");
        settler.await.unwrap();
    }

    #[tokio::test]
    async fn test_config_boundary_two_and_fifty_succeed() {
        assert!(WorkerPool::new(config(2), Arc::new(InProcessSessionFactory)).is_ok());
        assert!(WorkerPool::new(config(50), Arc::new(InProcessSessionFactory)).is_ok());
    }

    #[tokio::test]
    async fn test_config_boundary_one_and_fifty_one_fail() {
        assert!(WorkerPool::new(config(1), Arc::new(InProcessSessionFactory)).is_err());
        assert!(WorkerPool::new(config(51), Arc::new(InProcessSessionFactory)).is_err());
    }

    #[tokio::test]
    async fn test_cleanup_terminates_all_workers() {
        let pool = WorkerPool::new(config(5), Arc::new(InProcessSessionFactory)).unwrap();
        pool.spawn(req("task-1")).await.unwrap();
        pool.spawn(req("task-2")).await.unwrap();
        pool.cleanup().await;
        assert_eq!(pool.pool_size().await, 0);
    }

    #[tokio::test]
    async fn test_session_started_then_completed_event_transitions() {
        let session = InProcessSession::new();
        let pool = WorkerPool::new(config(5), Arc::new(FixedSessionFactory(session.clone()))).unwrap();
        pool.spawn(req("task-1")).await.unwrap();
        assert_eq!(pool.status_of("task-1").await, Some(WorkerStatus::Idle));

        session.emit_started();
        tokio::time::timeout(Duration::from_millis(200), async {
            while pool.status_of("task-1").await != Some(WorkerStatus::Busy) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("status should transition to busy after a started event");

        session.emit_completed();
        tokio::time::timeout(Duration::from_millis(200), async {
            while pool.status_of("task-1").await != Some(WorkerStatus::Idle) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("status should transition to idle after a completed event");
    }

    #[tokio::test]
    async fn test_session_tool_failure_event_transitions_to_error() {
        let session = InProcessSession::new();
        let pool = WorkerPool::new(config(5), Arc::new(FixedSessionFactory(session.clone()))).unwrap();
        pool.spawn(req("task-1")).await.unwrap();

        session.emit_tool_failed("boom");
        tokio::time::timeout(Duration::from_millis(200), async {
            while pool.status_of("task-1").await != Some(WorkerStatus::Error) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("status should transition to error after a tool failure event");
    }

    #[tokio::test]
    async fn test_session_aborted_event_transitions_to_error() {
        let session = InProcessSession::new();
        let pool = WorkerPool::new(config(5), Arc::new(FixedSessionFactory(session.clone()))).unwrap();
        pool.spawn(req("task-1")).await.unwrap();

        session.abort().await;
        tokio::time::timeout(Duration::from_millis(200), async {
            while pool.status_of("task-1").await != Some(WorkerStatus::Error) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("status should transition to error after an aborted event");
    }
}
