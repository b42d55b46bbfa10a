//! The execution loop: drives readiness → dispatch → completion, owning
//! task state and RPM bookkeeping behind one mutex per `spec.md` §5.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::message_channel::{Message, MessageChannelError, MessageServer, MessageType};
use crate::task_graph::{SchedulingStrategy, TaskGraph, TaskGraphError, TaskSpec, TaskState};
use crate::worker_pool::{SpawnRequest, WorkerPool, WorkerPoolError};
use crate::workspace_validator::{WorkspaceValidator, WorkspaceValidatorError};

use super::config::SchedulerConfig;
use super::events::{SchedulerEvent, SchedulerEventBus};

/// Identity the scheduler uses as `to`/`from` on the message channel.
const ORCHESTRATOR_ID: &str = "orchestrator";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Graph(#[from] TaskGraphError),

    #[error(transparent)]
    WorkerPool(#[from] WorkerPoolError),

    #[error(transparent)]
    MessageChannel(#[from] MessageChannelError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceValidatorError),

    #[error("disposed")]
    Disposed,
}

struct Inner {
    graph: TaskGraph,
    worker_mapping: HashMap<String, String>,
    assigned_rpm: HashMap<String, u32>,
    current_rpm: u32,
}

/// Drives a task DAG to completion over a worker pool and message channel.
pub struct Scheduler {
    config: SchedulerConfig,
    strategy: Box<dyn SchedulingStrategy>,
    worker_pool: Arc<WorkerPool>,
    message_server: Arc<MessageServer>,
    inner: Mutex<Inner>,
    notify: Notify,
    events: SchedulerEventBus,
    disposed: std::sync::atomic::AtomicBool,
    listener_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        tasks: Vec<TaskSpec>,
        worker_pool: Arc<WorkerPool>,
        message_server: Arc<MessageServer>,
        strategy: Box<dyn SchedulingStrategy>,
        workspace_validator: &WorkspaceValidator,
    ) -> Result<Arc<Self>, SchedulerError> {
        let validation = workspace_validator.validate(&tasks);
        if !validation.is_valid {
            return Err(SchedulerError::Workspace(WorkspaceValidatorError::Conflicts(validation.conflicts)));
        }

        let graph = TaskGraph::new(tasks)?;

        let scheduler = Arc::new(Self {
            config,
            strategy,
            worker_pool,
            message_server,
            inner: Mutex::new(Inner {
                graph,
                worker_mapping: HashMap::new(),
                assigned_rpm: HashMap::new(),
                current_rpm: 0,
            }),
            notify: Notify::new(),
            events: SchedulerEventBus::new(),
            disposed: std::sync::atomic::AtomicBool::new(false),
            listener_handle: Mutex::new(None),
        });

        let listener = spawn_message_listener(scheduler.clone());
        // Hold the handle from a blocking context is awkward here (new() is
        // sync); stash it via try_lock, which always succeeds immediately
        // after construction since no other reference exists yet.
        if let Ok(mut guard) = scheduler.listener_handle.try_lock() {
            *guard = Some(listener);
        }

        Ok(scheduler)
    }

    /// Builds the `SchedulingStrategy` named by `config.strategy` and
    /// delegates to `new`, so a `Scheduler` constructed from on-disk config
    /// actually dispatches with the strategy the config selects.
    pub fn from_config(
        config: SchedulerConfig,
        tasks: Vec<TaskSpec>,
        worker_pool: Arc<WorkerPool>,
        message_server: Arc<MessageServer>,
        workspace_validator: &WorkspaceValidator,
    ) -> Result<Arc<Self>, SchedulerError> {
        let strategy = config.strategy.build(config.max_rpm, config.estimated_rpm_per_task);
        Self::new(config, tasks, worker_pool, message_server, strategy, workspace_validator)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Run the main loop to completion per `spec.md` §4.3.
    pub async fn run(&self) -> Result<(), SchedulerError> {
        self.events.emit(SchedulerEvent::Started);
        info!("scheduler started");

        loop {
            if self.disposed.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(SchedulerError::Disposed);
            }

            let all_complete = {
                let inner = self.inner.lock().await;
                inner.graph.all_complete()
            };
            if all_complete {
                break;
            }

            // Construct the `Notified` future before re-checking readiness: a
            // `notify_waiters()` fired by `handle_task_completed`/
            // `handle_task_failed` between this point and the `.await` below
            // is still captured, since tokio guarantees a `Notified` created
            // before a notification is sent observes it even if the first
            // poll happens later. Checking the condition first and only
            // then calling `notified()` leaves a window where that signal
            // is lost and the loop can hang with no further task dispatched.
            let notified = self.notify.notified();

            let (ready, available_workers, current_rpm) = {
                let inner = self.inner.lock().await;
                let ready = inner.graph.ready_tasks();
                let running = inner
                    .graph
                    .ids()
                    .iter()
                    .filter(|id| inner.graph.get_details(id).map(|n| n.state == TaskState::Running).unwrap_or(false))
                    .count();
                let available = (self.worker_pool.max_workers() as usize).saturating_sub(running);
                (ready, available, inner.current_rpm)
            };

            if ready.is_empty() || available_workers == 0 {
                debug!(ready = ready.len(), available_workers, "run: waiting for next completion");
                notified.await;
                continue;
            }

            let pick = {
                let inner = self.inner.lock().await;
                self.strategy.select_tasks(&ready, available_workers, Some(current_rpm), Some(&inner.graph))
            };

            if pick.is_empty() {
                debug!("run: strategy returned no picks despite available slots, waiting");
                notified.await;
                continue;
            }

            for id in pick {
                if let Err(e) = self.assign(&id).await {
                    warn!(task_id = %id, error = %e, "run: assignment failed");
                }
            }
        }

        self.events.emit(SchedulerEvent::Completed);
        info!("scheduler completed");
        Ok(())
    }

    async fn assign(&self, id: &str) -> Result<(), SchedulerError> {
        let Some((instructions, workspace_path, worker_type, estimated_rpm)) = ({
            let inner = self.inner.lock().await;
            inner.graph.get_details(id).map(|node| {
                (node.instructions.clone(), node.workspace_path.clone(), node.worker_type.clone(), node.estimated_rpm)
            })
        }) else {
            warn!(task_id = id, "assign: task id from strategy pick not found in graph");
            return Ok(());
        };

        let spawn_result = self
            .worker_pool
            .spawn(SpawnRequest {
                task_id: id.to_string(),
                working_dir: workspace_path.clone(),
                system_prompt: instructions.clone(),
                mcp_servers: Vec::new(),
            })
            .await;

        let worker = match spawn_result {
            Ok(worker) => worker,
            Err(e) => {
                let mut inner = self.inner.lock().await;
                if let Some(node) = inner.graph.get_details_mut(id) {
                    node.state = TaskState::Failed;
                }
                self.events.emit(SchedulerEvent::TaskAssignFailed { task_id: id.to_string(), error: e.to_string() });
                return Err(SchedulerError::WorkerPool(e));
            }
        };

        let rpm_delta = estimated_rpm.unwrap_or(self.config.estimated_rpm_per_task);

        {
            let mut inner = self.inner.lock().await;
            inner.worker_mapping.insert(id.to_string(), worker.id.clone());
            if let Some(node) = inner.graph.get_details_mut(id) {
                node.state = TaskState::Running;
            }
            inner.assigned_rpm.insert(id.to_string(), rpm_delta);
            inner.current_rpm = inner.current_rpm.saturating_add(rpm_delta);
        }

        let msg = Message::new(
            MessageType::TaskAssignment,
            ORCHESTRATOR_ID,
            &worker.id,
            serde_json::json!({
                "taskId": id,
                "instructions": instructions,
                "workspace": workspace_path,
                "workerType": worker_type,
            }),
        );
        self.message_server.send(&worker.id, msg).await;

        self.events.emit(SchedulerEvent::TaskAssigned { task_id: id.to_string(), worker_id: worker.id.clone() });
        Ok(())
    }

    async fn handle_task_completed(&self, task_id: &str) {
        {
            let mut inner = self.inner.lock().await;
            inner.graph.mark_completed(task_id);
            if let Some(node) = inner.graph.get_details_mut(task_id) {
                node.state = TaskState::Completed;
            }
            let delta = inner.assigned_rpm.remove(task_id).unwrap_or(0);
            inner.current_rpm = inner.current_rpm.saturating_sub(delta);
        }
        self.worker_pool.terminate(task_id).await;
        self.events.emit(SchedulerEvent::TaskCompleted { task_id: task_id.to_string() });
        self.notify.notify_waiters();
    }

    async fn handle_task_failed(&self, task_id: &str, error: String) {
        {
            let mut inner = self.inner.lock().await;
            if let Some(node) = inner.graph.get_details_mut(task_id) {
                node.state = TaskState::Failed;
            }
            let delta = inner.assigned_rpm.remove(task_id).unwrap_or(0);
            inner.current_rpm = inner.current_rpm.saturating_sub(delta);
        }
        self.worker_pool.terminate(task_id).await;
        self.events.emit(SchedulerEvent::TaskFailed { task_id: task_id.to_string(), error });
        self.notify.notify_waiters();
    }

    pub async fn dispose(&self) {
        self.disposed.store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(handle) = self.listener_handle.lock().await.take() {
            handle.abort();
        }
        self.notify.notify_waiters();
    }
}

fn spawn_message_listener(scheduler: Arc<Scheduler>) -> tokio::task::JoinHandle<()> {
    let mut events = scheduler.message_server.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(crate::message_channel::ChannelEvent::Message(msg)) => {
                    if msg.to != ORCHESTRATOR_ID {
                        continue;
                    }
                    match msg.message_type {
                        MessageType::TaskCompleted => {
                            if let Some(task_id) = msg.payload.get("taskId").and_then(|v| v.as_str()) {
                                scheduler.handle_task_completed(task_id).await;
                            }
                        }
                        MessageType::TaskFailed => {
                            if let Some(task_id) = msg.payload.get("taskId").and_then(|v| v.as_str()) {
                                let error = msg
                                    .payload
                                    .get("error")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("unknown error")
                                    .to_string();
                                scheduler.handle_task_failed(task_id, error).await;
                            }
                        }
                        _ => {}
                    }
                }
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "message listener lagged behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    error!("message listener channel closed");
                    break;
                }
            }
        }
    })
}
