//! Brokers the asynchronous review protocol between producer workers and
//! reviewer workers (`spec.md` §4.8).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::message_channel::{ChannelEvent, Message, MessageServer, MessageType};
use crate::worker_pool::{SpawnRequest, WorkerPool, WorkerPoolError};

const DEFAULT_APPROVAL_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, Error)]
pub enum ReviewCoordinatorError {
    #[error(transparent)]
    WorkerPool(#[from] WorkerPoolError),

    #[error("timed out waiting for review approval")]
    Timeout,

    #[error("a wait is already pending for task '{0}'")]
    AlreadyWaiting(String),

    #[error("disposed")]
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Specialization {
    Security,
    Performance,
    Style,
}

impl Specialization {
    fn as_str(self) -> &'static str {
        match self {
            Self::Security => "security",
            Self::Performance => "performance",
            Self::Style => "style",
        }
    }

    fn system_prompt(self) -> &'static str {
        match self {
            Self::Security => "You are a security-focused code reviewer. Flag auth, injection, and secret-handling issues.",
            Self::Performance => "You are a performance-focused code reviewer. Flag algorithmic complexity and resource usage issues.",
            Self::Style => "You are a style and correctness reviewer. Flag readability and maintainability issues.",
        }
    }

    /// Infer from keywords in a task id, case-insensitive substring match.
    fn infer(task_id: &str) -> Self {
        let lower = task_id.to_lowercase();
        const SECURITY_KEYWORDS: &[&str] = &["auth", "security", "login", "password", "token", "encrypt"];
        const PERFORMANCE_KEYWORDS: &[&str] = &["optimize", "performance", "cache", "query", "index", "batch"];

        if SECURITY_KEYWORDS.iter().any(|k| lower.contains(k)) {
            Self::Security
        } else if PERFORMANCE_KEYWORDS.iter().any(|k| lower.contains(k)) {
            Self::Performance
        } else {
            Self::Style
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub task_id: String,
    pub worker_id: String,
    pub files_changed: Vec<String>,
    pub description: String,
    pub specialization: Option<Specialization>,
}

#[derive(Debug, Clone)]
pub struct ReviewHandle {
    pub review_id: String,
    pub reviewer_id: String,
    pub status: &'static str,
}

#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub approved: bool,
    pub reviewer_id: String,
    pub feedback: String,
    pub suggestions: Vec<String>,
    pub issues: Vec<String>,
}

struct PendingWait {
    tx: oneshot::Sender<Result<ReviewOutcome, ReviewCoordinatorError>>,
}

struct Inner {
    active_reviewers: HashMap<&'static str, String>,
    pending: HashMap<String, PendingWait>,
}

/// Coordinates review requests between producer and reviewer workers.
pub struct ReviewCoordinator {
    worker_pool: Arc<WorkerPool>,
    message_server: Arc<MessageServer>,
    inner: Mutex<Inner>,
    listener_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ReviewCoordinator {
    pub fn new(worker_pool: Arc<WorkerPool>, message_server: Arc<MessageServer>) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            worker_pool,
            message_server,
            inner: Mutex::new(Inner {
                active_reviewers: HashMap::new(),
                pending: HashMap::new(),
            }),
            listener_handle: Mutex::new(None),
        });

        let handle = spawn_review_listener(coordinator.clone());
        if let Ok(mut guard) = coordinator.listener_handle.try_lock() {
            *guard = Some(handle);
        }

        coordinator
    }

    pub async fn request_review(&self, req: ReviewRequest) -> Result<ReviewHandle, ReviewCoordinatorError> {
        let specialization = req.specialization.unwrap_or_else(|| Specialization::infer(&req.task_id));
        let reviewer_id = self.ensure_reviewer(specialization).await?;

        let review_id = format!("review-{}", short_uuid());
        let msg = Message::new(
            MessageType::ReviewRequest,
            &req.worker_id,
            &reviewer_id,
            serde_json::json!({
                "reviewId": review_id,
                "taskId": req.task_id,
                "filesChanged": req.files_changed,
                "description": req.description,
            }),
        );
        self.message_server.send(&reviewer_id, msg).await;

        Ok(ReviewHandle {
            review_id,
            reviewer_id,
            status: "pending",
        })
    }

    async fn ensure_reviewer(&self, specialization: Specialization) -> Result<String, ReviewCoordinatorError> {
        let key = specialization.as_str();

        {
            let inner = self.inner.lock().await;
            if let Some(id) = inner.active_reviewers.get(key) {
                return Ok(id.clone());
            }
        }

        let reviewer_id = format!("reviewer-{}-{}", key, short_uuid());
        self.worker_pool
            .spawn(SpawnRequest {
                task_id: reviewer_id.clone(),
                working_dir: "/".to_string(),
                system_prompt: specialization.system_prompt().to_string(),
                mcp_servers: Vec::new(),
            })
            .await?;

        // A concurrent caller may have raced us to this specialization; keep
        // whichever reviewer landed first and leave the loser's worker
        // running idle rather than tearing it down here.
        let mut inner = self.inner.lock().await;
        inner.active_reviewers.entry(key).or_insert_with(|| reviewer_id.clone());
        Ok(inner.active_reviewers.get(key).unwrap().clone())
    }

    /// Suspends until a matching `review-approved`/`review-rejected` arrives
    /// or `timeout_ms` elapses. At most one outstanding wait per `task_id`.
    pub async fn wait_for_approval(
        &self,
        task_id: &str,
        timeout_ms: Option<u64>,
    ) -> Result<ReviewOutcome, ReviewCoordinatorError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            if inner.pending.contains_key(task_id) {
                return Err(ReviewCoordinatorError::AlreadyWaiting(task_id.to_string()));
            }
            inner.pending.insert(task_id.to_string(), PendingWait { tx });
        }

        let timeout = Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_APPROVAL_TIMEOUT_MS));
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ReviewCoordinatorError::Disposed),
            Err(_) => {
                self.inner.lock().await.pending.remove(task_id);
                Err(ReviewCoordinatorError::Timeout)
            }
        }
    }

    async fn resolve(&self, task_id: &str, outcome: ReviewOutcome) {
        let waiter = self.inner.lock().await.pending.remove(task_id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.tx.send(Ok(outcome));
            }
            None => {
                debug!(task_id, "resolve: no pending wait for task id, discarding");
            }
        }
    }

    pub async fn dispose(&self) {
        if let Some(handle) = self.listener_handle.lock().await.take() {
            handle.abort();
        }
        let mut inner = self.inner.lock().await;
        for (_, waiter) in inner.pending.drain() {
            let _ = waiter.tx.send(Err(ReviewCoordinatorError::Disposed));
        }
        inner.active_reviewers.clear();
        info!("review coordinator disposed");
    }
}

fn short_uuid() -> String {
    Uuid::now_v7().to_string()[..8].to_string()
}

fn spawn_review_listener(coordinator: Arc<ReviewCoordinator>) -> tokio::task::JoinHandle<()> {
    let mut events = coordinator.message_server.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ChannelEvent::Message(msg)) => {
                    let approved = match msg.message_type {
                        MessageType::ReviewApproved => true,
                        MessageType::ReviewRejected => false,
                        _ => continue,
                    };

                    let Some(task_id) = msg.payload.get("taskId").and_then(|v| v.as_str()) else {
                        continue;
                    };

                    let feedback = msg
                        .payload
                        .get("feedback")
                        .and_then(|v| v.as_str())
                        .unwrap_or("no feedback provided")
                        .to_string();
                    let suggestions = json_string_array(&msg.payload, "suggestions");
                    let issues = json_string_array(&msg.payload, "issues");

                    coordinator
                        .resolve(
                            task_id,
                            ReviewOutcome {
                                approved,
                                reviewer_id: msg.from.clone(),
                                feedback,
                                suggestions,
                                issues,
                            },
                        )
                        .await;
                }
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "review listener lagged behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn json_string_array(payload: &serde_json::Value, key: &str) -> Vec<String> {
    payload
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}
