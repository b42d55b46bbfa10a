//! Server side of the channel: the orchestrator's TCP loopback endpoint.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use super::config::MessageChannelConfig;
use super::message::Message;

#[derive(Debug, Error)]
pub enum MessageChannelError {
    #[error("failed to bind loopback listener: {0}")]
    Bind(String),

    #[error("send failed: destination '{0}' is not connected")]
    SendFailure(String),

    #[error("timeout waiting for message after {0:?}")]
    Timeout(Duration),

    #[error("disposed")]
    Disposed,
}

/// Optional fallback transport for a destination marked remote.
#[async_trait]
pub trait RemoteSink: Send + Sync {
    async fn send(&self, msg: Message);
}

/// Events observable on the channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Message(Message),
    WorkerConnected(String),
    WorkerDisconnected(String),
    RemoteMessage(Message),
    Error(String),
}

struct Waiter {
    filter: Arc<dyn Fn(&Message) -> bool + Send + Sync>,
    tx: oneshot::Sender<Message>,
}

struct Inner {
    connections: HashMap<String, mpsc::UnboundedSender<String>>,
    queues: HashMap<String, VecDeque<Message>>,
    waiters: Vec<Waiter>,
    remote_marked: HashSet<String>,
}

/// Server endpoint: binds a loopback TCP port and speaks newline-delimited
/// JSON with each connected worker.
pub struct MessageServer {
    config: MessageChannelConfig,
    inner: Arc<Mutex<Inner>>,
    events_tx: broadcast::Sender<ChannelEvent>,
    remote_sink: Option<Arc<dyn RemoteSink>>,
    local_addr: std::net::SocketAddr,
    accept_handle: tokio::task::JoinHandle<()>,
}

impl MessageServer {
    pub async fn bind(
        config: MessageChannelConfig,
        remote_sink: Option<Arc<dyn RemoteSink>>,
    ) -> Result<Self, MessageChannelError> {
        let addr = format!("127.0.0.1:{}", config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| MessageChannelError::Bind(e.to_string()))?;
        let local_addr = listener.local_addr().map_err(|e| MessageChannelError::Bind(e.to_string()))?;

        let inner = Arc::new(Mutex::new(Inner {
            connections: HashMap::new(),
            queues: HashMap::new(),
            waiters: Vec::new(),
            remote_marked: HashSet::new(),
        }));
        let (events_tx, _) = broadcast::channel(4096);

        let accept_handle = spawn_accept_loop(listener, inner.clone(), events_tx.clone(), config.clone());

        Ok(Self {
            config,
            inner,
            events_tx,
            remote_sink,
            local_addr,
            accept_handle,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events_tx.subscribe()
    }

    /// Mark a destination as remote: local `send` is skipped and the
    /// message is handed straight to the remote sink.
    pub async fn mark_remote(&self, worker_id: &str) {
        self.inner.lock().await.remote_marked.insert(worker_id.to_string());
    }

    /// Write a message to the bound socket for `worker_id`. Returns `false`
    /// if unbound, after attempting the configured remote fallback.
    pub async fn send(&self, worker_id: &str, msg: Message) -> bool {
        let is_remote_marked = {
            let inner = self.inner.lock().await;
            inner.remote_marked.contains(worker_id)
        };

        if is_remote_marked {
            self.fallback(msg).await;
            return false;
        }

        let line = match msg.to_line() {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "failed to serialize outgoing message");
                return false;
            }
        };

        let tx = {
            let inner = self.inner.lock().await;
            inner.connections.get(worker_id).cloned()
        };

        match tx {
            Some(tx) => {
                if tx.send(line).is_ok() {
                    true
                } else {
                    self.fallback(msg).await;
                    false
                }
            }
            None => {
                self.fallback(msg).await;
                false
            }
        }
    }

    async fn fallback(&self, msg: Message) {
        if self.config.enable_remote_fallback {
            if let Some(sink) = &self.remote_sink {
                sink.send(msg.clone()).await;
            }
            let _ = self.events_tx.send(ChannelEvent::RemoteMessage(msg));
        }
    }

    pub async fn broadcast(&self, msg: Message) {
        let line = match msg.to_line() {
            Ok(l) => l,
            Err(_) => return,
        };
        let inner = self.inner.lock().await;
        for tx in inner.connections.values() {
            let _ = tx.send(line.clone());
        }
    }

    /// First queued or future message matching `filter`, or a timeout.
    pub async fn wait_for_message(
        &self,
        filter: impl Fn(&Message) -> bool + Send + Sync + 'static,
        timeout_ms: u64,
    ) -> Result<Message, MessageChannelError> {
        let filter: Arc<dyn Fn(&Message) -> bool + Send + Sync> = Arc::new(filter);

        {
            let mut inner = self.inner.lock().await;
            for queue in inner.queues.values_mut() {
                if let Some(pos) = queue.iter().position(|m| (filter)(m)) {
                    return Ok(queue.remove(pos).unwrap());
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            inner.waiters.push(Waiter { filter, tx });
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(msg)) => Ok(msg),
            _ => Err(MessageChannelError::Timeout(Duration::from_millis(timeout_ms))),
        }
    }

    pub async fn stop(&self) {
        self.accept_handle.abort();
        let mut inner = self.inner.lock().await;
        inner.connections.clear();
        inner.queues.clear();
        for waiter in inner.waiters.drain(..) {
            drop(waiter.tx); // resolves awaiters with a dropped-channel error
        }
    }
}

fn spawn_accept_loop(
    listener: TcpListener,
    inner: Arc<Mutex<Inner>>,
    events_tx: broadcast::Sender<ChannelEvent>,
    config: MessageChannelConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, _addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let inner = inner.clone();
            let events_tx = events_tx.clone();
            let config = config.clone();
            tokio::spawn(handle_connection(stream, inner, events_tx, config));
        }
    })
}

async fn handle_connection(
    stream: TcpStream,
    inner: Arc<Mutex<Inner>>,
    events_tx: broadcast::Sender<ChannelEvent>,
    config: MessageChannelConfig,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut bound_id: Option<String> = None;
    let mut line = String::new();

    loop {
        line.clear();
        let bytes = match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "connection read error");
                break;
            }
        };
        let _ = bytes;

        let msg = match Message::from_line(&line) {
            Ok(m) => m,
            Err(e) => {
                let _ = events_tx.send(ChannelEvent::Error(format!("malformed message: {e}")));
                continue;
            }
        };

        if bound_id.is_none() {
            bound_id = Some(msg.from.clone());
            inner.lock().await.connections.insert(msg.from.clone(), line_tx.clone());
            let _ = events_tx.send(ChannelEvent::WorkerConnected(msg.from.clone()));
        }

        debug!(from = %msg.from, message_type = ?msg.message_type, "server received message");

        let resolved = {
            let mut inner_guard = inner.lock().await;
            if let Some(pos) = inner_guard.waiters.iter().position(|w| (w.filter)(&msg)) {
                let waiter = inner_guard.waiters.remove(pos);
                let _ = waiter.tx.send(msg.clone());
                true
            } else {
                false
            }
        };

        if !resolved {
            let mut inner_guard = inner.lock().await;
            let queue = inner_guard.queues.entry(msg.to.clone()).or_default();
            if queue.len() >= config.max_queue_size {
                queue.pop_front();
            }
            queue.push_back(msg.clone());
        }

        let _ = events_tx.send(ChannelEvent::Message(msg));
    }

    writer_task.abort();
    if let Some(id) = bound_id {
        inner.lock().await.connections.remove(&id);
        let _ = events_tx.send(ChannelEvent::WorkerDisconnected(id));
    }
}
