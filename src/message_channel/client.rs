//! Worker-side client for the message channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, warn};

use super::config::MessageChannelConfig;
use super::message::Message;
use super::server::{ChannelEvent, MessageChannelError};

/// Client endpoint: connects to the orchestrator's loopback port and
/// reconnects with exponential backoff on disconnect.
pub struct MessageClient {
    config: MessageChannelConfig,
    write_tx: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    events_tx: broadcast::Sender<ChannelEvent>,
    connect_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MessageClient {
    /// Connect to `addr`, spawning a background task that re-connects with
    /// exponential backoff (`reconnect_delay_ms * 2^(attempt-1)`) on
    /// disconnect, up to `max_reconnect_attempts`.
    pub async fn connect(addr: std::net::SocketAddr, config: MessageChannelConfig) -> Result<Self, MessageChannelError> {
        let write_tx = Arc::new(Mutex::new(None));
        let (events_tx, _) = broadcast::channel(1024);

        let client = Self {
            config: config.clone(),
            write_tx: write_tx.clone(),
            events_tx: events_tx.clone(),
            connect_task: Mutex::new(None),
        };

        client.connect_once(addr).await?;

        let write_tx_loop = write_tx.clone();
        let events_tx_loop = events_tx.clone();
        let config_loop = config.clone();
        let handle = tokio::spawn(async move {
            reconnect_loop(addr, config_loop, write_tx_loop, events_tx_loop).await;
        });
        *client.connect_task.lock().await = Some(handle);

        Ok(client)
    }

    async fn connect_once(&self, addr: std::net::SocketAddr) -> Result<(), MessageChannelError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| MessageChannelError::Bind(e.to_string()))?;
        let (write_tx, _read_task) = spawn_stream(stream, self.events_tx.clone());
        *self.write_tx.lock().await = Some(write_tx);
        let _ = self.events_tx.send(ChannelEvent::WorkerConnected("self".to_string()));
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events_tx.subscribe()
    }

    /// Write a single framed line. Fails if currently disconnected.
    pub async fn send(&self, msg: Message) -> Result<(), MessageChannelError> {
        let line = msg
            .to_line()
            .map_err(|e| MessageChannelError::SendFailure(e.to_string()))?;
        let guard = self.write_tx.lock().await;
        match guard.as_ref() {
            Some(tx) if tx.send(line).is_ok() => Ok(()),
            _ => Err(MessageChannelError::SendFailure(msg.to.clone())),
        }
    }

    pub async fn disconnect(&self) {
        if let Some(handle) = self.connect_task.lock().await.take() {
            handle.abort();
        }
        *self.write_tx.lock().await = None;
    }
}

fn spawn_stream(
    stream: TcpStream,
    events_tx: broadcast::Sender<ChannelEvent>,
) -> (mpsc::UnboundedSender<String>, tokio::task::JoinHandle<()>) {
    let (read_half, mut write_half) = stream.into_split();
    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        while let Some(line) = write_rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let read_task = tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    let _ = events_tx.send(ChannelEvent::WorkerDisconnected("self".to_string()));
                    break;
                }
                Ok(_) => {
                    if let Ok(msg) = Message::from_line(&line) {
                        let _ = events_tx.send(ChannelEvent::Message(msg));
                    }
                }
                Err(e) => {
                    warn!(error = %e, "client read error");
                    let _ = events_tx.send(ChannelEvent::WorkerDisconnected("self".to_string()));
                    break;
                }
            }
        }
    });

    (write_tx, read_task)
}

async fn reconnect_loop(
    addr: std::net::SocketAddr,
    config: MessageChannelConfig,
    write_tx: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    events_tx: broadcast::Sender<ChannelEvent>,
) {
    let mut rx = events_tx.subscribe();
    loop {
        let Ok(event) = rx.recv().await else { break };
        if !matches!(event, ChannelEvent::WorkerDisconnected(_)) {
            continue;
        }

        let mut attempt = 1u32;
        loop {
            if attempt > config.max_reconnect_attempts {
                let _ = events_tx.send(ChannelEvent::Error("reconnect-failed".to_string()));
                break;
            }

            let delay = config.reconnect_delay_ms * 2u64.saturating_pow(attempt - 1);
            tokio::time::sleep(Duration::from_millis(delay)).await;

            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    debug!(attempt, "reconnected");
                    let (tx, _) = spawn_stream(stream, events_tx.clone());
                    *write_tx.lock().await = Some(tx);
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    attempt += 1;
                }
            }
        }
    }
}
