//! Newline-delimited JSON over local TCP with typed request/response
//! correlation and request-wait semantics.

mod client;
mod config;
mod message;
mod server;

pub use client::MessageClient;
pub use config::MessageChannelConfig;
pub use message::{Message, MessageType};
pub use server::{ChannelEvent, MessageChannelError, MessageServer, RemoteSink};
