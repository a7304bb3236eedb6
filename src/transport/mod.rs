//! Bidirectional channel to the remote model
//!
//! This module provides:
//! - The wire schema for outbound packets and inbound events
//! - The `Transport` trait the session controller drives
//! - A websocket implementation of that trait
//! - The bounded outbound queue that decouples capture from network speed

pub mod messages;
mod queue;
mod ws;

pub use messages::{pcm_mime_format, InboundEvent, OutboundMessage, Role};
pub use queue::OutboundQueue;
pub use ws::WsTransport;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::error::SessionError;
use crate::session::SessionConfig;

/// Message-oriented channel to the remote model.
///
/// `open` completes once the channel is ready to send and receive; inbound
/// events arrive on the returned receiver strictly in the order the remote
/// session sent them. `send` preserves call order. `close` is idempotent,
/// callable from any state, and always releases underlying resources.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn open(
        &mut self,
        config: &SessionConfig,
    ) -> Result<mpsc::Receiver<InboundEvent>, SessionError>;

    async fn send(&self, message: OutboundMessage) -> Result<(), SessionError>;

    async fn close(&mut self) -> Result<()>;
}
