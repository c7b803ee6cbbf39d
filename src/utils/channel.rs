// src/utils/channel.rs: named FIFO channels shared between tasks
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("no message arrived on channel '{0}' in time")]
    Timeout(String),

    #[error("channel '{0}' is closed")]
    Closed(String),

    #[error("wait on channel '{0}' was cancelled")]
    Cancelled(String),
}

/// Unbounded multi-producer FIFO queue.
/// Cloning a channel yields another handle to the same queue; any clone may `put`,
/// and consumers take turns on the shared receiver.
pub struct Channel<T> {
    name: Arc<str>,
    tx: UnboundedSender<T>,
    rx: Arc<AsyncMutex<UnboundedReceiver<T>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel {
            name: Arc::clone(&self.name),
            tx: self.tx.clone(),
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("name", &self.name).finish()
    }
}

impl<T: Send + 'static> Channel<T> {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Channel {
            name: Arc::from(name),
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends a message. Never blocks.
    pub fn put(&self, msg: T) {
        // The receiver lives inside this handle, so the queue cannot be closed under us.
        let _ = self.tx.send(msg);
    }

    /// Waits for the oldest unread message, up to `timeout` when one is given.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<T, ChannelError> {
        let recv = async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        };
        let msg = match timeout {
            Some(limit) => tokio::time::timeout(limit, recv)
                .await
                .map_err(|_| ChannelError::Timeout(self.name.to_string()))?,
            None => recv.await,
        };
        msg.ok_or_else(|| ChannelError::Closed(self.name.to_string()))
    }

    /// Like `get(None)`, but gives up as soon as `token` is cancelled.
    pub async fn get_or_cancel(&self, token: &CancellationToken) -> Result<T, ChannelError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(ChannelError::Cancelled(self.name.to_string())),
            msg = self.get(None) => msg,
        }
    }

    /// Returns a message only if one is already queued.
    pub fn try_get(&self) -> Option<T> {
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }
}

/// Name → channel lookup. Repeated lookups of one name return the same queue.
pub struct ChannelRegistry<T> {
    channels: Arc<Mutex<HashMap<String, Channel<T>>>>,
}

impl<T> Clone for ChannelRegistry<T> {
    fn clone(&self) -> Self {
        ChannelRegistry { channels: Arc::clone(&self.channels) }
    }
}

impl<T: Send + 'static> Default for ChannelRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> ChannelRegistry<T> {
    pub fn new() -> Self {
        ChannelRegistry { channels: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn get_or_create(&self, name: &str) -> Channel<T> {
        let mut channels = self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(name.to_string())
            .or_insert_with(|| Channel::new(name))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Channel<T>> {
        let channels = self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        channels.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.channels.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
