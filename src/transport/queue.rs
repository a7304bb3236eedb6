use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::warn;

use super::messages::OutboundMessage;

/// Bounded queue between the capture loop and the transport sender.
///
/// Capture pushes at hardware rate and must never block, so when the network
/// falls behind the queue drops the *oldest* unsent packet: transmitted audio
/// gets an occasional gap, but capture keeps running in real time.
pub struct OutboundQueue {
    inner: Mutex<VecDeque<OutboundMessage>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be > 0");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a message, evicting the oldest one if the queue is full.
    pub fn push(&self, message: OutboundMessage) {
        {
            let mut queue = self.inner.lock().expect("outbound queue lock poisoned");
            if queue.len() == self.capacity {
                queue.pop_front();
                let total = self.dropped.fetch_add(1, Ordering::SeqCst) + 1;
                warn!("Outbound queue full, dropped oldest packet ({} total)", total);
            }
            queue.push_back(message);
        }
        self.notify.notify_one();
    }

    /// Wait for and remove the oldest queued message.
    pub async fn pop(&self) -> OutboundMessage {
        loop {
            {
                let mut queue = self.inner.lock().expect("outbound queue lock poisoned");
                if let Some(message) = queue.pop_front() {
                    return message;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Remove the oldest queued message without waiting.
    pub fn try_pop(&self) -> Option<OutboundMessage> {
        self.inner
            .lock()
            .expect("outbound queue lock poisoned")
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("outbound queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Packets evicted because the transport could not keep up.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }
}
