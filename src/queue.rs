//! The command queue bounding concurrent SSH `exec` channels.
//!
//! Every command dispatched to a session's SSH connection — foreground,
//! background, or the shell's monitoring loop — passes through a single
//! process-wide queue. This caps how many `exec` channels are open on a
//! remote host at once (avoiding `MaxSessions` rejections) and enforces a
//! fixed delay between successive command starts.
//!
//! Entries are released strictly FIFO. A bounded backlog protects the
//! gateway itself: past [`QueueConfig::max_pending`] queued entries,
//! [`CommandQueue::enqueue`] rejects new work with [`QueueError::Full`]
//! instead of growing without bound.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::config;

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub inter_command_delay: Duration,
    pub max_pending: usize,
}

impl QueueConfig {
    pub fn from_env() -> Self {
        Self {
            max_concurrent: config::resolve_queue_max_concurrent(None),
            inter_command_delay: Duration::from_millis(config::resolve_queue_inter_command_delay_ms(None)),
            max_pending: config::resolve_queue_max_pending(None),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("command queue is full ({pending}/{max} pending entries)")]
    Full { pending: usize, max: usize },
    #[error("queue entry was cancelled")]
    Cancelled,
}

/// Priority used to order work sharing the queue's concurrency budget.
///
/// Foreground commands and the shell's background monitoring loop are both
/// dispatched through the queue; `Background` entries never starve
/// `Foreground` ones because the queue is still strict FIFO — priority here
/// only documents intent, not a separate lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Foreground,
    Background,
}

struct Entry {
    id: u64,
    session_id: String,
    #[allow(dead_code)]
    priority: Priority,
}

struct Inner {
    pending: VecDeque<Entry>,
    running: usize,
}

/// FIFO queue bounding concurrent `exec` channels across all sessions.
pub struct CommandQueue {
    config: QueueConfig,
    inner: Mutex<Inner>,
    notify: Notify,
    next_id: AtomicU64,
}

/// RAII guard returned by [`CommandQueue::enqueue`]; dropping it releases the
/// queue slot and, after [`QueueConfig::inter_command_delay`], admits the next
/// pending entry.
pub struct QueueSlot {
    queue: Arc<CommandQueue>,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            queue.release().await;
        });
    }
}

impl CommandQueue {
    pub fn new(config: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                running: 0,
            }),
            notify: Notify::new(),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> (usize, usize) {
        // best-effort snapshot; exact values may race with concurrent callers
        match self.inner.try_lock() {
            Ok(inner) => (inner.running, inner.pending.len()),
            Err(_) => (0, 0),
        }
    }

    /// Waits for a queue slot, enforcing both the concurrency cap and the
    /// inter-command delay, and returns a guard that frees the slot on drop.
    pub async fn enqueue(
        self: &Arc<Self>,
        session_id: &str,
        priority: Priority,
    ) -> Result<QueueSlot, QueueError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = self.inner.lock().await;
            if inner.pending.len() >= self.config.max_pending {
                return Err(QueueError::Full {
                    pending: inner.pending.len(),
                    max: self.config.max_pending,
                });
            }
            inner.pending.push_back(Entry {
                id,
                session_id: session_id.to_string(),
                priority,
            });
        }

        loop {
            {
                let mut inner = self.inner.lock().await;
                let still_queued = inner.pending.iter().any(|e| e.id == id);
                if !still_queued {
                    return Err(QueueError::Cancelled);
                }
                let at_front = inner.pending.front().map(|e| e.id == id).unwrap_or(false);
                if at_front && inner.running < self.config.max_concurrent {
                    inner.pending.pop_front();
                    inner.running += 1;
                    debug!(session_id, running = inner.running, "command queue slot granted");
                    return Ok(QueueSlot { queue: self.clone() });
                }
            }
            self.notify.notified().await;
        }
    }

    /// Clears every pending entry belonging to a session, used on disconnect
    /// so a torn-down session's queued commands never run.
    pub async fn clear_session(&self, session_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.pending.retain(|e| e.session_id != session_id);
        self.notify.notify_waiters();
    }

    async fn release(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.running = inner.running.saturating_sub(1);
        }
        tokio::time::sleep(self.config.inter_command_delay).await;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> QueueConfig {
        QueueConfig {
            max_concurrent: 1,
            inter_command_delay: Duration::from_millis(1),
            max_pending: 2,
        }
    }

    #[tokio::test]
    async fn test_single_slot_granted_immediately() {
        let queue = CommandQueue::new(test_config());
        let slot = queue.enqueue("s1", Priority::Foreground).await.unwrap();
        drop(slot);
    }

    #[tokio::test]
    async fn test_fifo_order_across_sessions() {
        let queue = CommandQueue::new(test_config());
        let slot1 = queue.enqueue("s1", Priority::Foreground).await.unwrap();

        let queue2 = queue.clone();
        let handle = tokio::spawn(async move { queue2.enqueue("s2", Priority::Foreground).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(slot1);

        let slot2 = handle.await.unwrap().unwrap();
        drop(slot2);
    }

    #[tokio::test]
    async fn test_backpressure_rejects_past_max_pending() {
        let queue = CommandQueue::new(test_config());
        // Holds the only concurrency slot so later enqueues pile up in `pending`.
        let slot1 = queue.enqueue("s1", Priority::Foreground).await.unwrap();

        let queue2 = queue.clone();
        let h2 = tokio::spawn(async move { queue2.enqueue("s2", Priority::Foreground).await });
        let queue3 = queue.clone();
        let h3 = tokio::spawn(async move { queue3.enqueue("s3", Priority::Foreground).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // max_pending is 2 and both s2/s3 are already queued, so s4 is rejected outright.
        let result = queue.enqueue("s4", Priority::Foreground).await;
        assert!(matches!(result, Err(QueueError::Full { .. })));

        drop(slot1);
        h2.await.unwrap().unwrap();
        h3.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_clear_session_cancels_pending_entry() {
        let queue = CommandQueue::new(test_config());
        let slot1 = queue.enqueue("s1", Priority::Foreground).await.unwrap();
        let queue2 = queue.clone();
        let handle = tokio::spawn(async move { queue2.enqueue("s2", Priority::Background).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.clear_session("s2").await;
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(QueueError::Cancelled)));
        drop(slot1);
    }
}
