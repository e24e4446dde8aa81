//! Bounded priority outbound queue. A single writer task drains it and
//! writes one message at a time under the transport's exclusive write lock.
//! Ordering: descending `priority`, tiebreak ascending enqueue sequence,
//! tiebreak descending message id.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::FrameCodec;
use crate::error::ProcessorError;
use crate::message::{Message, Priority};
use crate::transport::{write_frame, TransportWriter};

struct EgressEntry {
    message: Message,
    priority: Priority,
    seq: u64,
    cancel: CancellationToken,
    completion: Option<oneshot::Sender<Result<(), ProcessorError>>>,
}

impl EgressEntry {
    fn sort_key(&self) -> (Priority, std::cmp::Reverse<u64>, u64) {
        (
            self.priority,
            std::cmp::Reverse(self.seq),
            self.message.id.unwrap_or(0),
        )
    }
}

impl PartialEq for EgressEntry {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}
impl Eq for EgressEntry {}
impl PartialOrd for EgressEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for EgressEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

struct Inner {
    heap: BinaryHeap<EgressEntry>,
    closed: bool,
}

/// The egress side of the message pump: many producers, one writer
/// consumer.
pub struct EgressQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    next_seq: AtomicU64,
    capacity: usize,
}

impl EgressQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                closed: false,
            }),
            notify: Notify::new(),
            next_seq: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Enqueues a message at the given priority. Returns a receiver that
    /// resolves once the writer has attempted to send it (or the queue is
    /// torn down first).
    pub async fn enqueue(
        &self,
        message: Message,
        priority: Priority,
        cancel: CancellationToken,
    ) -> oneshot::Receiver<Result<(), ProcessorError>> {
        let (tx, rx) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::SeqCst);
        let mut guard = self.inner.lock().await;
        if guard.closed {
            let _ = tx.send(Err(ProcessorError::disposed()));
            return rx;
        }
        while guard.heap.len() >= self.capacity {
            // Bounded: drop the lock and wait for the writer to make room.
            drop(guard);
            self.notify.notified().await;
            guard = self.inner.lock().await;
            if guard.closed {
                let _ = tx.send(Err(ProcessorError::disposed()));
                return rx;
            }
        }
        guard.heap.push(EgressEntry {
            message,
            priority,
            seq,
            cancel,
            completion: Some(tx),
        });
        drop(guard);
        self.notify.notify_waiters();
        rx
    }

    async fn pop(&self) -> Option<EgressEntry> {
        loop {
            let mut guard = self.inner.lock().await;
            if let Some(entry) = guard.heap.pop() {
                self.notify.notify_waiters();
                return Some(entry);
            }
            if guard.closed {
                return None;
            }
            drop(guard);
            self.notify.notified().await;
        }
    }

    /// Fails every pending entry with a disposed error and stops accepting
    /// new ones. Idempotent.
    pub async fn close(&self) {
        let mut guard = self.inner.lock().await;
        guard.closed = true;
        for mut entry in guard.heap.drain() {
            if let Some(tx) = entry.completion.take() {
                let _ = tx.send(Err(ProcessorError::disposed()));
            }
        }
        drop(guard);
        self.notify.notify_waiters();
    }
}

/// The single writer task: pops highest-priority entries and writes them to
/// the transport one at a time, holding implicit exclusive access to the
/// writer half for the whole serialize-then-write step.
pub async fn run_writer<W, C>(
    queue: Arc<EgressQueue>,
    mut writer: W,
    codec: Arc<C>,
    max_message_length: usize,
    flush_after_each: bool,
) where
    W: TransportWriter,
    C: FrameCodec,
{
    while let Some(mut entry) = queue.pop().await {
        if entry.cancel.is_cancelled() {
            if let Some(tx) = entry.completion.take() {
                let _ = tx.send(Err(ProcessorError::Canceled));
            }
            continue;
        }
        let result = encode_and_write(&entry.message, &mut writer, &codec, max_message_length, flush_after_each).await;
        if let Err(err) = &result {
            warn!("egress write failed: {err}");
        } else {
            debug!(kind = entry.message.payload.kind_name(), id = ?entry.message.id, "wrote message");
        }
        let failed = result.is_err();
        if let Some(tx) = entry.completion.take() {
            let _ = tx.send(result);
        }
        if failed {
            return;
        }
    }
}

async fn encode_and_write<W, C>(
    message: &Message,
    writer: &mut W,
    codec: &C,
    max_message_length: usize,
    flush: bool,
) -> Result<(), ProcessorError>
where
    W: TransportWriter,
    C: FrameCodec,
{
    let bytes = codec.encode(message)?;
    write_frame(writer, &bytes, max_message_length, flush).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;

    fn msg(id: u64) -> Message {
        Message::new(Some(id), 1, Payload::Cancel { target_id: id })
    }

    #[tokio::test]
    async fn higher_priority_pops_first_regardless_of_enqueue_order() {
        let queue = EgressQueue::new(8);
        queue.enqueue(msg(1), 1, CancellationToken::new()).await;
        queue.enqueue(msg(2), 10, CancellationToken::new()).await;
        let first = queue.pop().await.unwrap();
        assert_eq!(first.message.id, Some(2));
        let second = queue.pop().await.unwrap();
        assert_eq!(second.message.id, Some(1));
    }

    #[tokio::test]
    async fn equal_priority_breaks_tie_by_enqueue_order() {
        let queue = EgressQueue::new(8);
        queue.enqueue(msg(5), 5, CancellationToken::new()).await;
        queue.enqueue(msg(6), 5, CancellationToken::new()).await;
        let first = queue.pop().await.unwrap();
        assert_eq!(first.message.id, Some(5));
        let second = queue.pop().await.unwrap();
        assert_eq!(second.message.id, Some(6));
    }

    #[tokio::test]
    async fn close_fails_pending_entries_as_disposed() {
        let queue = Arc::new(EgressQueue::new(8));
        let rx = queue.enqueue(msg(1), 1, CancellationToken::new()).await;
        queue.close().await;
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(ProcessorError::Disposed)));
    }
}
