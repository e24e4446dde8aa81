//! Bounded inbound message queue. Backpressure is implicit in
//! [`tokio::sync::mpsc`]'s bounded channel: the reader task's
//! `sender.send(...).await` suspends exactly when `Queued >= C_in`, and is
//! woken the instant a worker drains a slot.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::codec::FrameCodec;
use crate::error::ProcessorError;
use crate::message::Message;
use crate::transport::{read_frame, TransportReader};

/// The ingress side of the message pump: one producer (the transport
/// reader), `W_in` consumers (workers draining into the router).
pub struct IngressQueue {
    sender: mpsc::Sender<Message>,
    receiver: Arc<Mutex<mpsc::Receiver<Message>>>,
}

impl IngressQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.sender.clone()
    }

    /// Dequeues the next message. Shared across `W_in` worker tasks; the
    /// mutex only guards the pop itself, not downstream handling, so workers
    /// overlap on message processing even though dequeue is serialized.
    pub async fn dequeue(&self) -> Option<Message> {
        self.receiver.lock().await.recv().await
    }
}

/// Reads frames off the transport, decodes them, and feeds the ingress
/// queue until the transport closes or a fatal decode error occurs. Returns
/// the terminating error, if any, so the caller can trigger fatal shutdown.
pub async fn run_reader<R, C>(
    mut reader: R,
    codec: Arc<C>,
    sender: mpsc::Sender<Message>,
    max_message_length: usize,
) -> Result<(), ProcessorError>
where
    R: TransportReader,
    C: FrameCodec,
{
    loop {
        let frame = match read_frame(&mut reader, max_message_length).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("transport closed cleanly at a frame boundary");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let message = codec.decode(&frame)?;
        // send().await is the backpressure point: it suspends exactly when
        // the bounded channel is full, and wakes the moment a worker frees a
        // slot by recv()-ing. No separate signal is needed.
        if sender.send(message).await.is_err() {
            debug!("ingress queue dropped: processor is shutting down");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dequeue_yields_messages_in_fifo_order() {
        let queue = IngressQueue::new(4);
        let tx = queue.sender();
        for id in 1..=3u64 {
            tx.send(Message::new(
                Some(id),
                1,
                crate::message::Payload::Cancel { target_id: id },
            ))
            .await
            .unwrap();
        }
        for id in 1..=3u64 {
            let got = queue.dequeue().await.unwrap();
            assert_eq!(got.id, Some(id));
        }
    }

    #[tokio::test]
    async fn full_queue_backpressures_the_sender() {
        let queue = IngressQueue::new(1);
        let tx = queue.sender();
        tx.send(Message::new(
            Some(1),
            1,
            crate::message::Payload::Cancel { target_id: 1 },
        ))
        .await
        .unwrap();

        let tx2 = tx.clone();
        let send_second = tokio::spawn(async move {
            tx2.send(Message::new(
                Some(2),
                1,
                crate::message::Payload::Cancel { target_id: 2 },
            ))
            .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!send_second.is_finished());

        queue.dequeue().await.unwrap();
        send_second.await.unwrap().unwrap();
    }
}
