use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use postrider_common::envelope::Envelope;

use crate::{MailQueue, error::SpoolError};

/// A queued message as stored by the in-memory backends.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub envelope: Envelope,
    pub body: Vec<u8>,
}

/// In-memory queue backend.
///
/// Messages live until the process exits; suitable for relays that accept
/// and deliver within one lifetime, and for every test in this workspace.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    queues: DashMap<String, Vec<QueuedMessage>>,
}

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the named queue's contents.
    #[must_use]
    pub fn messages(&self, queue: &str) -> Vec<QueuedMessage> {
        self.queues
            .get(queue)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    /// Removes and returns everything currently in the named queue.
    #[must_use]
    pub fn drain(&self, queue: &str) -> Vec<QueuedMessage> {
        self.queues
            .get_mut(queue)
            .map(|mut entry| std::mem::take(entry.value_mut()))
            .unwrap_or_default()
    }
}

#[async_trait]
impl MailQueue for MemoryQueue {
    async fn enqueue(
        &self,
        queue: &str,
        envelope: &Envelope,
        body: &[u8],
    ) -> Result<(), SpoolError> {
        tracing::trace!(queue, bytes = body.len(), "Enqueueing message");

        self.queues
            .entry(queue.to_string())
            .or_default()
            .push(QueuedMessage {
                envelope: envelope.clone(),
                body: body.to_vec(),
            });

        Ok(())
    }

    async fn count(&self, queue: &str) -> usize {
        self.queues.get(queue).map_or(0, |entry| entry.len())
    }
}

/// Introspectable queue for tests, with failure injection.
#[derive(Debug, Default)]
pub struct TestQueue {
    inner: MemoryQueue,
    fail_enqueue: AtomicBool,
    count_overrides: DashMap<String, usize>,
}

impl TestQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `enqueue` fail with a store error.
    pub fn fail_next_enqueues(&self, fail: bool) {
        self.fail_enqueue.store(fail, Ordering::Relaxed);
    }

    /// Pins the reported depth of a queue without storing messages.
    pub fn set_count(&self, queue: &str, depth: usize) {
        self.count_overrides.insert(queue.to_string(), depth);
    }

    #[must_use]
    pub fn messages(&self, queue: &str) -> Vec<QueuedMessage> {
        self.inner.messages(queue)
    }
}

#[async_trait]
impl MailQueue for TestQueue {
    async fn enqueue(
        &self,
        queue: &str,
        envelope: &Envelope,
        body: &[u8],
    ) -> Result<(), SpoolError> {
        if self.fail_enqueue.load(Ordering::Relaxed) {
            return Err(SpoolError::StoreFailed("injected failure".to_string()));
        }

        self.inner.enqueue(queue, envelope, body).await
    }

    async fn count(&self, queue: &str) -> usize {
        if let Some(depth) = self.count_overrides.get(queue) {
            return *depth;
        }

        self.inner.count(queue).await
    }
}

#[cfg(test)]
mod test {
    use postrider_common::envelope::Envelope;

    use super::{MailQueue, MemoryQueue, TestQueue};
    use crate::INBOUND;

    fn envelope() -> Envelope {
        let mut envelope = Envelope::default();
        envelope.helo_host = Some("client.example.com".to_string());
        envelope
            .sender_mut()
            .replace(mailparse::addrparse("a@x.com").unwrap().remove(0));
        envelope
            .recipients_mut()
            .replace(mailparse::addrparse("b@y.com").unwrap());
        envelope
    }

    #[tokio::test]
    async fn enqueue_round_trip() {
        let queue = MemoryQueue::new();
        let body = b"Subject: hi\r\n\r\nhello\r\n";

        queue.enqueue(INBOUND, &envelope(), body).await.unwrap();

        assert_eq!(queue.count(INBOUND).await, 1);
        assert_eq!(queue.count("outbound").await, 0);

        let stored = queue.messages(INBOUND);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].body, body);

        let drained = queue.drain(INBOUND);
        assert_eq!(drained.len(), 1);
        assert_eq!(queue.count(INBOUND).await, 0);
        assert_eq!(
            stored[0].envelope.sender().map(ToString::to_string),
            Some("a@x.com".to_string())
        );
        assert_eq!(
            stored[0].envelope.recipients().map(ToString::to_string),
            Some("b@y.com".to_string())
        );
    }

    #[tokio::test]
    async fn injected_failure() {
        let queue = TestQueue::new();
        queue.fail_next_enqueues(true);

        let result = queue.enqueue(INBOUND, &envelope(), b"body").await;
        assert!(result.is_err());
        assert_eq!(queue.count(INBOUND).await, 0);

        queue.fail_next_enqueues(false);
        queue.enqueue(INBOUND, &envelope(), b"body").await.unwrap();
        assert_eq!(queue.count(INBOUND).await, 1);
    }
}
