use std::fmt::Debug;

use async_trait::async_trait;
use postrider_common::envelope::Envelope;

use crate::error::SpoolError;

/// The durable mail queue collaborator.
///
/// The protocol engine depends only on these two operations: handing a
/// completed envelope over, and sampling queue depth for backpressure.
#[async_trait]
pub trait MailQueue: Debug + Send + Sync {
    /// Appends a message to the named queue.
    async fn enqueue(&self, queue: &str, envelope: &Envelope, body: &[u8])
    -> Result<(), SpoolError>;

    /// Returns the number of messages currently held in the named queue.
    async fn count(&self, queue: &str) -> usize;
}
