use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;

use crate::hub::SubscriberId;

/// One observer's delivery channel
///
/// Envelopes arrive in publish order. The stream ends (`recv` returns `None`)
/// after the subscriber is unregistered, dropped for overflow, or the hub
/// stops; envelopes already in the outbox are still delivered first.
/// Dropping the subscription unregisters it.
#[derive(Debug)]
pub struct Subscription<T> {
    id: SubscriberId,
    outbox: mpsc::Receiver<Arc<T>>,
    leave: mpsc::UnboundedSender<SubscriberId>,
    left: bool,
}

impl<T> Subscription<T> {
    pub(crate) fn new(
        id: SubscriberId,
        outbox: mpsc::Receiver<Arc<T>>,
        leave: mpsc::UnboundedSender<SubscriberId>,
    ) -> Self {
        Self {
            id,
            outbox,
            leave,
            left: false,
        }
    }

    #[inline]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next envelope
    pub async fn recv(&mut self) -> Option<Arc<T>> {
        self.outbox.recv().await
    }

    /// Take an envelope if one is already pending
    pub fn try_recv(&mut self) -> Option<Arc<T>> {
        self.outbox.try_recv().ok()
    }

    /// Number of envelopes waiting in the outbox
    pub fn pending(&self) -> usize {
        self.outbox.len()
    }

    /// Leave the hub; calling it again is a no-op
    pub fn unregister(&mut self) {
        if !self.left {
            self.left = true;
            let _ = self.leave.send(self.id);
        }
    }

    /// Consume the subscription as a stream of envelopes
    pub fn into_stream(self) -> impl Stream<Item = Arc<T>> {
        futures::stream::unfold(self, |mut sub| async move {
            let item = sub.recv().await?;
            Some((item, sub))
        })
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unregister();
    }
}
